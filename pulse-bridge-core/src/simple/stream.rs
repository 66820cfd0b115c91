use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::models::config::validate_native_string;
use crate::models::error::BridgeError;
use crate::models::sample::{BufferAttributes, SampleSpec, StreamDirection};
use crate::native::handle::NativeHandle;
use crate::traits::simple_api::{SimpleApi, SimpleStreamParams};

/// Configuration for a blocking byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleStreamConfiguration {
    pub application_name: String,
    pub stream_name: String,
    pub direction: StreamDirection,
    pub sample_spec: SampleSpec,
    /// Server address, or None for the default server.
    pub server: Option<String>,
    /// Sink or source name, or None for the default device.
    pub device: Option<String>,
    pub buffer_attributes: Option<BufferAttributes>,
}

impl SimpleStreamConfiguration {
    pub fn playback(application_name: impl Into<String>, sample_spec: SampleSpec) -> Self {
        Self {
            application_name: application_name.into(),
            stream_name: "Playback".into(),
            direction: StreamDirection::Playback,
            sample_spec,
            server: None,
            device: None,
            buffer_attributes: None,
        }
    }

    pub fn record(application_name: impl Into<String>, sample_spec: SampleSpec) -> Self {
        Self {
            stream_name: "Record".into(),
            direction: StreamDirection::Record,
            ..Self::playback(application_name, sample_spec)
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_native_string("application name", &self.application_name)?;
        validate_native_string("stream name", &self.stream_name)?;
        if self.sample_spec.rate == 0 {
            return Err("sample rate must be positive".into());
        }
        if self.sample_spec.channels == 0 {
            return Err("channel count must be positive".into());
        }
        for value in [&self.server, &self.device].into_iter().flatten() {
            validate_native_string("server/device", value)?;
        }
        Ok(())
    }
}

/// Blocking, unbuffered byte stream to or from the server.
///
/// A direct pass-through to the native simple API: no mainloop, no
/// callbacks. Every call blocks the calling thread.
pub struct SimpleStream<A: SimpleApi> {
    api: Arc<A>,
    handle: NativeHandle,
    direction: StreamDirection,
}

impl<A: SimpleApi> SimpleStream<A> {
    pub fn open(api: Arc<A>, config: &SimpleStreamConfiguration) -> Result<Self, BridgeError> {
        config.validate().map_err(BridgeError::ConfigurationFailed)?;

        let params = SimpleStreamParams {
            server: config.server.as_deref(),
            application_name: &config.application_name,
            direction: config.direction,
            device: config.device.as_deref(),
            stream_name: &config.stream_name,
            sample_spec: config.sample_spec,
            buffer_attributes: config.buffer_attributes,
        };

        let free_api = Arc::clone(&api);
        let handle = NativeHandle::acquire(
            "simple stream",
            || {
                api.simple_new(&params).map_err(|code| {
                    let message = format!(
                        "failed to initialize the connection to the server: {}",
                        api.strerror(code)
                    );
                    log::error!("{}", message);
                    BridgeError::Native {
                        call: "simple_new",
                        message,
                    }
                })
            },
            move |raw| free_api.simple_free(raw),
        )?;

        log::debug!(
            "opened {:?} stream '{}' ({:?})",
            config.direction,
            config.stream_name,
            config.sample_spec
        );
        Ok(Self {
            api,
            handle,
            direction: config.direction,
        })
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    /// Write all of `data`, blocking until the server accepted it.
    pub fn write_samples(&self, data: &[u8]) -> Result<(), BridgeError> {
        if !self.direction.can_write() {
            return Err(BridgeError::Unsupported("writing"));
        }
        self.api
            .simple_write(self.handle.raw(), data)
            .map_err(|code| self.native_error("simple_write", code))
    }

    /// Fill `buffer` completely, blocking until enough data was recorded.
    pub fn read_samples(&self, buffer: &mut [u8]) -> Result<(), BridgeError> {
        if !self.direction.can_read() {
            return Err(BridgeError::Unsupported("reading"));
        }
        self.api
            .simple_read(self.handle.raw(), buffer)
            .map_err(|code| self.native_error("simple_read", code))
    }

    /// Block until everything written has been played.
    pub fn drain(&self) -> Result<(), BridgeError> {
        self.api
            .simple_drain(self.handle.raw())
            .map_err(|code| self.native_error("simple_drain", code))
    }

    /// Throw away data buffered on the server side.
    pub fn discard(&self) -> Result<(), BridgeError> {
        self.api
            .simple_flush(self.handle.raw())
            .map_err(|code| self.native_error("simple_flush", code))
    }

    pub fn latency(&self) -> Result<Duration, BridgeError> {
        self.api
            .simple_get_latency(self.handle.raw())
            .map(Duration::from_micros)
            .map_err(|code| self.native_error("simple_get_latency", code))
    }

    fn native_error(&self, call: &'static str, code: i32) -> BridgeError {
        let message = self.api.strerror(code);
        log::error!("{} failed: {} ({})", call, message, code);
        BridgeError::Native { call, message }
    }
}

impl<A: SimpleApi> io::Write for SimpleStream<A> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_samples(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }

    /// Drains: returns once the written audio has been played.
    fn flush(&mut self) -> io::Result<()> {
        self.drain().map_err(into_io_error)
    }
}

impl<A: SimpleApi> io::Read for SimpleStream<A> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_samples(buf).map_err(into_io_error)?;
        Ok(buf.len())
    }
}

fn into_io_error(error: BridgeError) -> io::Error {
    match error {
        BridgeError::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, error),
        other => io::Error::other(other),
    }
}
