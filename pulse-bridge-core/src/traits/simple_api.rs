use crate::models::sample::{BufferAttributes, SampleSpec, StreamDirection};
use crate::native::handle::RawHandle;

/// Parameters for opening a blocking byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleStreamParams<'a> {
    pub server: Option<&'a str>,
    pub application_name: &'a str,
    pub direction: StreamDirection,
    pub device: Option<&'a str>,
    pub stream_name: &'a str,
    pub sample_spec: SampleSpec,
    pub buffer_attributes: Option<BufferAttributes>,
}

/// Function table of the blocking "simple" stream library.
///
/// Errors are native error codes, to be turned into text with `strerror`.
/// Every call blocks the calling thread; none of them involve the mainloop.
pub trait SimpleApi: Send + Sync + 'static {
    fn simple_new(&self, params: &SimpleStreamParams<'_>) -> Result<RawHandle, i32>;

    fn simple_free(&self, stream: RawHandle);

    fn simple_write(&self, stream: RawHandle, data: &[u8]) -> Result<(), i32>;

    /// Fill `buffer` completely.
    fn simple_read(&self, stream: RawHandle, buffer: &mut [u8]) -> Result<(), i32>;

    /// Block until all written data has been played.
    fn simple_drain(&self, stream: RawHandle) -> Result<(), i32>;

    /// Discard buffered data.
    fn simple_flush(&self, stream: RawHandle) -> Result<(), i32>;

    /// Playback or record latency in microseconds.
    fn simple_get_latency(&self, stream: RawHandle) -> Result<u64, i32>;

    fn strerror(&self, code: i32) -> String;
}
