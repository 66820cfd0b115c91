//! [`SimpleApi`] over libpulse-simple, through the libpulse-simple-sys bindings.

use std::ffi::{c_int, c_void, CString};
use std::ptr;

use libpulse_simple_sys as simple;
use libpulse_sys as pa;

use pulse_bridge_core::models::sample::BufferAttributes;
use pulse_bridge_core::native::handle::RawHandle;
use pulse_bridge_core::traits::simple_api::{SimpleApi, SimpleStreamParams};

use crate::convert;

/// PA_ERR_INVALID, reported for strings that cannot cross into C.
const ERR_INVALID: i32 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub struct LibPulseSimple;

impl LibPulseSimple {
    pub fn new() -> Self {
        Self
    }
}

fn stream_ptr(raw: RawHandle) -> *mut simple::pa_simple {
    raw.as_ptr()
}

fn optional_c_string(what: &str, value: Option<&str>) -> Result<Option<CString>, i32> {
    value
        .map(|value| convert::to_c_string(what, value).ok_or(ERR_INVALID))
        .transpose()
}

fn buffer_attr(attributes: &BufferAttributes) -> pa::pa_buffer_attr {
    pa::pa_buffer_attr {
        maxlength: attributes.max_length,
        tlength: attributes.target_length,
        prebuf: attributes.pre_buffering,
        minreq: attributes.minimum_request,
        fragsize: attributes.fragment_size,
    }
}

/// Map a libpulse-simple status to a result, reading the error out-parameter.
fn check(status: c_int, error: c_int) -> Result<(), i32> {
    if status < 0 {
        Err(error)
    } else {
        Ok(())
    }
}

impl SimpleApi for LibPulseSimple {
    fn simple_new(&self, params: &SimpleStreamParams<'_>) -> Result<RawHandle, i32> {
        let server = optional_c_string("server", params.server)?;
        let device = optional_c_string("device", params.device)?;
        let name = convert::to_c_string("application name", params.application_name)
            .ok_or(ERR_INVALID)?;
        let stream_name =
            convert::to_c_string("stream name", params.stream_name).ok_or(ERR_INVALID)?;

        let spec = pa::pa_sample_spec {
            format: convert::sample_format_to_sys(params.sample_spec.format),
            rate: params.sample_spec.rate,
            channels: params.sample_spec.channels,
        };
        let attr = params.buffer_attributes.as_ref().map(buffer_attr);

        let mut error: c_int = 0;
        let stream = unsafe {
            simple::pa_simple_new(
                server.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                name.as_ptr(),
                convert::direction_to_sys(params.direction),
                device.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                stream_name.as_ptr(),
                &spec,
                ptr::null(),
                attr.as_ref().map_or(ptr::null(), |a| a as *const pa::pa_buffer_attr),
                &mut error,
            )
        };
        RawHandle::from_ptr(stream).ok_or(error)
    }

    fn simple_free(&self, stream: RawHandle) {
        unsafe { simple::pa_simple_free(stream_ptr(stream)) }
    }

    fn simple_write(&self, stream: RawHandle, data: &[u8]) -> Result<(), i32> {
        let mut error: c_int = 0;
        let status = unsafe {
            simple::pa_simple_write(
                stream_ptr(stream),
                data.as_ptr() as *const c_void,
                data.len(),
                &mut error,
            )
        };
        check(status, error)
    }

    fn simple_read(&self, stream: RawHandle, buffer: &mut [u8]) -> Result<(), i32> {
        let mut error: c_int = 0;
        let status = unsafe {
            simple::pa_simple_read(
                stream_ptr(stream),
                buffer.as_mut_ptr() as *mut c_void,
                buffer.len(),
                &mut error,
            )
        };
        check(status, error)
    }

    fn simple_drain(&self, stream: RawHandle) -> Result<(), i32> {
        let mut error: c_int = 0;
        let status = unsafe { simple::pa_simple_drain(stream_ptr(stream), &mut error) };
        check(status, error)
    }

    fn simple_flush(&self, stream: RawHandle) -> Result<(), i32> {
        let mut error: c_int = 0;
        let status = unsafe { simple::pa_simple_flush(stream_ptr(stream), &mut error) };
        check(status, error)
    }

    fn simple_get_latency(&self, stream: RawHandle) -> Result<u64, i32> {
        let mut error: c_int = 0;
        let latency = unsafe { simple::pa_simple_get_latency(stream_ptr(stream), &mut error) };
        if latency == pa::pa_usec_t::MAX {
            Err(error)
        } else {
            Ok(latency)
        }
    }

    fn strerror(&self, code: i32) -> String {
        unsafe { convert::from_c_string(pa::pa_strerror(code)) }
            .unwrap_or_else(|| format!("error {}", code))
    }
}
