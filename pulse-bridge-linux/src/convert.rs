//! Conversions between libpulse's C values and the core models.
//!
//! The string helpers build without libpulse. The enum mappings are written
//! against libpulse-sys and come with the `libpulse` feature.

use std::ffi::{c_char, CStr, CString};

#[cfg(all(target_os = "linux", feature = "libpulse"))]
pub use self::sys::*;

/// Convert a string for the C API. Strings are validated before they get
/// here, so an interior NUL is logged and reported as `None`.
pub fn to_c_string(what: &str, value: &str) -> Option<CString> {
    match CString::new(value) {
        Ok(converted) => Some(converted),
        Err(_) => {
            log::error!("{} contains a NUL byte", what);
            None
        }
    }
}

/// Copy a C string owned by libpulse. Null maps to `None`.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for the
/// duration of the call.
pub unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

#[cfg(all(target_os = "linux", feature = "libpulse"))]
mod sys {
    use libpulse_sys as pa;

    use pulse_bridge_core::models::config::ContextFlags;
    use pulse_bridge_core::models::sample::{SampleFormat, StreamDirection};
    use pulse_bridge_core::models::state::{ContextState, OperationState};

    pub fn context_state_from_sys(state: pa::pa_context_state_t) -> ContextState {
        match state {
            pa::PA_CONTEXT_UNCONNECTED => ContextState::Disconnected,
            pa::PA_CONTEXT_CONNECTING => ContextState::Connecting,
            pa::PA_CONTEXT_AUTHORIZING => ContextState::Authorizing,
            pa::PA_CONTEXT_SETTING_NAME => ContextState::SettingName,
            pa::PA_CONTEXT_READY => ContextState::Ready,
            pa::PA_CONTEXT_FAILED => ContextState::Failed,
            pa::PA_CONTEXT_TERMINATED => ContextState::Terminated,
            #[allow(unreachable_patterns)]
            other => {
                log::warn!("unknown context state {:?}, treating as failed", other);
                ContextState::Failed
            }
        }
    }

    pub fn operation_state_from_sys(state: pa::pa_operation_state_t) -> OperationState {
        match state {
            pa::PA_OPERATION_RUNNING => OperationState::Running,
            pa::PA_OPERATION_DONE => OperationState::Done,
            pa::PA_OPERATION_CANCELLED => OperationState::Cancelled,
            #[allow(unreachable_patterns)]
            other => {
                log::warn!("unknown operation state {:?}, treating as cancelled", other);
                OperationState::Cancelled
            }
        }
    }

    pub fn direction_to_sys(direction: StreamDirection) -> pa::pa_stream_direction_t {
        match direction {
            StreamDirection::Playback => pa::PA_STREAM_PLAYBACK,
            StreamDirection::Record => pa::PA_STREAM_RECORD,
            StreamDirection::Upload => pa::PA_STREAM_UPLOAD,
        }
    }

    pub fn context_flags_to_sys(flags: ContextFlags) -> pa::pa_context_flags_t {
        let mut raw = pa::PA_CONTEXT_NOFLAGS;
        if flags.contains(ContextFlags::NOAUTOSPAWN) {
            raw |= pa::PA_CONTEXT_NOAUTOSPAWN;
        }
        if flags.contains(ContextFlags::NOFAIL) {
            raw |= pa::PA_CONTEXT_NOFAIL;
        }
        raw
    }

    const SAMPLE_FORMATS: [(SampleFormat, pa::pa_sample_format_t); 13] = [
        (SampleFormat::U8, pa::PA_SAMPLE_U8),
        (SampleFormat::ALaw, pa::PA_SAMPLE_ALAW),
        (SampleFormat::ULaw, pa::PA_SAMPLE_ULAW),
        (SampleFormat::S16Le, pa::PA_SAMPLE_S16LE),
        (SampleFormat::S16Be, pa::PA_SAMPLE_S16BE),
        (SampleFormat::Float32Le, pa::PA_SAMPLE_FLOAT32LE),
        (SampleFormat::Float32Be, pa::PA_SAMPLE_FLOAT32BE),
        (SampleFormat::S32Le, pa::PA_SAMPLE_S32LE),
        (SampleFormat::S32Be, pa::PA_SAMPLE_S32BE),
        (SampleFormat::S24Le, pa::PA_SAMPLE_S24LE),
        (SampleFormat::S24Be, pa::PA_SAMPLE_S24BE),
        (SampleFormat::S24In32Le, pa::PA_SAMPLE_S24_32LE),
        (SampleFormat::S24In32Be, pa::PA_SAMPLE_S24_32BE),
    ];

    pub fn sample_format_to_sys(format: SampleFormat) -> pa::pa_sample_format_t {
        SAMPLE_FORMATS
            .iter()
            .find(|(model, _)| *model == format)
            .map_or(pa::PA_SAMPLE_INVALID, |(_, raw)| *raw)
    }

    pub fn sample_format_from_sys(raw: pa::pa_sample_format_t) -> SampleFormat {
        SAMPLE_FORMATS
            .iter()
            .find(|(_, candidate)| *candidate == raw)
            .map_or(SampleFormat::Invalid, |(model, _)| *model)
    }

}
