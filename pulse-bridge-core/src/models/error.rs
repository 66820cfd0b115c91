use thiserror::Error;

use super::state::ContextState;

/// Errors surfaced by the bridge to the immediate caller.
///
/// Protocol failures during a handshake are not reported here; they resolve
/// the pending future as [`Cancelled`] instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("failed to allocate native {0}")]
    Allocation(&'static str),

    #[error("mainloop failed to start: {0}")]
    MainloopStart(String),

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("a connect or disconnect is already in progress")]
    ConnectInProgress,

    #[error("context is not reusable in state {0:?}")]
    ContextUnusable(ContextState),

    #[error("context is not ready (state {0:?})")]
    NotReady(ContextState),

    #[error("{0} is not supported on this stream")]
    Unsupported(&'static str),

    #[error("{call} failed: {message}")]
    Native { call: &'static str, message: String },
}

/// Terminal outcome of a future whose request was cancelled, failed during
/// the handshake, or was dropped before it could complete.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("operation was cancelled")]
pub struct Cancelled;
