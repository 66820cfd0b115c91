use std::sync::Arc;

use crate::models::config::ContextFlags;
use crate::models::server_info::ServerInfo;
use crate::models::state::{ContextState, OperationState};
use crate::native::handle::RawHandle;

/// Context state notifier. Receives the state read right after the change.
pub type ContextStateCallback = Arc<dyn Fn(ContextState) + Send + Sync + 'static>;

/// Operation state notifier. Receives the state read right after the change.
pub type OperationStateCallback = Arc<dyn Fn(OperationState) + Send + Sync + 'static>;

/// One-shot completion of a server-info request.
pub type ServerInfoCallback = Box<dyn FnOnce(ServerInfo) + Send + 'static>;

/// Function table of the native protocol library.
///
/// Implemented by:
/// - `LibPulse` (pulse-bridge-linux, over libpulse)
/// - `FakePulse` (the `testing` feature, in-process)
///
/// Unless stated otherwise, calls that take an object handle must be made
/// while holding the owning mainloop's lock, or from the event-loop thread.
/// Every callback is invoked on the event-loop thread with the loop locked;
/// callbacks must not block and must not try to lock the loop.
pub trait PulseApi: Send + Sync + 'static {
    // --- Threaded mainloop ---

    fn mainloop_new(&self) -> Option<RawHandle>;

    fn mainloop_free(&self, mainloop: RawHandle);

    /// Start the event-loop thread. Negative on failure.
    fn mainloop_start(&self, mainloop: RawHandle) -> i32;

    /// Terminate the event-loop thread. Must not be called with the lock held.
    fn mainloop_stop(&self, mainloop: RawHandle);

    fn mainloop_lock(&self, mainloop: RawHandle);

    fn mainloop_unlock(&self, mainloop: RawHandle);

    /// Release the lock, block until signalled, then reacquire the lock.
    fn mainloop_wait(&self, mainloop: RawHandle);

    /// Wake every thread blocked in `mainloop_wait`. With `wait_for_accept`,
    /// block (with the lock released) until one of them calls `mainloop_accept`.
    fn mainloop_signal(&self, mainloop: RawHandle, wait_for_accept: bool);

    fn mainloop_accept(&self, mainloop: RawHandle);

    /// Whether the calling thread is the event-loop thread. Thread-safe.
    fn mainloop_in_thread(&self, mainloop: RawHandle) -> bool;

    /// The abstract mainloop vtable handed to `context_new`.
    fn mainloop_get_api(&self, mainloop: RawHandle) -> RawHandle;

    fn mainloop_set_name(&self, mainloop: RawHandle, name: &str);

    fn mainloop_get_retval(&self, mainloop: RawHandle) -> i32;

    // --- Context ---

    fn context_new(&self, mainloop_api: RawHandle, application_name: &str) -> Option<RawHandle>;

    fn context_unref(&self, context: RawHandle);

    /// Issue the connect request. A non-negative status only means the call
    /// was issued; the outcome arrives through state changes.
    fn context_connect(&self, context: RawHandle, server: Option<&str>, flags: ContextFlags) -> i32;

    fn context_disconnect(&self, context: RawHandle);

    fn context_get_state(&self, context: RawHandle) -> ContextState;

    /// Last error code recorded on the context.
    fn context_errno(&self, context: RawHandle) -> i32;

    /// Install (or with None, clear) the single state notifier.
    fn context_set_state_callback(&self, context: RawHandle, callback: Option<ContextStateCallback>);

    /// Request server information. Returns an operation carrying one
    /// reference owned by the caller, or None if the request could not be issued.
    fn context_get_server_info(
        &self,
        context: RawHandle,
        callback: ServerInfoCallback,
    ) -> Option<RawHandle>;

    // --- Operation ---

    fn operation_ref(&self, operation: RawHandle) -> RawHandle;

    fn operation_unref(&self, operation: RawHandle);

    fn operation_cancel(&self, operation: RawHandle);

    fn operation_get_state(&self, operation: RawHandle) -> OperationState;

    fn operation_set_state_callback(
        &self,
        operation: RawHandle,
        callback: Option<OperationStateCallback>,
    );

    // --- Errors ---

    /// Human-readable message for a native error code. Thread-safe.
    fn strerror(&self, code: i32) -> String;
}
