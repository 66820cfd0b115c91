use std::convert::Infallible;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mainloop::threaded::{LoopGuard, Mainloop};
use crate::models::state::OperationState;
use crate::native::handle::{NativeHandle, RawHandle};
use crate::traits::native_api::{OperationStateCallback, PulseApi};

/// Handle to one in-flight request.
///
/// Holds one native reference; the native layer keeps its own while the
/// request is pending, so dropping this never aborts the request. Cloning
/// takes another native reference.
pub struct Operation<A: PulseApi> {
    mainloop: Arc<Mainloop<A>>,
    handle: NativeHandle,
}

impl<A: PulseApi> Operation<A> {
    /// Adopt a reference returned by a request call.
    pub(crate) fn from_raw(mainloop: Arc<Mainloop<A>>, raw: RawHandle) -> Self {
        let api = Arc::clone(mainloop.api());
        let handle = match NativeHandle::acquire::<Infallible, _, _>(
            "operation",
            || Ok(raw),
            move |raw| api.operation_unref(raw),
        ) {
            Ok(handle) => handle,
            Err(never) => match never {},
        };
        Self { mainloop, handle }
    }

    pub fn state(&self) -> OperationState {
        let guard = self.mainloop.acquire_lock();
        self.state_locked(&guard)
    }

    pub fn state_locked(&self, guard: &LoopGuard<'_, A>) -> OperationState {
        self.mainloop.check_guard(guard);
        self.api().operation_get_state(self.handle.raw())
    }

    /// Request cancellation. Work already in flight is not interrupted, but
    /// the completion callback observes `Cancelled` and the result callback
    /// never fires. No-op once the operation has finished.
    pub fn cancel(&self) {
        let guard = self.mainloop.acquire_lock();
        self.cancel_locked(&guard);
    }

    pub fn cancel_locked(&self, guard: &LoopGuard<'_, A>) {
        if self.state_locked(guard) != OperationState::Running {
            return;
        }
        log::debug!("cancelling operation {:?}", self.handle.raw());
        self.api().operation_cancel(self.handle.raw());
    }

    /// Register `callback` to run exactly once with the terminal state
    /// (`Done` or `Cancelled`). Replaces any previous completion callback.
    ///
    /// Runs on the event thread, or on the cancelling thread for an explicit
    /// cancel. Runs immediately if the operation has already finished.
    pub fn set_completion_callback(
        &self,
        callback: impl FnOnce(OperationState) + Send + 'static,
    ) {
        let guard = self.mainloop.acquire_lock();
        self.set_completion_callback_locked(&guard, callback);
    }

    pub fn set_completion_callback_locked(
        &self,
        guard: &LoopGuard<'_, A>,
        callback: impl FnOnce(OperationState) + Send + 'static,
    ) {
        self.mainloop.check_guard(guard);

        let slot: Mutex<Option<Box<dyn FnOnce(OperationState) + Send>>> =
            Mutex::new(Some(Box::new(callback)));
        let notify: OperationStateCallback = Arc::new(move |state: OperationState| {
            if !state.is_terminal() {
                return;
            }
            if let Some(callback) = slot.lock().take() {
                log::debug!("operation finished: {:?}", state);
                callback(state);
            }
        });

        let raw = self.handle.raw();
        self.api().operation_set_state_callback(raw, Some(Arc::clone(&notify)));

        let current = self.api().operation_get_state(raw);
        if current.is_terminal() {
            notify(current);
        }
    }

    fn api(&self) -> &Arc<A> {
        self.mainloop.api()
    }
}

impl<A: PulseApi> Clone for Operation<A> {
    fn clone(&self) -> Self {
        let api = Arc::clone(self.api());
        let raw = self.mainloop.serialized(|| api.operation_ref(self.handle.raw()));
        Self::from_raw(Arc::clone(&self.mainloop), raw)
    }
}

impl<A: PulseApi> Drop for Operation<A> {
    fn drop(&mut self) {
        let handle = &mut self.handle;
        self.mainloop.serialized(|| {
            handle.release();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::connection::Context;
    use crate::testing::FakePulse;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Fixture {
        api: Arc<FakePulse>,
        context: Context<FakePulse>,
    }

    fn connected() -> Fixture {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        let context = Context::new(&mainloop, "operation-test").unwrap();
        context.connect_async().unwrap().wait().unwrap();
        Fixture { api, context }
    }

    #[test]
    fn completes_with_done() {
        let fixture = connected();
        fixture.api.hold_replies(true);
        let (operation, completion) = fixture.context.request_server_info().unwrap();
        let (tx, rx) = mpsc::channel();
        operation.set_completion_callback(move |state| tx.send(state).unwrap());

        fixture.api.flush_replies();

        assert!(completion.wait().is_ok());
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            OperationState::Done
        );
        assert_eq!(operation.state(), OperationState::Done);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn cancel_before_completion_reports_cancelled_once() {
        let fixture = connected();
        fixture.api.hold_replies(true);
        let (operation, completion) = fixture.context.request_server_info().unwrap();
        let (tx, rx) = mpsc::channel();
        operation.set_completion_callback(move |state| tx.send(state).unwrap());

        operation.cancel();
        operation.cancel();
        fixture.api.flush_replies();

        assert!(completion.wait().is_err());
        assert_eq!(operation.state(), OperationState::Cancelled);
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![OperationState::Cancelled]);
        assert_eq!(fixture.api.calls().operation_cancel, 1);
    }

    #[test]
    fn callback_registered_after_finish_runs_immediately() {
        let fixture = connected();
        let (operation, completion) = fixture.context.request_server_info().unwrap();
        completion.wait().unwrap();
        // The reply has been delivered; wait for the operation to settle.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while operation.state() == OperationState::Running {
            assert!(std::time::Instant::now() < deadline);
            std::thread::yield_now();
        }

        let (tx, rx) = mpsc::channel();
        operation.set_completion_callback(move |state| tx.send(state).unwrap());
        assert_eq!(rx.try_recv().unwrap(), OperationState::Done);
    }

    #[test]
    fn clone_takes_a_native_reference() {
        let fixture = connected();
        fixture.api.hold_replies(true);
        let (operation, _completion) = fixture.context.request_server_info().unwrap();

        let copy = operation.clone();
        drop(operation);
        assert_eq!(copy.state(), OperationState::Running);

        copy.cancel();
        drop(copy);
        assert_eq!(fixture.api.live_operations(), 0);
    }

    #[test]
    fn dropping_the_handle_does_not_abort_the_request() {
        let fixture = connected();
        fixture.api.hold_replies(true);
        let (operation, completion) = fixture.context.request_server_info().unwrap();

        drop(operation);
        fixture.api.flush_replies();

        assert_eq!(completion.wait().unwrap(), fixture.api.server_info());
        assert_eq!(fixture.api.calls().operation_cancel, 0);
    }
}
