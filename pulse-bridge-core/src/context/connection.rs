use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mainloop::threaded::{LoopGuard, Mainloop};
use crate::models::config::ContextConfiguration;
use crate::models::error::BridgeError;
use crate::models::server_info::ServerInfo;
use crate::models::state::{ContextState, OperationState};
use crate::native::handle::{NativeHandle, RawHandle};
use crate::operation::async_op::Operation;
use crate::operation::promise::{promise, Completion, Promise};
use crate::traits::native_api::PulseApi;

/// Application callback for context state changes. Runs on the event thread.
pub type StateCallback = Box<dyn FnMut(ContextState) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Connect,
    Disconnect,
}

/// Transient observer of an outstanding connect or disconnect.
struct PendingTransition {
    kind: Transition,
    promise: Promise<()>,
}

/// State shared with the native state notifier.
///
/// The event thread may only touch `connected`, `pending` and the
/// application callback slot.
struct ContextShared {
    connected: AtomicBool,
    pending: Mutex<Option<PendingTransition>>,
    state_callback: Mutex<Option<StateCallback>>,
}

impl ContextShared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            pending: Mutex::new(None),
            state_callback: Mutex::new(None),
        }
    }

    fn on_state_changed(&self, state: ContextState) {
        log::debug!("context state -> {:?}", state);
        // Application callback first: a settled future implies it has seen the state.
        if let Some(callback) = self.state_callback.lock().as_mut() {
            callback(state);
        }
        self.advance_pending(state);
    }

    /// Settle and retire the pending transition once `state` decides it.
    fn advance_pending(&self, state: ContextState) {
        let mut pending = self.pending.lock();
        let Some(kind) = pending.as_ref().map(|p| p.kind) else {
            return;
        };

        let succeeded = match (kind, state) {
            (Transition::Connect, ContextState::Ready) => {
                self.connected.store(true, Ordering::SeqCst);
                true
            }
            (Transition::Connect, ContextState::Failed | ContextState::Terminated) => false,
            (Transition::Disconnect, ContextState::Terminated) => {
                self.connected.store(false, Ordering::SeqCst);
                true
            }
            (Transition::Disconnect, ContextState::Failed) => {
                log::warn!("context failed while disconnecting");
                self.connected.store(false, Ordering::SeqCst);
                false
            }
            _ => return,
        };

        if let Some(transition) = pending.take() {
            if succeeded {
                transition.promise.resolve(());
            } else {
                transition.promise.cancel();
            }
        }
    }

    fn abandon_pending(&self) {
        if let Some(transition) = self.pending.lock().take() {
            log::debug!("abandoning pending {:?}", transition.kind);
            transition.promise.cancel();
        }
    }
}

/// One logical connection to the audio server.
///
/// Every state transition is applied by the event thread; this type only
/// reads state (under the loop lock) and reacts to notifications.
///
/// ```text
/// connect_async ──▶ [pending: Connect] ── Ready ──────────▶ Ok(())
///                                      └─ Failed/Terminated ▶ Err(Cancelled)
/// ```
///
/// A context in `Failed` or `Terminated` cannot be reconnected; create a new one.
pub struct Context<A: PulseApi> {
    mainloop: Arc<Mainloop<A>>,
    handle: NativeHandle,
    shared: Arc<ContextShared>,
    config: ContextConfiguration,
}

impl<A: PulseApi> Context<A> {
    /// Create a context on `mainloop` announcing `application_name`.
    pub fn new(mainloop: &Arc<Mainloop<A>>, application_name: &str) -> Result<Self, BridgeError> {
        Self::with_configuration(mainloop, ContextConfiguration::new(application_name))
    }

    pub fn with_configuration(
        mainloop: &Arc<Mainloop<A>>,
        config: ContextConfiguration,
    ) -> Result<Self, BridgeError> {
        config.validate().map_err(BridgeError::ConfigurationFailed)?;

        let api = Arc::clone(mainloop.api());
        let shared = Arc::new(ContextShared::new());

        let handle = {
            let _guard = mainloop.acquire_lock();

            let free_api = Arc::clone(&api);
            let handle = NativeHandle::acquire(
                "context",
                || {
                    api.context_new(mainloop.vtable(), &config.application_name)
                        .ok_or(BridgeError::Allocation("context"))
                },
                move |raw| free_api.context_unref(raw),
            )?;

            let dispatch = Arc::clone(&shared);
            api.context_set_state_callback(
                handle.raw(),
                Some(Arc::new(move |state| dispatch.on_state_changed(state))),
            );
            handle
        };

        mainloop.attach_context();
        log::debug!("context '{}' created", config.application_name);

        Ok(Self {
            mainloop: Arc::clone(mainloop),
            handle,
            shared,
            config,
        })
    }

    pub fn configuration(&self) -> &ContextConfiguration {
        &self.config
    }

    pub fn mainloop(&self) -> &Arc<Mainloop<A>> {
        &self.mainloop
    }

    /// Whether the last completed connect has not been undone by a disconnect.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Current protocol state, read under the loop lock.
    pub fn state(&self) -> ContextState {
        let guard = self.mainloop.acquire_lock();
        self.state_locked(&guard)
    }

    /// Current protocol state, for callers already holding the lock.
    pub fn state_locked(&self, guard: &LoopGuard<'_, A>) -> ContextState {
        self.mainloop.check_guard(guard);
        self.api().context_get_state(self.raw())
    }

    /// Install the application state callback, replacing any previous one.
    ///
    /// The callback runs on the event thread and must not lock the loop.
    pub fn set_state_callback(&self, callback: impl FnMut(ContextState) + Send + 'static) {
        let _guard = self.mainloop.acquire_lock();
        *self.shared.state_callback.lock() = Some(Box::new(callback));
    }

    pub fn clear_state_callback(&self) {
        let _guard = self.mainloop.acquire_lock();
        self.shared.state_callback.lock().take();
    }

    /// Connect to the server.
    ///
    /// Resolves when the context reaches `Ready`; resolves as cancelled if it
    /// reaches `Failed` or `Terminated` first. Already connected: resolves
    /// immediately without touching the native layer.
    pub fn connect_async(&self) -> Result<Completion<()>, BridgeError> {
        if self.is_connected() {
            return Ok(Completion::ready(()));
        }

        let guard = self.mainloop.acquire_lock();
        if self.is_connected() {
            return Ok(Completion::ready(()));
        }
        if self.shared.pending.lock().is_some() {
            return Err(BridgeError::ConnectInProgress);
        }

        let state = self.state_locked(&guard);
        if state != ContextState::Disconnected {
            return Err(if state.is_connecting() {
                BridgeError::ConnectInProgress
            } else {
                BridgeError::ContextUnusable(state)
            });
        }

        let (promise, completion) = promise();
        *self.shared.pending.lock() = Some(PendingTransition {
            kind: Transition::Connect,
            promise,
        });

        let status = self.api().context_connect(
            self.raw(),
            self.config.server.as_deref(),
            self.config.flags,
        );
        if status < 0 {
            self.shared.pending.lock().take();
            return Err(self.native_error(&guard, "context_connect"));
        }

        log::debug!(
            "connecting '{}' to {}",
            self.config.application_name,
            self.config.server.as_deref().unwrap_or("default server")
        );
        Ok(completion)
    }

    /// Disconnect from the server.
    ///
    /// Issues the native disconnect and resolves once `Terminated` is
    /// observed. Not connected, or already in a terminal state: resolves
    /// immediately. A `Failed` observation resolves as cancelled.
    pub fn disconnect_async(&self) -> Result<Completion<()>, BridgeError> {
        if !self.is_connected() {
            return Ok(Completion::ready(()));
        }

        let guard = self.mainloop.acquire_lock();
        if !self.is_connected() {
            return Ok(Completion::ready(()));
        }
        if self.shared.pending.lock().is_some() {
            return Err(BridgeError::ConnectInProgress);
        }

        let state = self.state_locked(&guard);
        if state.is_terminal() {
            // Lost without our involvement; nothing left to wait for.
            self.shared.connected.store(false, Ordering::SeqCst);
            return Ok(Completion::ready(()));
        }

        let (promise, completion) = promise();
        *self.shared.pending.lock() = Some(PendingTransition {
            kind: Transition::Disconnect,
            promise,
        });

        // May notify `Terminated` synchronously, before this returns.
        self.api().context_disconnect(self.raw());
        log::debug!("disconnecting '{}'", self.config.application_name);

        Ok(completion)
    }

    /// Fetch server information.
    pub fn get_server_info_async(&self) -> Result<Completion<ServerInfo>, BridgeError> {
        let (_operation, completion) = self.request_server_info()?;
        Ok(completion)
    }

    /// Fetch server information, keeping the operation handle so the request
    /// can be inspected or cancelled.
    ///
    /// The completion resolves with the info, or as cancelled if the
    /// operation is cancelled (explicitly or by context teardown) first.
    pub fn request_server_info(
        &self,
    ) -> Result<(Operation<A>, Completion<ServerInfo>), BridgeError> {
        let guard = self.mainloop.acquire_lock();

        let state = self.state_locked(&guard);
        if !state.is_ready() {
            return Err(BridgeError::NotReady(state));
        }

        let (promise, completion) = promise();
        let on_info = promise.clone();
        let raw_operation = self
            .api()
            .context_get_server_info(
                self.raw(),
                Box::new(move |info| {
                    on_info.resolve(info);
                }),
            )
            .ok_or_else(|| self.native_error(&guard, "context_get_server_info"))?;

        let operation = Operation::from_raw(Arc::clone(&self.mainloop), raw_operation);
        operation.set_completion_callback_locked(&guard, move |state| {
            if state == OperationState::Cancelled {
                promise.cancel();
            }
        });
        drop(guard);

        Ok((operation, completion))
    }

    fn api(&self) -> &Arc<A> {
        self.mainloop.api()
    }

    fn raw(&self) -> RawHandle {
        self.handle.raw()
    }

    fn native_error(&self, guard: &LoopGuard<'_, A>, call: &'static str) -> BridgeError {
        self.mainloop.check_guard(guard);
        let code = self.api().context_errno(self.raw());
        let message = self.api().strerror(code);
        log::error!("{} failed: {} ({})", call, message, code);
        BridgeError::Native { call, message }
    }
}

impl<A: PulseApi> Drop for Context<A> {
    fn drop(&mut self) {
        let api = Arc::clone(self.mainloop.api());
        let mainloop = Arc::clone(&self.mainloop);
        let handle = &mut self.handle;

        mainloop.serialized(|| {
            let raw = handle.raw();
            api.context_set_state_callback(raw, None);
            let state = api.context_get_state(raw);
            if state.is_connecting() || state.is_ready() {
                api.context_disconnect(raw);
            }
            handle.release();
        });

        self.shared.abandon_pending();
        self.shared.state_callback.lock().take();
        self.mainloop.detach_context();
        log::debug!("context '{}' released", self.config.application_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error::Cancelled;
    use crate::testing::{FakePulse, ERR_CONNECTION_REFUSED};
    use std::sync::mpsc;
    use std::time::Duration;

    const HANDSHAKE: [ContextState; 4] = [
        ContextState::Connecting,
        ContextState::Authorizing,
        ContextState::SettingName,
        ContextState::Ready,
    ];

    fn setup() -> (Arc<FakePulse>, Arc<Mainloop<FakePulse>>) {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        (api, mainloop)
    }

    fn connected_context(
        mainloop: &Arc<Mainloop<FakePulse>>,
    ) -> Context<FakePulse> {
        let context = Context::new(mainloop, "bridge-test").unwrap();
        context.connect_async().unwrap().wait().unwrap();
        context
    }

    #[test]
    fn starts_disconnected() {
        let (_api, mainloop) = setup();
        let context = Context::new(&mainloop, "bridge-test").unwrap();

        assert_eq!(context.state(), ContextState::Disconnected);
        assert!(!context.is_connected());
        assert_eq!(mainloop.context_count(), 1);
    }

    #[test]
    fn invalid_name_is_rejected_before_allocation() {
        let (api, mainloop) = setup();
        let result = Context::new(&mainloop, "");

        assert!(matches!(result, Err(BridgeError::ConfigurationFailed(_))));
        assert_eq!(api.calls().context_new, 0);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let (api, mainloop) = setup();
        api.fail_allocation(true);

        let result = Context::new(&mainloop, "bridge-test");
        assert_eq!(result.err(), Some(BridgeError::Allocation("context")));
        assert_eq!(mainloop.context_count(), 0);
    }

    #[test]
    fn connect_resolves_on_ready() {
        let (api, mainloop) = setup();
        let context = Context::new(&mainloop, "bridge-test").unwrap();
        let (tx, rx) = mpsc::channel();
        context.set_state_callback(move |state| tx.send(state).unwrap());

        context.connect_async().unwrap().wait().unwrap();

        assert!(context.is_connected());
        assert_eq!(context.state(), ContextState::Ready);
        let observed: Vec<_> = rx.try_iter().collect();
        assert_eq!(observed, HANDSHAKE.to_vec());
        assert_eq!(api.calls().context_connect, 1);
    }

    #[test]
    fn connect_passes_configured_server_and_flags() {
        let (api, mainloop) = setup();
        let config = ContextConfiguration {
            application_name: "bridge-test".into(),
            server: Some("tcp:studio.local".into()),
            flags: crate::models::config::ContextFlags::NOAUTOSPAWN,
        };
        let context = Context::with_configuration(&mainloop, config).unwrap();

        context.connect_async().unwrap().wait().unwrap();

        let (server, flags) = api.last_connect().unwrap();
        assert_eq!(server.as_deref(), Some("tcp:studio.local"));
        assert_eq!(flags, crate::models::config::ContextFlags::NOAUTOSPAWN);
    }

    #[test]
    fn connect_cancelled_on_handshake_failure() {
        let (api, mainloop) = setup();
        api.set_connect_script(vec![ContextState::Connecting, ContextState::Failed]);
        let context = Context::new(&mainloop, "bridge-test").unwrap();

        let outcome = context.connect_async().unwrap().wait();

        assert_eq!(outcome, Err(Cancelled));
        assert!(!context.is_connected());
        assert_eq!(context.state(), ContextState::Failed);
    }

    #[test]
    fn connect_cancelled_on_abrupt_termination() {
        let (api, mainloop) = setup();
        api.set_connect_script(vec![
            ContextState::Connecting,
            ContextState::Authorizing,
            ContextState::Terminated,
        ]);
        let context = Context::new(&mainloop, "bridge-test").unwrap();

        assert_eq!(context.connect_async().unwrap().wait(), Err(Cancelled));
        assert_eq!(context.state(), ContextState::Terminated);
    }

    #[test]
    fn connect_when_connected_issues_no_native_call() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);
        let before = api.calls();

        let mut completion = context.connect_async().unwrap();

        assert_eq!(completion.try_wait(), Some(Ok(())));
        let after = api.calls();
        assert_eq!(after.context_connect, before.context_connect);
        assert_eq!(after.mainloop_lock, before.mainloop_lock);
    }

    #[test]
    fn overlapping_connect_is_rejected() {
        let (api, mainloop) = setup();
        api.set_connect_script(vec![ContextState::Connecting]);
        let context = Context::new(&mainloop, "bridge-test").unwrap();

        let _first = context.connect_async().unwrap();
        assert_eq!(context.connect_async().err(), Some(BridgeError::ConnectInProgress));
        assert_eq!(api.calls().context_connect, 1);
    }

    #[test]
    fn terminal_context_is_not_reusable() {
        let (api, mainloop) = setup();
        api.set_connect_script(vec![ContextState::Connecting, ContextState::Failed]);
        let context = Context::new(&mainloop, "bridge-test").unwrap();
        assert!(context.connect_async().unwrap().wait().is_err());

        assert_eq!(
            context.connect_async().err(),
            Some(BridgeError::ContextUnusable(ContextState::Failed))
        );
    }

    #[test]
    fn native_connect_error_is_described() {
        let (api, mainloop) = setup();
        api.fail_connect(Some(ERR_CONNECTION_REFUSED));
        let context = Context::new(&mainloop, "bridge-test").unwrap();

        let error = context.connect_async().err().unwrap();
        assert_eq!(
            error,
            BridgeError::Native {
                call: "context_connect",
                message: "Connection refused".into(),
            }
        );

        // The failed attempt does not block a later one.
        api.fail_connect(None);
        context.connect_async().unwrap().wait().unwrap();
    }

    #[test]
    fn disconnect_when_never_connected_is_immediate() {
        let (api, mainloop) = setup();
        let context = Context::new(&mainloop, "bridge-test").unwrap();
        let before = api.calls();

        let mut completion = context.disconnect_async().unwrap();

        assert_eq!(completion.try_wait(), Some(Ok(())));
        let after = api.calls();
        assert_eq!(after.context_disconnect, 0);
        assert_eq!(after.mainloop_lock, before.mainloop_lock);
    }

    #[test]
    fn disconnect_resolves_on_terminated() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);

        context.disconnect_async().unwrap().wait().unwrap();

        assert!(!context.is_connected());
        assert_eq!(context.state(), ContextState::Terminated);
        assert_eq!(api.calls().context_disconnect, 1);
    }

    #[test]
    fn disconnect_after_connection_loss_is_immediate() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);
        let (tx, rx) = mpsc::channel();
        context.set_state_callback(move |state| tx.send(state).unwrap());

        api.emit_state(ContextState::Failed);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ContextState::Failed
        );

        context.disconnect_async().unwrap().wait().unwrap();
        assert!(!context.is_connected());
        assert_eq!(api.calls().context_disconnect, 0);
    }

    #[test]
    fn failure_while_disconnecting_cancels() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);
        api.fail_on_disconnect(true);

        let outcome = context.disconnect_async().unwrap().wait();

        assert_eq!(outcome, Err(Cancelled));
        assert!(!context.is_connected());
    }

    #[test]
    fn state_always_matches_last_notification() {
        let (api, mainloop) = setup();
        let context = Context::new(&mainloop, "bridge-test").unwrap();
        let (tx, rx) = mpsc::channel();
        context.set_state_callback(move |state| tx.send(state).unwrap());

        context.connect_async().unwrap().wait().unwrap();
        let mut last = None;
        for _ in 0..HANDSHAKE.len() {
            last = Some(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(Some(context.state()), last);

        api.emit_state(ContextState::Terminated);
        let last = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(context.state(), last);
    }

    #[test]
    fn replacing_state_callback_retires_the_old_one() {
        let (_api, mainloop) = setup();
        let context = Context::new(&mainloop, "bridge-test").unwrap();
        let (old_tx, old_rx) = mpsc::channel();
        let (new_tx, new_rx) = mpsc::channel();

        context.set_state_callback(move |state| old_tx.send(state).unwrap());
        context.set_state_callback(move |state| new_tx.send(state).unwrap());
        context.connect_async().unwrap().wait().unwrap();

        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.try_iter().count(), HANDSHAKE.len());
    }

    #[test]
    fn connect_observer_is_retired_after_resolution() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);
        let (tx, rx) = mpsc::channel();
        context.set_state_callback(move |state| tx.send(state).unwrap());

        // A later loss must not disturb the already-resolved connect.
        api.emit_state(ContextState::Terminated);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(context.is_connected());
        assert!(context.shared.pending.lock().is_none());
    }

    #[test]
    fn connect_awaited_from_another_thread() {
        let (_api, mainloop) = setup();
        let context = Arc::new(Context::new(&mainloop, "bridge-test").unwrap());
        let completion = context.connect_async().unwrap();

        let waiter = std::thread::spawn(move || completion.wait());
        assert_eq!(waiter.join().unwrap(), Ok(()));
        assert!(context.is_connected());
    }

    #[test]
    fn drop_cancels_pending_connect_and_releases() {
        let (api, mainloop) = setup();
        api.set_connect_script(vec![ContextState::Connecting]);
        let context = Context::new(&mainloop, "bridge-test").unwrap();
        let completion = context.connect_async().unwrap();

        drop(context);

        assert_eq!(completion.wait(), Err(Cancelled));
        let calls = api.calls();
        assert_eq!(calls.context_unref, 1);
        assert_eq!(calls.context_disconnect, 1);
        assert_eq!(mainloop.context_count(), 0);
    }

    #[test]
    fn server_info_resolves() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);

        let info = context.get_server_info_async().unwrap().wait().unwrap();

        assert_eq!(info, api.server_info());
    }

    #[test]
    fn server_info_requires_ready_context() {
        let (_api, mainloop) = setup();
        let context = Context::new(&mainloop, "bridge-test").unwrap();

        assert_eq!(
            context.get_server_info_async().err(),
            Some(BridgeError::NotReady(ContextState::Disconnected))
        );
    }

    #[test]
    fn cancelled_server_info_resolves_as_cancelled() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);
        api.hold_replies(true);

        let (operation, completion) = context.request_server_info().unwrap();
        assert_eq!(operation.state(), OperationState::Running);
        operation.cancel();
        api.flush_replies();

        assert_eq!(completion.wait(), Err(Cancelled));
        assert_eq!(operation.state(), OperationState::Cancelled);
    }

    #[test]
    fn context_teardown_cancels_outstanding_request() {
        let (api, mainloop) = setup();
        let context = connected_context(&mainloop);
        api.hold_replies(true);

        let completion = context.get_server_info_async().unwrap();
        drop(context);

        assert_eq!(completion.wait(), Err(Cancelled));
        assert_eq!(api.live_objects(), 1); // only the mainloop
    }

    #[test]
    fn full_session_releases_everything() {
        let (api, mainloop) = setup();
        {
            let context = connected_context(&mainloop);
            context.get_server_info_async().unwrap().wait().unwrap();
            context.disconnect_async().unwrap().wait().unwrap();
        }
        drop(mainloop);

        let calls = api.calls();
        assert_eq!(calls.context_new, calls.context_unref);
        assert_eq!(calls.mainloop_new, calls.mainloop_free);
        assert_eq!(api.live_objects(), 0);
    }
}
