use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::config::MainloopConfiguration;
use crate::models::error::BridgeError;
use crate::native::handle::{NativeHandle, RawHandle};
use crate::traits::native_api::PulseApi;

/// Threaded event loop.
///
/// The native layer owns a background thread that performs all protocol I/O
/// and invokes every registered callback. Other threads serialize against it
/// through [`acquire_lock`](Self::acquire_lock):
///
/// ```text
/// app thread ── acquire_lock ──▶ issue request ── drop guard
///                                      │
/// event thread ◀───────────────────────┘  I/O … callback (loop locked)
/// ```
///
/// Starts on construction and stops when the last reference is dropped.
/// Contexts hold an `Arc` to their loop, so it always outlives them.
pub struct Mainloop<A: PulseApi> {
    api: Arc<A>,
    handle: NativeHandle,
    run_state: Mutex<RunState>,
    contexts: AtomicUsize,
}

/// Never locked across the native stop, which waits for the current callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
    Stopping,
}

impl<A: PulseApi> Mainloop<A> {
    /// Allocate and start a loop.
    pub fn new(api: Arc<A>) -> Result<Arc<Self>, BridgeError> {
        Self::with_configuration(api, MainloopConfiguration::default())
    }

    pub fn with_configuration(
        api: Arc<A>,
        config: MainloopConfiguration,
    ) -> Result<Arc<Self>, BridgeError> {
        config.validate().map_err(BridgeError::ConfigurationFailed)?;

        let free_api = Arc::clone(&api);
        let handle = NativeHandle::acquire(
            "mainloop",
            || api.mainloop_new().ok_or(BridgeError::Allocation("mainloop")),
            move |raw| free_api.mainloop_free(raw),
        )?;

        if let Some(name) = &config.thread_name {
            api.mainloop_set_name(handle.raw(), name);
        }

        let mainloop = Self {
            api,
            handle,
            run_state: Mutex::new(RunState::Stopped),
            contexts: AtomicUsize::new(0),
        };
        // On failure the loop is dropped here and its handle freed.
        mainloop.start()?;

        Ok(Arc::new(mainloop))
    }

    /// Start the event-loop thread. No-op if already running.
    ///
    /// Fails while a [`stop`](Self::stop) is still draining the event thread.
    pub fn start(&self) -> Result<(), BridgeError> {
        let mut run_state = self.run_state.lock();
        match *run_state {
            RunState::Running => return Ok(()),
            RunState::Stopping => {
                return Err(BridgeError::MainloopStart("mainloop is stopping".into()))
            }
            RunState::Stopped => {}
        }

        let status = self.api.mainloop_start(self.raw());
        if status < 0 {
            log::error!("mainloop start returned {}", status);
            return Err(BridgeError::MainloopStart(format!(
                "native start returned {}",
                status
            )));
        }

        *run_state = RunState::Running;
        log::debug!("mainloop {:?} started", self.raw());
        Ok(())
    }

    /// Stop the event-loop thread, letting an in-flight callback finish
    /// first. No-op if not running or already stopping.
    ///
    /// The in-flight callback may still query the loop; it reports not running.
    /// Must not be called with the loop lock held.
    ///
    /// # Panics
    /// When called from the event-loop thread.
    pub fn stop(&self) {
        {
            let mut run_state = self.run_state.lock();
            if *run_state != RunState::Running {
                return;
            }
            assert!(
                !self.in_thread(),
                "mainloop stopped from its own event thread"
            );
            *run_state = RunState::Stopping;
        }

        let live = self.contexts.load(Ordering::SeqCst);
        if live > 0 {
            log::warn!("stopping mainloop with {} live context(s)", live);
        }

        self.api.mainloop_stop(self.raw());
        *self.run_state.lock() = RunState::Stopped;
        log::debug!("mainloop {:?} stopped", self.raw());
    }

    pub fn is_running(&self) -> bool {
        *self.run_state.lock() == RunState::Running
    }

    /// Block until the event thread yields, then hold the loop lock until
    /// the guard is dropped.
    ///
    /// # Panics
    /// When called from the event-loop thread. Callbacks already run with
    /// the loop locked; locking again there would deadlock.
    pub fn acquire_lock(&self) -> LoopGuard<'_, A> {
        assert!(
            !self.in_thread(),
            "mainloop lock requested from its own event thread"
        );
        self.api.mainloop_lock(self.raw());
        LoopGuard {
            mainloop: self,
            _not_send: PhantomData,
        }
    }

    /// Wake threads blocked in [`LoopGuard::wait`].
    ///
    /// Call from a callback on the event thread, or with the lock held. With
    /// `wait_for_accept`, blocks (lock released) until a woken thread calls
    /// [`LoopGuard::accept`].
    pub fn signal(&self, wait_for_accept: bool) {
        self.api.mainloop_signal(self.raw(), wait_for_accept);
    }

    /// Whether the calling thread is the event-loop thread.
    pub fn in_thread(&self) -> bool {
        self.api.mainloop_in_thread(self.raw())
    }

    /// Return value passed to the loop's quit call.
    pub fn retval(&self) -> i32 {
        self.api.mainloop_get_retval(self.raw())
    }

    /// Number of contexts currently bound to this loop.
    pub fn context_count(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }

    pub(crate) fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.handle.raw()
    }

    /// The abstract mainloop vtable for `context_new`.
    pub(crate) fn vtable(&self) -> RawHandle {
        self.api.mainloop_get_api(self.raw())
    }

    pub(crate) fn attach_context(&self) {
        self.contexts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn detach_context(&self) {
        self.contexts.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run `f` serialized against the event thread: directly when already on
    /// it, under the lock otherwise.
    pub(crate) fn serialized<R>(&self, f: impl FnOnce() -> R) -> R {
        if self.in_thread() {
            f()
        } else {
            let _guard = self.acquire_lock();
            f()
        }
    }

    /// Panic unless `guard` locks this loop.
    pub(crate) fn check_guard(&self, guard: &LoopGuard<'_, A>) {
        assert!(
            std::ptr::eq(self, guard.mainloop),
            "guard belongs to a different mainloop"
        );
    }
}

impl<A: PulseApi> Drop for Mainloop<A> {
    fn drop(&mut self) {
        // The event thread cannot join or free itself.
        if self.is_running() && self.in_thread() {
            log::error!(
                "mainloop {:?} dropped on its own event thread, leaking it",
                self.raw()
            );
            self.handle.leak();
            return;
        }
        self.stop();
    }
}

/// Proof that the loop lock is held. Unlocks on drop, including during unwinding.
///
/// Not `Send`: the lock must be released by the thread that took it.
pub struct LoopGuard<'a, A: PulseApi> {
    mainloop: &'a Mainloop<A>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, A: PulseApi> LoopGuard<'a, A> {
    pub fn mainloop(&self) -> &'a Mainloop<A> {
        self.mainloop
    }

    /// Release the lock, sleep until the event thread signals, reacquire.
    pub fn wait(&mut self) {
        self.mainloop.api.mainloop_wait(self.mainloop.raw());
    }

    /// Wait until `condition` holds, re-checking after every signal.
    pub fn wait_until(&mut self, mut condition: impl FnMut() -> bool) {
        while !condition() {
            self.wait();
        }
    }

    /// Acknowledge a `signal(true)` so the event thread can continue.
    pub fn accept(&self) {
        self.mainloop.api.mainloop_accept(self.mainloop.raw());
    }

    pub fn signal(&self, wait_for_accept: bool) {
        self.mainloop.signal(wait_for_accept);
    }
}

impl<A: PulseApi> Drop for LoopGuard<'_, A> {
    fn drop(&mut self) {
        self.mainloop.api.mainloop_unlock(self.mainloop.raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakePulse;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn starts_on_construction_and_stops_on_drop() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        assert!(mainloop.is_running());
        assert_eq!(api.calls().mainloop_start, 1);

        drop(mainloop);

        let calls = api.calls();
        assert_eq!(calls.mainloop_stop, 1);
        assert_eq!(calls.mainloop_free, 1);
        assert_eq!(api.live_objects(), 0);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();

        mainloop.start().unwrap();
        assert_eq!(api.calls().mainloop_start, 1);

        mainloop.stop();
        mainloop.stop();
        assert!(!mainloop.is_running());
        assert_eq!(api.calls().mainloop_stop, 1);

        mainloop.start().unwrap();
        assert!(mainloop.is_running());
        assert_eq!(api.calls().mainloop_start, 2);
    }

    #[test]
    fn failed_start_is_a_setup_error() {
        let api = Arc::new(FakePulse::new());
        api.fail_mainloop_start(true);

        let result = Mainloop::new(Arc::clone(&api));
        assert!(matches!(result, Err(BridgeError::MainloopStart(_))));
        // No degraded object survives.
        assert_eq!(api.calls().mainloop_free, 1);
        assert_eq!(api.live_objects(), 0);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let api = Arc::new(FakePulse::new());
        api.fail_allocation(true);

        let result = Mainloop::new(api);
        assert_eq!(result.err(), Some(BridgeError::Allocation("mainloop")));
    }

    #[test]
    fn thread_name_is_applied() {
        let api = Arc::new(FakePulse::new());
        let config = MainloopConfiguration {
            thread_name: Some("pulse-events".into()),
        };
        let mainloop = Mainloop::with_configuration(Arc::clone(&api), config).unwrap();

        assert_eq!(api.mainloop_name(mainloop.raw()).as_deref(), Some("pulse-events"));
    }

    #[test]
    fn lock_is_strictly_serialized() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(api).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let guard = mainloop.acquire_lock();

        let contender = {
            let mainloop = Arc::clone(&mainloop);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let _guard = mainloop.acquire_lock();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst), "second guard granted early");

        drop(guard);
        contender.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_guards_never_overlap() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(api).unwrap();
        let inside = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let mainloop = Arc::clone(&mainloop);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = mainloop.acquire_lock();
                        assert!(!inside.swap(true, Ordering::SeqCst));
                        thread::yield_now();
                        inside.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn guard_unlocks_on_panic() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(api).unwrap();

        let panicking = Arc::clone(&mainloop);
        let result = thread::spawn(move || {
            let _guard = panicking.acquire_lock();
            panic!("guarded block failed");
        })
        .join();
        assert!(result.is_err());

        // Would block forever if the guard leaked the lock.
        let _guard = mainloop.acquire_lock();
    }

    #[test]
    fn wait_wakes_on_signal_from_event_thread() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        let fired = Arc::new(AtomicBool::new(false));

        let mut guard = mainloop.acquire_lock();
        {
            let mainloop = Arc::clone(&mainloop);
            let fired = Arc::clone(&fired);
            api.post(guard.mainloop().raw(), move || {
                assert!(mainloop.in_thread());
                fired.store(true, Ordering::SeqCst);
                mainloop.signal(false);
            });
        }

        guard.wait_until(|| fired.load(Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn signal_waits_for_accept() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        let handed_over = Arc::new(AtomicBool::new(false));
        let resumed = Arc::new(AtomicBool::new(false));

        let mut guard = mainloop.acquire_lock();
        {
            let mainloop = Arc::clone(&mainloop);
            let handed_over = Arc::clone(&handed_over);
            let resumed = Arc::clone(&resumed);
            api.post(guard.mainloop().raw(), move || {
                handed_over.store(true, Ordering::SeqCst);
                mainloop.signal(true);
                // Release our reference before the test can finish.
                drop(mainloop);
                resumed.store(true, Ordering::SeqCst);
            });
        }

        guard.wait_until(|| handed_over.load(Ordering::SeqCst));
        // The event thread is parked until we accept.
        thread::sleep(Duration::from_millis(20));
        assert!(!resumed.load(Ordering::SeqCst));

        guard.accept();
        drop(guard);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !resumed.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "event thread never resumed");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn callback_can_query_the_loop_while_it_stops() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();

        {
            let mainloop = Arc::clone(&mainloop);
            api.post(mainloop.raw(), move || {
                started_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                let seen = (mainloop.is_running(), mainloop.start().is_err());
                drop(mainloop);
                seen_tx.send(seen).unwrap();
            });
        }
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stopper = {
            let mainloop = Arc::clone(&mainloop);
            thread::spawn(move || mainloop.stop())
        };

        let (running, start_refused) = seen_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("callback blocked while the loop was stopping");
        assert!(!running);
        assert!(start_refused);

        stopper.join().unwrap();
        assert!(!mainloop.is_running());
        assert_eq!(api.calls().mainloop_stop, 1);
        assert_eq!(api.calls().mainloop_start, 1);
    }

    #[test]
    fn last_reference_dropped_on_event_thread_leaks_the_loop() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        let raw = mainloop.raw();
        let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        {
            let mainloop = Arc::clone(&mainloop);
            api.post(raw, move || {
                go_rx.recv().unwrap();
                drop(mainloop);
                done_tx.send(()).unwrap();
            });
        }
        drop(mainloop);
        go_tx.send(()).unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("dropping the loop on its event thread failed");
        let calls = api.calls();
        assert_eq!(calls.mainloop_stop, 0);
        assert_eq!(calls.mainloop_free, 0);
        assert_eq!(api.live_objects(), 1);
    }

    #[test]
    #[should_panic(expected = "guard belongs to a different mainloop")]
    fn foreign_guard_is_rejected() {
        let api = Arc::new(FakePulse::new());
        let first = Mainloop::new(Arc::clone(&api)).unwrap();
        let second = Mainloop::new(api).unwrap();

        let guard = second.acquire_lock();
        first.check_guard(&guard);
    }

    #[test]
    fn lock_from_event_thread_panics() {
        let api = Arc::new(FakePulse::new());
        let mainloop = Mainloop::new(Arc::clone(&api)).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        {
            let mainloop = Arc::clone(&mainloop);
            api.post(mainloop.raw(), move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let _guard = mainloop.acquire_lock();
                }));
                drop(mainloop);
                tx.send(outcome.is_err()).unwrap();
            });
        }

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
