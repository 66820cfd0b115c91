use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::{error_text, ERR_BAD_STATE};
use crate::models::config::ContextFlags;
use crate::models::sample::{SampleFormat, SampleSpec};
use crate::models::server_info::ServerInfo;
use crate::models::state::{ContextState, OperationState};
use crate::native::handle::RawHandle;
use crate::traits::native_api::{
    ContextStateCallback, OperationStateCallback, PulseApi, ServerInfoCallback,
};

type Event = Box<dyn FnOnce() + Send + 'static>;

/// Number of calls made through the native function table.
///
/// Allocation counters only count successful allocations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub mainloop_new: usize,
    pub mainloop_free: usize,
    pub mainloop_start: usize,
    pub mainloop_stop: usize,
    pub mainloop_lock: usize,
    pub context_new: usize,
    pub context_unref: usize,
    pub context_connect: usize,
    pub context_disconnect: usize,
    pub context_get_server_info: usize,
    pub operation_ref: usize,
    pub operation_unref: usize,
    pub operation_cancel: usize,
}

/// Scripted, in-process implementation of [`PulseApi`].
///
/// Each mainloop gets a real event thread and a recursive lock that the
/// event thread holds while it runs an event, so locking behaves like the
/// native threaded loop. Server behavior is scripted:
///
/// - `context_connect` applies the first scripted state synchronously (as
///   the native library does for `Connecting`) and posts the rest as events.
/// - `context_disconnect` applies `Terminated` synchronously, or `Failed`
///   with [`fail_on_disconnect`](Self::fail_on_disconnect).
/// - Server-info replies are posted as events, or parked until
///   [`flush_replies`](Self::flush_replies) with [`hold_replies`](Self::hold_replies).
///
/// No fake mutex is held while a callback runs.
pub struct FakePulse {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Mutex<Registry>,
}

struct Registry {
    next_id: usize,
    loops: HashMap<RawHandle, Arc<FakeLoop>>,
    contexts: HashMap<RawHandle, FakeContext>,
    operations: HashMap<RawHandle, FakeOperation>,
    calls: CallCounts,
    connect_script: Vec<ContextState>,
    fail_allocation: bool,
    fail_start: bool,
    fail_connect: Option<i32>,
    fail_on_disconnect: bool,
    hold_replies: bool,
    held: Vec<(RawHandle, Event)>,
    last_connect: Option<(Option<String>, ContextFlags)>,
    server_info: ServerInfo,
}

struct FakeContext {
    mainloop: RawHandle,
    state: ContextState,
    errno: i32,
    // Bumped by every connect and disconnect; stale scripted events are dropped.
    epoch: u64,
    callback: Option<ContextStateCallback>,
}

struct FakeOperation {
    context: RawHandle,
    state: OperationState,
    refs: usize,
    // The library's own reference, held until the operation finishes.
    pending_ref: bool,
    callback: Option<OperationStateCallback>,
    reply: Option<ServerInfoCallback>,
}

impl Registry {
    fn allocate(&mut self) -> RawHandle {
        self.next_id += 0x10;
        match RawHandle::new(self.next_id) {
            Some(raw) => raw,
            None => unreachable!("handle ids start above zero"),
        }
    }

    fn context(&mut self, raw: RawHandle) -> &mut FakeContext {
        match self.contexts.get_mut(&raw) {
            Some(context) => context,
            None => panic!("unknown context {:?}", raw),
        }
    }

    fn operation(&mut self, raw: RawHandle) -> &mut FakeOperation {
        match self.operations.get_mut(&raw) {
            Some(operation) => operation,
            None => panic!("unknown operation {:?}", raw),
        }
    }

    fn mainloop(&self, raw: RawHandle) -> Arc<FakeLoop> {
        match self.loops.get(&raw) {
            Some(mainloop) => Arc::clone(mainloop),
            None => panic!("unknown mainloop {:?}", raw),
        }
    }

    /// Mark every running operation of `context` cancelled.
    fn cancel_operations_of(&mut self, context: RawHandle) -> Vec<Finished> {
        self.operations
            .iter_mut()
            .filter(|(_, op)| op.context == context && op.state == OperationState::Running)
            .map(|(raw, op)| {
                op.state = OperationState::Cancelled;
                Finished {
                    operation: *raw,
                    callback: op.callback.clone(),
                    reply: op.reply.take(),
                }
            })
            .collect()
    }
}

/// An operation that just reached a terminal state, to be reported with no
/// fake mutex held.
struct Finished {
    operation: RawHandle,
    callback: Option<OperationStateCallback>,
    reply: Option<ServerInfoCallback>,
}

impl FakePulse {
    pub fn new() -> Self {
        let registry = Registry {
            next_id: 0x1000,
            loops: HashMap::new(),
            contexts: HashMap::new(),
            operations: HashMap::new(),
            calls: CallCounts::default(),
            connect_script: vec![
                ContextState::Connecting,
                ContextState::Authorizing,
                ContextState::SettingName,
                ContextState::Ready,
            ],
            fail_allocation: false,
            fail_start: false,
            fail_connect: None,
            fail_on_disconnect: false,
            hold_replies: false,
            held: Vec::new(),
            last_connect: None,
            server_info: default_server_info(),
        };
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(registry),
            }),
        }
    }

    pub fn calls(&self) -> CallCounts {
        self.inner.registry.lock().calls.clone()
    }

    /// Mainloops, contexts and operations not yet freed.
    pub fn live_objects(&self) -> usize {
        let registry = self.inner.registry.lock();
        registry.loops.len() + registry.contexts.len() + registry.operations.len()
    }

    pub fn live_operations(&self) -> usize {
        self.inner.registry.lock().operations.len()
    }

    pub fn fail_allocation(&self, fail: bool) {
        self.inner.registry.lock().fail_allocation = fail;
    }

    pub fn fail_mainloop_start(&self, fail: bool) {
        self.inner.registry.lock().fail_start = fail;
    }

    /// Make `context_connect` fail immediately with `code`.
    pub fn fail_connect(&self, code: Option<i32>) {
        self.inner.registry.lock().fail_connect = code;
    }

    pub fn fail_on_disconnect(&self, fail: bool) {
        self.inner.registry.lock().fail_on_disconnect = fail;
    }

    /// States a connect walks through.
    pub fn set_connect_script(&self, script: Vec<ContextState>) {
        self.inner.registry.lock().connect_script = script;
    }

    pub fn last_connect(&self) -> Option<(Option<String>, ContextFlags)> {
        self.inner.registry.lock().last_connect.clone()
    }

    pub fn server_info(&self) -> ServerInfo {
        self.inner.registry.lock().server_info.clone()
    }

    pub fn set_server_info(&self, info: ServerInfo) {
        self.inner.registry.lock().server_info = info;
    }

    pub fn hold_replies(&self, hold: bool) {
        self.inner.registry.lock().hold_replies = hold;
    }

    /// Deliver every parked reply, in request order.
    pub fn flush_replies(&self) {
        let held = std::mem::take(&mut self.inner.registry.lock().held);
        for (mainloop, event) in held {
            self.post(mainloop, event);
        }
    }

    pub fn mainloop_name(&self, mainloop: RawHandle) -> Option<String> {
        let mainloop = self.inner.registry.lock().mainloop(mainloop);
        let name = mainloop.state.lock().name.clone();
        name
    }

    /// Queue `event` to run on the event thread of `mainloop`, with the loop locked.
    pub fn post(&self, mainloop: RawHandle, event: impl FnOnce() + Send + 'static) {
        let mainloop = self.inner.registry.lock().mainloop(mainloop);
        mainloop.post(Box::new(event));
    }

    /// Simulate a server-side state change on every live context.
    pub fn emit_state(&self, state: ContextState) {
        let targets: Vec<(RawHandle, RawHandle, u64)> = self
            .inner
            .registry
            .lock()
            .contexts
            .iter()
            .map(|(raw, context)| (*raw, context.mainloop, context.epoch))
            .collect();
        for (context, mainloop, epoch) in targets {
            self.post_state(mainloop, context, epoch, state);
        }
    }

    fn post_state(&self, mainloop: RawHandle, context: RawHandle, epoch: u64, state: ContextState) {
        let weak = Arc::downgrade(&self.inner);
        self.post(mainloop, move || {
            if let Some(fake) = Self::upgrade(&weak) {
                fake.apply_state_if_current(context, epoch, state);
            }
        });
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn apply_state_if_current(&self, context: RawHandle, epoch: u64, state: ContextState) {
        let current = match self.inner.registry.lock().contexts.get(&context) {
            Some(found) => found.epoch == epoch,
            None => false,
        };
        if current {
            self.apply_context_state(context, state);
        }
    }

    /// Set the state, notify, and on a terminal state cancel outstanding requests.
    fn apply_context_state(&self, context: RawHandle, state: ContextState) {
        let (callback, finished) = {
            let mut registry = self.inner.registry.lock();
            let Some(entry) = registry.contexts.get_mut(&context) else {
                return;
            };
            entry.state = state;
            let callback = entry.callback.clone();
            let finished = if state.is_terminal() {
                registry.cancel_operations_of(context)
            } else {
                Vec::new()
            };
            (callback, finished)
        };

        if let Some(callback) = callback {
            callback(state);
        }
        self.report(finished, OperationState::Cancelled);
    }

    fn report(&self, finished: Vec<Finished>, state: OperationState) {
        for entry in finished {
            drop(entry.reply);
            if let Some(callback) = entry.callback {
                callback(state);
            }
            self.release_pending_ref(entry.operation);
        }
    }

    fn release_pending_ref(&self, operation: RawHandle) {
        let removed = {
            let mut registry = self.inner.registry.lock();
            let Some(entry) = registry.operations.get_mut(&operation) else {
                return;
            };
            if !entry.pending_ref {
                return;
            }
            entry.pending_ref = false;
            entry.refs -= 1;
            if entry.refs == 0 {
                registry.operations.remove(&operation)
            } else {
                None
            }
        };
        drop(removed);
    }

    fn complete_server_info(&self, operation: RawHandle) {
        let (reply, info) = {
            let mut registry = self.inner.registry.lock();
            let info = registry.server_info.clone();
            match registry.operations.get_mut(&operation) {
                Some(entry) if entry.state == OperationState::Running => (entry.reply.take(), info),
                _ => return,
            }
        };

        if let Some(reply) = reply {
            reply(info);
        }

        let callback = {
            let mut registry = self.inner.registry.lock();
            let entry = registry.operation(operation);
            entry.state = OperationState::Done;
            entry.callback.clone()
        };
        if let Some(callback) = callback {
            callback(OperationState::Done);
        }
        self.release_pending_ref(operation);
    }
}

impl Default for FakePulse {
    fn default() -> Self {
        Self::new()
    }
}

fn default_server_info() -> ServerInfo {
    ServerInfo {
        user_name: "tester".into(),
        host_name: "fakehost".into(),
        server_version: "16.1".into(),
        server_name: "pulseaudio".into(),
        sample_spec: SampleSpec {
            format: SampleFormat::S16Le,
            rate: 44100,
            channels: 2,
        },
        default_sink_name: Some("fake_output.stereo".into()),
        default_source_name: Some("fake_input.mono".into()),
        cookie: 0x1234_5678,
    }
}

impl PulseApi for FakePulse {
    fn mainloop_new(&self) -> Option<RawHandle> {
        let mut registry = self.inner.registry.lock();
        if registry.fail_allocation {
            return None;
        }
        let raw = registry.allocate();
        registry.loops.insert(raw, Arc::new(FakeLoop::new()));
        registry.calls.mainloop_new += 1;
        Some(raw)
    }

    fn mainloop_free(&self, mainloop: RawHandle) {
        let removed = {
            let mut registry = self.inner.registry.lock();
            registry.calls.mainloop_free += 1;
            registry.loops.remove(&mainloop)
        };
        match removed {
            Some(fake) => fake.stop(),
            None => panic!("freeing unknown mainloop {:?}", mainloop),
        }
    }

    fn mainloop_start(&self, mainloop: RawHandle) -> i32 {
        let (fake, fail) = {
            let mut registry = self.inner.registry.lock();
            registry.calls.mainloop_start += 1;
            (registry.mainloop(mainloop), registry.fail_start)
        };
        if fail {
            return -1;
        }
        match FakeLoop::start(&fake) {
            Ok(()) => 0,
            Err(error) => {
                log::error!("fake event thread failed to spawn: {}", error);
                -1
            }
        }
    }

    fn mainloop_stop(&self, mainloop: RawHandle) {
        let fake = {
            let mut registry = self.inner.registry.lock();
            registry.calls.mainloop_stop += 1;
            registry.mainloop(mainloop)
        };
        fake.stop();
    }

    fn mainloop_lock(&self, mainloop: RawHandle) {
        let fake = {
            let mut registry = self.inner.registry.lock();
            registry.calls.mainloop_lock += 1;
            registry.mainloop(mainloop)
        };
        fake.lock();
    }

    fn mainloop_unlock(&self, mainloop: RawHandle) {
        let fake = self.inner.registry.lock().mainloop(mainloop);
        fake.unlock();
    }

    fn mainloop_wait(&self, mainloop: RawHandle) {
        let fake = self.inner.registry.lock().mainloop(mainloop);
        fake.wait();
    }

    fn mainloop_signal(&self, mainloop: RawHandle, wait_for_accept: bool) {
        let fake = self.inner.registry.lock().mainloop(mainloop);
        fake.signal(wait_for_accept);
    }

    fn mainloop_accept(&self, mainloop: RawHandle) {
        let fake = self.inner.registry.lock().mainloop(mainloop);
        fake.accept();
    }

    fn mainloop_in_thread(&self, mainloop: RawHandle) -> bool {
        let fake = self.inner.registry.lock().mainloop(mainloop);
        let in_thread = fake.state.lock().event_thread == Some(thread::current().id());
        in_thread
    }

    fn mainloop_get_api(&self, mainloop: RawHandle) -> RawHandle {
        // The loop handle doubles as its vtable.
        mainloop
    }

    fn mainloop_set_name(&self, mainloop: RawHandle, name: &str) {
        let fake = self.inner.registry.lock().mainloop(mainloop);
        fake.state.lock().name = Some(name.to_string());
    }

    fn mainloop_get_retval(&self, _mainloop: RawHandle) -> i32 {
        0
    }

    fn context_new(&self, mainloop_api: RawHandle, _application_name: &str) -> Option<RawHandle> {
        let mut registry = self.inner.registry.lock();
        if registry.fail_allocation {
            return None;
        }
        if !registry.loops.contains_key(&mainloop_api) {
            panic!("context_new on unknown mainloop {:?}", mainloop_api);
        }
        let raw = registry.allocate();
        registry.contexts.insert(
            raw,
            FakeContext {
                mainloop: mainloop_api,
                state: ContextState::Disconnected,
                errno: 0,
                epoch: 0,
                callback: None,
            },
        );
        registry.calls.context_new += 1;
        Some(raw)
    }

    fn context_unref(&self, context: RawHandle) {
        let (removed, finished) = {
            let mut registry = self.inner.registry.lock();
            registry.calls.context_unref += 1;
            let finished = registry.cancel_operations_of(context);
            (registry.contexts.remove(&context), finished)
        };
        if removed.is_none() {
            panic!("unref of unknown context {:?}", context);
        }
        drop(removed);
        self.report(finished, OperationState::Cancelled);
    }

    fn context_connect(&self, context: RawHandle, server: Option<&str>, flags: ContextFlags) -> i32 {
        let (mainloop, epoch, script) = {
            let mut registry = self.inner.registry.lock();
            registry.calls.context_connect += 1;
            registry.last_connect = Some((server.map(str::to_string), flags));
            let fail_connect = registry.fail_connect;
            let script = registry.connect_script.clone();

            let entry = registry.context(context);
            if let Some(code) = fail_connect {
                entry.errno = code;
                return -1;
            }
            if entry.state != ContextState::Disconnected {
                entry.errno = ERR_BAD_STATE;
                return -1;
            }
            entry.epoch += 1;
            (entry.mainloop, entry.epoch, script)
        };

        let mut states = script.into_iter();
        if let Some(first) = states.next() {
            self.apply_context_state(context, first);
        }
        for state in states {
            self.post_state(mainloop, context, epoch, state);
        }
        0
    }

    fn context_disconnect(&self, context: RawHandle) {
        let outcome = {
            let mut registry = self.inner.registry.lock();
            registry.calls.context_disconnect += 1;
            let fail = registry.fail_on_disconnect;
            let entry = registry.context(context);
            entry.epoch += 1;
            if entry.state.is_connecting() || entry.state.is_ready() {
                Some(if fail {
                    ContextState::Failed
                } else {
                    ContextState::Terminated
                })
            } else {
                None
            }
        };
        if let Some(state) = outcome {
            self.apply_context_state(context, state);
        }
    }

    fn context_get_state(&self, context: RawHandle) -> ContextState {
        self.inner.registry.lock().context(context).state
    }

    fn context_errno(&self, context: RawHandle) -> i32 {
        self.inner.registry.lock().context(context).errno
    }

    fn context_set_state_callback(&self, context: RawHandle, callback: Option<ContextStateCallback>) {
        let previous = {
            let mut registry = self.inner.registry.lock();
            std::mem::replace(&mut registry.context(context).callback, callback)
        };
        drop(previous);
    }

    fn context_get_server_info(
        &self,
        context: RawHandle,
        callback: ServerInfoCallback,
    ) -> Option<RawHandle> {
        let mut registry = self.inner.registry.lock();
        registry.calls.context_get_server_info += 1;

        let entry = registry.context(context);
        if !entry.state.is_ready() {
            entry.errno = ERR_BAD_STATE;
            return None;
        }
        let mainloop = entry.mainloop;

        let raw = registry.allocate();
        registry.operations.insert(
            raw,
            FakeOperation {
                context,
                state: OperationState::Running,
                refs: 2,
                pending_ref: true,
                callback: None,
                reply: Some(callback),
            },
        );

        let weak = Arc::downgrade(&self.inner);
        let event: Event = Box::new(move || {
            if let Some(fake) = Self::upgrade(&weak) {
                fake.complete_server_info(raw);
            }
        });

        if registry.hold_replies {
            registry.held.push((mainloop, event));
        } else {
            let fake = registry.mainloop(mainloop);
            drop(registry);
            fake.post(event);
        }
        Some(raw)
    }

    fn operation_ref(&self, operation: RawHandle) -> RawHandle {
        let mut registry = self.inner.registry.lock();
        registry.calls.operation_ref += 1;
        registry.operation(operation).refs += 1;
        operation
    }

    fn operation_unref(&self, operation: RawHandle) {
        let removed = {
            let mut registry = self.inner.registry.lock();
            registry.calls.operation_unref += 1;
            let entry = registry.operation(operation);
            entry.refs -= 1;
            if entry.refs == 0 {
                registry.operations.remove(&operation)
            } else {
                None
            }
        };
        drop(removed);
    }

    fn operation_cancel(&self, operation: RawHandle) {
        let finished = {
            let mut registry = self.inner.registry.lock();
            registry.calls.operation_cancel += 1;
            let entry = registry.operation(operation);
            if entry.state != OperationState::Running {
                return;
            }
            entry.state = OperationState::Cancelled;
            Finished {
                operation,
                callback: entry.callback.clone(),
                reply: entry.reply.take(),
            }
        };
        self.report(vec![finished], OperationState::Cancelled);
    }

    fn operation_get_state(&self, operation: RawHandle) -> OperationState {
        self.inner.registry.lock().operation(operation).state
    }

    fn operation_set_state_callback(
        &self,
        operation: RawHandle,
        callback: Option<OperationStateCallback>,
    ) {
        let previous = {
            let mut registry = self.inner.registry.lock();
            std::mem::replace(&mut registry.operation(operation).callback, callback)
        };
        drop(previous);
    }

    fn strerror(&self, code: i32) -> String {
        error_text(code)
    }
}

/// One fake threaded mainloop: an event queue, a recursive lock and the
/// thread that drains the queue.
struct FakeLoop {
    state: Mutex<LoopState>,
    changed: Condvar,
}

struct LoopState {
    owner: Option<ThreadId>,
    depth: usize,
    event_thread: Option<ThreadId>,
    worker: Option<JoinHandle<()>>,
    running: bool,
    queue: VecDeque<Event>,
    signals: u64,
    accepts: u64,
    name: Option<String>,
}

impl FakeLoop {
    fn new() -> Self {
        Self {
            state: Mutex::new(LoopState {
                owner: None,
                depth: 0,
                event_thread: None,
                worker: None,
                running: false,
                queue: VecDeque::new(),
                signals: 0,
                accepts: 0,
                name: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn start(this: &Arc<Self>) -> std::io::Result<()> {
        let mut state = this.state.lock();
        if state.running {
            return Ok(());
        }
        let name = state.name.clone().unwrap_or_else(|| "fake-mainloop".into());
        let worker = Arc::clone(this);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run())?;

        state.event_thread = Some(handle.thread().id());
        state.worker = Some(handle);
        state.running = true;
        Ok(())
    }

    fn stop(&self) {
        let worker = {
            let mut state = self.state.lock();
            state.running = false;
            self.changed.notify_all();
            state.worker.take()
        };
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                log::error!("fake event thread panicked");
            }
        }
    }

    fn run(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            while state.running && (state.owner.is_some() || state.queue.is_empty()) {
                self.changed.wait(&mut state);
            }
            if !state.running {
                break;
            }
            let Some(event) = state.queue.pop_front() else {
                continue;
            };

            state.owner = Some(me);
            state.depth = 1;
            MutexGuard::unlocked(&mut state, || {
                if panic::catch_unwind(AssertUnwindSafe(event)).is_err() {
                    log::error!("fake event panicked");
                }
            });
            state.owner = None;
            state.depth = 0;
            self.changed.notify_all();
        }
        if state.event_thread == Some(me) {
            state.event_thread = None;
        }
    }

    fn post(&self, event: Event) {
        self.state.lock().queue.push_back(event);
        self.changed.notify_all();
    }

    fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            self.changed.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        assert_eq!(
            state.owner,
            Some(thread::current().id()),
            "unlock by a thread not holding the loop lock"
        );
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.changed.notify_all();
        }
    }

    /// Fully release the lock, block until `ready` holds and the lock is
    /// free, then take it back at the saved depth.
    fn release_until(&self, mut ready: impl FnMut(&LoopState) -> bool) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        assert_eq!(state.owner, Some(me), "loop lock not held");
        let depth = std::mem::take(&mut state.depth);
        state.owner = None;
        self.changed.notify_all();

        while !ready(&*state) || state.owner.is_some() {
            self.changed.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = depth;
    }

    fn wait(&self) {
        let seen = self.state.lock().signals;
        self.release_until(|state| state.signals != seen);
    }

    fn signal(&self, wait_for_accept: bool) {
        let accepts = {
            let mut state = self.state.lock();
            state.signals += 1;
            self.changed.notify_all();
            state.accepts
        };
        if wait_for_accept {
            self.release_until(|state| state.accepts != accepts);
        }
    }

    fn accept(&self) {
        self.state.lock().accepts += 1;
        self.changed.notify_all();
    }
}
