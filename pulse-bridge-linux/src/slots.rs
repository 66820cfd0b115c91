//! Ownership of the closures handed to libpulse as `void *userdata`.
//!
//! Each slot is boxed so its address stays fixed while libpulse holds it, and
//! is keyed by the address of the native object it belongs to:
//!
//! - a [`ContextSlot`] lives until it is replaced or cleared, or until the context is unreffed;
//! - an [`OperationSlot`] carries both the reply and the operation state
//!   callback of one request, and retires itself on a terminal state.
//!
//! Nothing here calls libpulse, so the lifetimes are testable without it.

use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use pulse_bridge_core::models::server_info::ServerInfo;
use pulse_bridge_core::models::state::{ContextState, OperationState};
use pulse_bridge_core::traits::native_api::{
    ContextStateCallback, OperationStateCallback, ServerInfoCallback,
};

/// Run a Rust callback from C, where unwinding is not allowed.
pub fn guarded(what: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("{} callback panicked", what);
    }
}

/// The pointer libpulse receives for `slot`.
pub fn userdata<T>(slot: &T) -> *mut c_void {
    slot as *const T as *mut c_void
}

/// Boxed slots keyed by native object address.
///
/// Removed slots are handed back to the caller so they are dropped after
/// the map lock is released.
pub struct SlotMap<T> {
    slots: Mutex<HashMap<usize, Box<T>>>,
}

impl<T> Default for SlotMap<T> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SlotMap<T> {
    /// Store `slot` under `key`, returning the slot it replaced.
    pub fn insert(&self, key: usize, slot: Box<T>) -> Option<Box<T>> {
        self.slots.lock().insert(key, slot)
    }

    pub fn remove(&self, key: usize) -> Option<Box<T>> {
        self.slots.lock().remove(&key)
    }

    /// Run `f` on the slot under `key`, with the map locked.
    pub fn with<R>(&self, key: usize, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.slots.lock().get(&key).map(|slot| f(slot))
    }

    pub fn contains(&self, key: usize) -> bool {
        self.slots.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Userdata of a context state callback.
pub struct ContextSlot {
    callback: ContextStateCallback,
}

impl ContextSlot {
    pub fn new(callback: ContextStateCallback) -> Box<Self> {
        Box::new(Self { callback })
    }

    /// Report `state` to the callback behind `userdata`.
    ///
    /// # Safety
    /// `userdata` must point to a live `ContextSlot`.
    pub unsafe fn dispatch(userdata: *mut c_void, state: ContextState) {
        // Clone first: the callback may replace itself, freeing the slot.
        let callback = Arc::clone(&(*(userdata as *const ContextSlot)).callback);
        guarded("context state", || callback(state));
    }
}

/// Userdata of a server-info request and of its operation state callback.
pub struct OperationSlot {
    owner: Weak<SlotMap<OperationSlot>>,
    reply: Mutex<Option<ServerInfoCallback>>,
    state_callback: Mutex<Option<OperationStateCallback>>,
}

impl OperationSlot {
    pub fn new(owner: &Arc<SlotMap<OperationSlot>>, reply: ServerInfoCallback) -> Box<Self> {
        Box::new(Self {
            owner: Arc::downgrade(owner),
            reply: Mutex::new(Some(reply)),
            state_callback: Mutex::new(None),
        })
    }

    /// Hand the reply its result. Only the first delivery counts; `None`
    /// drops the reply, which the waiting side sees as a cancellation.
    pub fn deliver(&self, info: Option<ServerInfo>) {
        let Some(reply) = self.reply.lock().take() else {
            return;
        };
        match info {
            Some(info) => guarded("server info", move || reply(info)),
            None => log::warn!("server info request failed"),
        }
    }

    /// Swap the operation state callback, returning the previous one.
    pub fn replace_state_callback(
        &self,
        callback: Option<OperationStateCallback>,
    ) -> Option<OperationStateCallback> {
        std::mem::replace(&mut *self.state_callback.lock(), callback)
    }

    /// Report `state` for the operation at `key`.
    ///
    /// libpulse drops its callbacks after a terminal state, so the slot is
    /// retired before the callback runs. `userdata` is dangling afterwards.
    ///
    /// # Safety
    /// `userdata` must point to the live `OperationSlot` registered under `key`.
    pub unsafe fn dispatch_state(userdata: *mut c_void, key: usize, state: OperationState) {
        let (owner, callback) = {
            let slot = &*(userdata as *const OperationSlot);
            let callback = slot.state_callback.lock().clone();
            (slot.owner.clone(), callback)
        };

        if state.is_terminal() {
            if let Some(owner) = owner.upgrade() {
                let retired = owner.remove(key);
                drop(retired);
            }
        }
        if let Some(callback) = callback {
            guarded("operation state", || callback(state));
        }
    }
}
