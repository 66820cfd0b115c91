//! [`PulseApi`] over the system libpulse, through the libpulse-sys bindings.
//!
//! libpulse hands every callback a `void *userdata`. The closures behind it
//! are owned by [`slots`](crate::slots), keyed by the address of the native
//! object they belong to.

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;

use libpulse_sys as pa;

use pulse_bridge_core::models::config::ContextFlags;
use pulse_bridge_core::models::sample::SampleSpec;
use pulse_bridge_core::models::server_info::ServerInfo;
use pulse_bridge_core::models::state::{ContextState, OperationState};
use pulse_bridge_core::native::handle::RawHandle;
use pulse_bridge_core::traits::native_api::{
    ContextStateCallback, OperationStateCallback, PulseApi, ServerInfoCallback,
};

use crate::convert;
use crate::slots::{self, ContextSlot, OperationSlot, SlotMap};

/// The libpulse function table.
///
/// Stateless apart from the callback slots; one instance can serve any
/// number of mainloops.
#[derive(Default)]
pub struct LibPulse {
    contexts: SlotMap<ContextSlot>,
    operations: Arc<SlotMap<OperationSlot>>,
}

impl LibPulse {
    pub fn new() -> Self {
        Self::default()
    }
}

fn mainloop_ptr(raw: RawHandle) -> *mut pa::pa_threaded_mainloop {
    raw.as_ptr()
}

fn context_ptr(raw: RawHandle) -> *mut pa::pa_context {
    raw.as_ptr()
}

fn operation_ptr(raw: RawHandle) -> *mut pa::pa_operation {
    raw.as_ptr()
}

extern "C" fn context_state_trampoline(context: *mut pa::pa_context, userdata: *mut c_void) {
    unsafe {
        let state = convert::context_state_from_sys(pa::pa_context_get_state(context));
        ContextSlot::dispatch(userdata, state);
    }
}

extern "C" fn server_info_trampoline(
    _context: *mut pa::pa_context,
    info: *const pa::pa_server_info,
    userdata: *mut c_void,
) {
    unsafe {
        let slot = &*(userdata as *const OperationSlot);
        // Null when the request failed.
        let info = info.as_ref().map(|info| server_info_from_sys(info));
        slot.deliver(info);
    }
}

extern "C" fn operation_state_trampoline(operation: *mut pa::pa_operation, userdata: *mut c_void) {
    unsafe {
        let state = convert::operation_state_from_sys(pa::pa_operation_get_state(operation));
        OperationSlot::dispatch_state(userdata, operation as usize, state);
    }
}

unsafe fn server_info_from_sys(info: &pa::pa_server_info) -> ServerInfo {
    ServerInfo {
        user_name: convert::from_c_string(info.user_name).unwrap_or_default(),
        host_name: convert::from_c_string(info.host_name).unwrap_or_default(),
        server_version: convert::from_c_string(info.server_version).unwrap_or_default(),
        server_name: convert::from_c_string(info.server_name).unwrap_or_default(),
        sample_spec: SampleSpec {
            format: convert::sample_format_from_sys(info.sample_spec.format),
            rate: info.sample_spec.rate,
            channels: info.sample_spec.channels,
        },
        default_sink_name: convert::from_c_string(info.default_sink_name),
        default_source_name: convert::from_c_string(info.default_source_name),
        cookie: info.cookie,
    }
}

impl PulseApi for LibPulse {
    fn mainloop_new(&self) -> Option<RawHandle> {
        RawHandle::from_ptr(unsafe { pa::pa_threaded_mainloop_new() })
    }

    fn mainloop_free(&self, mainloop: RawHandle) {
        unsafe { pa::pa_threaded_mainloop_free(mainloop_ptr(mainloop)) }
    }

    fn mainloop_start(&self, mainloop: RawHandle) -> i32 {
        unsafe { pa::pa_threaded_mainloop_start(mainloop_ptr(mainloop)) }
    }

    fn mainloop_stop(&self, mainloop: RawHandle) {
        unsafe { pa::pa_threaded_mainloop_stop(mainloop_ptr(mainloop)) }
    }

    fn mainloop_lock(&self, mainloop: RawHandle) {
        unsafe { pa::pa_threaded_mainloop_lock(mainloop_ptr(mainloop)) }
    }

    fn mainloop_unlock(&self, mainloop: RawHandle) {
        unsafe { pa::pa_threaded_mainloop_unlock(mainloop_ptr(mainloop)) }
    }

    fn mainloop_wait(&self, mainloop: RawHandle) {
        unsafe { pa::pa_threaded_mainloop_wait(mainloop_ptr(mainloop)) }
    }

    fn mainloop_signal(&self, mainloop: RawHandle, wait_for_accept: bool) {
        unsafe { pa::pa_threaded_mainloop_signal(mainloop_ptr(mainloop), wait_for_accept as i32) }
    }

    fn mainloop_accept(&self, mainloop: RawHandle) {
        unsafe { pa::pa_threaded_mainloop_accept(mainloop_ptr(mainloop)) }
    }

    fn mainloop_in_thread(&self, mainloop: RawHandle) -> bool {
        unsafe { pa::pa_threaded_mainloop_in_thread(mainloop_ptr(mainloop)) != 0 }
    }

    fn mainloop_get_api(&self, mainloop: RawHandle) -> RawHandle {
        let api = unsafe { pa::pa_threaded_mainloop_get_api(mainloop_ptr(mainloop)) };
        // The vtable is embedded in the mainloop object and never null.
        RawHandle::from_ptr(api as *mut pa::pa_mainloop_api).unwrap_or(mainloop)
    }

    fn mainloop_set_name(&self, mainloop: RawHandle, name: &str) {
        if let Some(name) = convert::to_c_string("thread name", name) {
            unsafe { pa::pa_threaded_mainloop_set_name(mainloop_ptr(mainloop), name.as_ptr()) }
        }
    }

    fn mainloop_get_retval(&self, mainloop: RawHandle) -> i32 {
        unsafe { pa::pa_threaded_mainloop_get_retval(mainloop_ptr(mainloop)) }
    }

    fn context_new(&self, mainloop_api: RawHandle, application_name: &str) -> Option<RawHandle> {
        let name = convert::to_c_string("application name", application_name)?;
        let api: *mut pa::pa_mainloop_api = mainloop_api.as_ptr();
        RawHandle::from_ptr(unsafe { pa::pa_context_new(api, name.as_ptr()) })
    }

    fn context_unref(&self, context: RawHandle) {
        // Unlinking the context cancels its operations, which frees their slots.
        unsafe {
            pa::pa_context_set_state_callback(context_ptr(context), None, ptr::null_mut());
            pa::pa_context_unref(context_ptr(context));
        }
        drop(self.contexts.remove(context.get()));
    }

    fn context_connect(&self, context: RawHandle, server: Option<&str>, flags: ContextFlags) -> i32 {
        let server = match server {
            Some(server) => match convert::to_c_string("server", server) {
                Some(server) => Some(server),
                None => return -1,
            },
            None => None,
        };
        let server_ptr = server.as_ref().map_or(ptr::null(), |server| server.as_ptr());
        unsafe {
            pa::pa_context_connect(
                context_ptr(context),
                server_ptr,
                convert::context_flags_to_sys(flags),
                ptr::null(),
            )
        }
    }

    fn context_disconnect(&self, context: RawHandle) {
        unsafe { pa::pa_context_disconnect(context_ptr(context)) }
    }

    fn context_get_state(&self, context: RawHandle) -> ContextState {
        convert::context_state_from_sys(unsafe { pa::pa_context_get_state(context_ptr(context)) })
    }

    fn context_errno(&self, context: RawHandle) -> i32 {
        unsafe { pa::pa_context_errno(context_ptr(context)) }
    }

    fn context_set_state_callback(&self, context: RawHandle, callback: Option<ContextStateCallback>) {
        let retired = match callback {
            Some(callback) => {
                let slot = ContextSlot::new(callback);
                unsafe {
                    pa::pa_context_set_state_callback(
                        context_ptr(context),
                        Some(context_state_trampoline),
                        slots::userdata(&*slot),
                    )
                };
                self.contexts.insert(context.get(), slot)
            }
            None => {
                unsafe {
                    pa::pa_context_set_state_callback(context_ptr(context), None, ptr::null_mut())
                };
                self.contexts.remove(context.get())
            }
        };
        drop(retired);
    }

    fn context_get_server_info(
        &self,
        context: RawHandle,
        callback: ServerInfoCallback,
    ) -> Option<RawHandle> {
        let slot = OperationSlot::new(&self.operations, callback);
        let userdata = slots::userdata(&*slot);

        let operation = unsafe {
            pa::pa_context_get_server_info(
                context_ptr(context),
                Some(server_info_trampoline),
                userdata,
            )
        };
        let raw = RawHandle::from_ptr(operation)?;

        // Called under the loop lock: the reply cannot arrive before the
        // slot is registered.
        unsafe {
            pa::pa_operation_set_state_callback(operation, Some(operation_state_trampoline), userdata)
        };
        self.operations.insert(raw.get(), slot);
        Some(raw)
    }

    fn operation_ref(&self, operation: RawHandle) -> RawHandle {
        let referenced = unsafe { pa::pa_operation_ref(operation_ptr(operation)) };
        RawHandle::from_ptr(referenced).unwrap_or(operation)
    }

    fn operation_unref(&self, operation: RawHandle) {
        unsafe { pa::pa_operation_unref(operation_ptr(operation)) }
    }

    fn operation_cancel(&self, operation: RawHandle) {
        unsafe { pa::pa_operation_cancel(operation_ptr(operation)) }
    }

    fn operation_get_state(&self, operation: RawHandle) -> OperationState {
        convert::operation_state_from_sys(unsafe {
            pa::pa_operation_get_state(operation_ptr(operation))
        })
    }

    fn operation_set_state_callback(
        &self,
        operation: RawHandle,
        callback: Option<OperationStateCallback>,
    ) {
        match self
            .operations
            .with(operation.get(), |slot| slot.replace_state_callback(callback))
        {
            Some(previous) => drop(previous),
            // Finished: libpulse no longer reports state changes.
            None => log::debug!("operation {:?} already finished", operation),
        }
    }

    fn strerror(&self, code: i32) -> String {
        unsafe { convert::from_c_string(pa::pa_strerror(code)) }
            .unwrap_or_else(|| format!("error {}", code))
    }
}
