//! # pulse-bridge-core
//!
//! Safe, thread-aware bridge over a callback-driven audio-server client
//! library with a threaded event loop.
//!
//! Every native callback runs on one background event thread; application
//! threads serialize against it through the loop lock and receive results
//! as awaitable [`Completion`]s. Platform backends (libpulse on Linux)
//! implement the [`PulseApi`] and [`SimpleApi`] function tables.
//!
//! ## Architecture
//!
//! ```text
//! pulse-bridge-core (this crate)
//! ├── traits/     ← PulseApi, SimpleApi (native function tables)
//! ├── models/     ← BridgeError, ContextState, OperationState, configuration, ServerInfo
//! ├── native/     ← RawHandle, NativeHandle (exactly-once release)
//! ├── mainloop/   ← Mainloop, LoopGuard
//! ├── context/    ← Context (connection state machine)
//! ├── operation/  ← Operation, Promise / Completion
//! ├── simple/     ← SimpleStream (blocking byte streams)
//! └── testing/    ← FakePulse, FakeSimple (feature "testing")
//! ```
//!
//! ## Usage
//! ```ignore
//! let mainloop = Mainloop::new(Arc::new(LibPulse::new()))?;
//! let context = Context::new(&mainloop, "my-app")?;
//! context.connect_async()?.wait()?;
//! let info = context.get_server_info_async()?.wait()?;
//! context.disconnect_async()?.wait()?;
//! ```

pub mod context;
pub mod mainloop;
pub mod models;
pub mod native;
pub mod operation;
pub mod simple;
pub mod traits;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export key types at crate root for convenience.
pub use context::connection::{Context, StateCallback};
pub use mainloop::threaded::{LoopGuard, Mainloop};
pub use models::config::{ContextConfiguration, ContextFlags, MainloopConfiguration};
pub use models::error::{BridgeError, Cancelled};
pub use models::sample::{BufferAttributes, SampleFormat, SampleSpec, StreamDirection};
pub use models::server_info::ServerInfo;
pub use models::state::{ContextState, OperationState};
pub use native::handle::{NativeHandle, RawHandle};
pub use operation::async_op::Operation;
pub use operation::promise::{promise, Completion, Promise};
pub use simple::stream::{SimpleStream, SimpleStreamConfiguration};
pub use traits::native_api::{
    ContextStateCallback, OperationStateCallback, PulseApi, ServerInfoCallback,
};
pub use traits::simple_api::{SimpleApi, SimpleStreamParams};
