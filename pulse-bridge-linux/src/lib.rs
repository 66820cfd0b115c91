//! # pulse-bridge-linux
//!
//! libpulse backend for pulse-bridge.
//!
//! Provides:
//! - `LibPulse`: the `PulseApi` function table over libpulse's threaded mainloop
//! - `LibPulseSimple`: the `SimpleApi` function table over libpulse-simple
//! - `convert`: mappings between libpulse's C values and the core models
//! - `slots`: ownership of the closures libpulse calls back into
//!
//! ## Platform Requirements
//! - Linux with libpulse and libpulse-simple (`libpulse-dev` on Debian/Ubuntu)
//! - Build with `--features libpulse` to link them through libpulse-sys and
//!   libpulse-simple-sys
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use pulse_bridge_core::{Context, Mainloop};
//! use pulse_bridge_linux::LibPulse;
//!
//! let mainloop = Mainloop::new(Arc::new(LibPulse::new()))?;
//! let context = Context::new(&mainloop, "my-app")?;
//! context.connect_async()?.wait()?;
//! ```

pub mod convert;
pub mod slots;

#[cfg(all(target_os = "linux", feature = "libpulse"))]
pub mod libpulse;
#[cfg(all(target_os = "linux", feature = "libpulse"))]
pub mod simple;

#[cfg(all(target_os = "linux", feature = "libpulse"))]
pub use libpulse::LibPulse;
#[cfg(all(target_os = "linux", feature = "libpulse"))]
pub use simple::LibPulseSimple;
