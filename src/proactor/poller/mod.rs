//! Platform readiness backends.
//!
//! Each backend exposes the same small operation set — create, add, delete,
//! wait — plus the cross-thread wake primitive, so neither the callback
//! table nor the event loop ever sees which multiplexer is underneath.
//!
//! The concrete implementation is selected at compile time depending on the
//! target operating system.

pub(crate) mod common;

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(any(target_os = "freebsd", target_os = "macos"))]
mod kqueue;

#[cfg(target_os = "linux")]
pub(crate) use epoll::{Poller, WakeFd};

#[cfg(any(target_os = "freebsd", target_os = "macos"))]
pub(crate) use kqueue::{Poller, WakeFd};

pub use common::{EV_ERR, EV_ET, EV_HUP, EV_IN, EV_OUT};
