//! A single-threaded I/O proactor for cooperative fiber schedulers.
//!
//! One proactor owns one OS thread. Its event loop interleaves three
//! sources of work: a cross-thread task inbox, fibers that became runnable,
//! and readiness events from the OS multiplexer (epoll on Linux, kqueue on
//! BSD/macOS). Sockets and timers subscribe to readiness through the
//! [`arm`](Proactor::arm)/[`disarm`](Proactor::disarm) surface; other
//! threads inject work through a [`ProactorHandle`].

mod proactor;
mod utils;

pub mod scheduler;

pub use proactor::core::{Proactor, ProactorStats};
pub use proactor::handle::ProactorHandle;
pub use proactor::poller::{EV_ERR, EV_ET, EV_HUP, EV_IN, EV_OUT};
pub use scheduler::Scheduler;
