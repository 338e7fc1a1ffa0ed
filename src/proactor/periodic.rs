//! Recurring timer registrations.

use std::cell::RefCell;
use std::time::Duration;

#[cfg(target_os = "linux")]
use std::cell::Cell;
#[cfg(target_os = "linux")]
use std::os::unix::io::RawFd;

/// One scheduled recurring timer.
///
/// The backend handles live here: Linux keeps the timer fd and the table
/// slot it is armed on; BSD only needs the registry id, which doubles as
/// the kevent ident.
pub(crate) struct PeriodicItem {
    pub(crate) task: RefCell<Box<dyn FnMut()>>,
    pub(crate) period: Duration,

    #[cfg(target_os = "linux")]
    pub(crate) timer_fd: Cell<RawFd>,

    #[cfg(target_os = "linux")]
    pub(crate) slot: Cell<u32>,
}

impl PeriodicItem {
    pub(crate) fn new(period: Duration, task: Box<dyn FnMut()>) -> Self {
        Self {
            task: RefCell::new(task),
            period,

            #[cfg(target_os = "linux")]
            timer_fd: Cell::new(-1),

            #[cfg(target_os = "linux")]
            slot: Cell::new(0),
        }
    }
}
