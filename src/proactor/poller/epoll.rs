//! Linux `epoll` readiness backend.
//!
//! Completion tokens travel in the kernel's per-event user data and come
//! back verbatim, so registration masks pass through unchanged and the
//! event loop never touches platform structures. Errors are reported
//! through the mask itself, so the error word of every record is zero.

use super::common::{Completion, EV_BATCH_SIZE};

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
};
use std::io;
use std::os::unix::io::RawFd;

/// Linux poller wrapping one `epoll` instance.
pub(crate) struct Poller {
    epoll: RawFd,

    /// Kernel-filled record buffer, reused across waits.
    batch: [epoll_event; EV_BATCH_SIZE],
}

impl Poller {
    pub(crate) fn new() -> Self {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        assert!(
            epoll >= 0,
            "epoll_create1 failed: {}",
            io::Error::last_os_error()
        );
        log::debug!("created epoll fd {epoll}");

        Self {
            epoll,
            batch: unsafe { std::mem::zeroed() },
        }
    }

    /// Registers `fd` for `mask`, with `token` as the completion user data.
    pub(crate) fn add(&self, fd: RawFd, mask: u32, token: u64) {
        let mut event = epoll_event {
            events: mask,
            u64: token,
        };

        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
        assert_eq!(
            rc,
            0,
            "epoll_ctl(ADD, fd={fd}) failed: {}",
            io::Error::last_os_error()
        );
    }

    /// Removes `fd` from the interest set.
    pub(crate) fn del(&self, fd: RawFd) {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        assert_eq!(
            rc,
            0,
            "epoll_ctl(DEL, fd={fd}) failed: {}",
            io::Error::last_os_error()
        );
    }

    /// Waits up to `timeout_ms` (`-1` blocks indefinitely) and fills `out`
    /// with up to [`EV_BATCH_SIZE`] completions. Returns the record count.
    pub(crate) fn wait(&mut self, out: &mut Vec<Completion>, timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.batch.as_mut_ptr(),
                EV_BATCH_SIZE as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        out.clear();
        for record in &self.batch[..n as usize] {
            out.push(Completion::Io {
                token: record.u64,
                mask: record.events,
                error: 0,
            });
        }

        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll) };
    }
}

/// Cross-thread wake primitive: an `eventfd` the owning proactor arms
/// through its callback table with a drain callback.
pub(crate) struct WakeFd {
    fd: RawFd,
}

impl WakeFd {
    pub(crate) fn new(_poller: &Poller) -> Self {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0, "eventfd failed: {}", io::Error::last_os_error());

        Self { fd }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Fires the wake event. Callable from any thread; repeated fires
    /// accumulate in the counter and coalesce into one readiness event.
    pub(crate) fn fire(&self) {
        let val: u64 = 1;
        let n = unsafe { libc::write(self.fd, &val as *const u64 as *const _, 8) };
        if n != 8 {
            log::error!("wake eventfd write failed: {}", io::Error::last_os_error());
        }
    }

    /// Drains the counter after a read-readiness completion.
    pub(crate) fn drain(&self) {
        let mut val: u64 = 0;
        let n = unsafe { libc::read(self.fd, &mut val as *mut u64 as *mut _, 8) };
        if n != 8 {
            log::error!("wake eventfd read failed: {}", io::Error::last_os_error());
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
