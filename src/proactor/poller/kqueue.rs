//! BSD `kqueue` readiness backend.
//!
//! kevent filters are normalized into the portable mask bits so the
//! dispatch path is identical across platforms: `EVFILT_READ` maps to
//! [`EV_IN`], `EVFILT_WRITE` to [`EV_OUT`] and `EV_EOF` to [`EV_HUP`];
//! the error word carries `fflags`. A user event with the ignore token is
//! pre-registered as the wake primitive, and `EVFILT_TIMER` records
//! surface the periodic-timer id directly.

use super::common::{Completion, EV_BATCH_SIZE, EV_HUP, EV_IN, EV_OUT, IGNORE_TOKEN};

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// BSD poller wrapping one `kqueue` instance.
pub(crate) struct Poller {
    kq: RawFd,

    /// Kernel-filled record buffer, reused across waits.
    batch: [libc::kevent; EV_BATCH_SIZE],
}

impl Poller {
    pub(crate) fn new() -> Self {
        let kq = unsafe { libc::kqueue() };
        assert!(kq >= 0, "kqueue failed: {}", io::Error::last_os_error());
        log::debug!("created kqueue fd {kq}");

        // Pre-register the user event other threads trigger to break a
        // blocking wait.
        let change = kev(0, libc::EVFILT_USER, libc::EV_ADD | libc::EV_CLEAR, IGNORE_TOKEN);
        let rc = unsafe { libc::kevent(kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        assert_eq!(
            rc,
            0,
            "kevent(EVFILT_USER) failed: {}",
            io::Error::last_os_error()
        );

        Self {
            kq,
            batch: unsafe { std::mem::zeroed() },
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.kq
    }

    /// Registers `fd` under `token`. Read and write interests become
    /// separate filters; both are edge-cleared.
    pub(crate) fn add(&self, fd: RawFd, mask: u32, token: u64) {
        let mut changes: [libc::kevent; 2] = unsafe { std::mem::zeroed() };
        let mut n = 0;

        if mask & EV_IN != 0 {
            changes[n] = kev(fd as usize, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR, token);
            n += 1;
        }
        if mask & EV_OUT != 0 {
            changes[n] = kev(fd as usize, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR, token);
            n += 1;
        }

        let rc =
            unsafe { libc::kevent(self.kq, changes.as_ptr(), n as i32, ptr::null_mut(), 0, ptr::null()) };
        assert_eq!(
            rc,
            0,
            "kevent(ADD, fd={fd}) failed: {}",
            io::Error::last_os_error()
        );
    }

    /// Removes both filters for `fd`. A filter that was never added reports
    /// `ENOENT`, which is not an error here.
    pub(crate) fn del(&self, fd: RawFd) {
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            let change = kev(fd as usize, filter, libc::EV_DELETE, 0);
            let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    panic!("kevent(DELETE, fd={fd}) failed: {err}");
                }
            }
        }
    }

    /// Adds a recurring kernel timer firing every `period_ms`.
    pub(crate) fn add_timer(&self, id: u64, period_ms: i64) {
        let mut change = kev(id as usize, libc::EVFILT_TIMER, libc::EV_ADD | libc::EV_ENABLE, id);
        change.data = period_ms as _;

        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        assert_eq!(
            rc,
            0,
            "kevent(EVFILT_TIMER, id={id}) failed: {}",
            io::Error::last_os_error()
        );
    }

    pub(crate) fn del_timer(&self, id: u64) {
        let change = kev(id as usize, libc::EVFILT_TIMER, libc::EV_DELETE, 0);
        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        assert_eq!(
            rc,
            0,
            "kevent(DELETE timer, id={id}) failed: {}",
            io::Error::last_os_error()
        );
    }

    /// Waits up to `timeout_ms` (`-1` blocks indefinitely) and fills `out`
    /// with up to [`EV_BATCH_SIZE`] completions. Returns the record count.
    pub(crate) fn wait(&mut self, out: &mut Vec<Completion>, timeout_ms: i32) -> io::Result<usize> {
        let ts = libc::timespec {
            tv_sec: (timeout_ms / 1000) as _,
            tv_nsec: ((timeout_ms % 1000) as i64 * 1_000_000) as _,
        };
        let ts_ptr = if timeout_ms < 0 { ptr::null() } else { &ts as *const _ };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                self.batch.as_mut_ptr(),
                EV_BATCH_SIZE as i32,
                ts_ptr,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        out.clear();
        for record in &self.batch[..n as usize] {
            if record.filter == libc::EVFILT_TIMER {
                out.push(Completion::Timer {
                    id: record.ident as u64,
                });
                continue;
            }

            let mask = if record.flags & libc::EV_EOF != 0 {
                EV_HUP
            } else {
                match record.filter {
                    libc::EVFILT_READ => EV_IN,
                    libc::EVFILT_WRITE => EV_OUT,
                    // The wake user-event; dispatch skips it by token.
                    libc::EVFILT_USER => 0,
                    other => panic!("unsupported kevent filter {other}"),
                }
            };

            out.push(Completion::Io {
                token: record.udata as u64,
                mask,
                error: record.fflags as i32,
            });
        }

        Ok(n as usize)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

/// Cross-thread wake primitive: triggers the pre-registered user event.
/// `kevent` on a shared descriptor is thread-safe, so no extra fd is needed.
pub(crate) struct WakeFd {
    kq: RawFd,
}

impl WakeFd {
    pub(crate) fn new(poller: &Poller) -> Self {
        Self { kq: poller.raw_fd() }
    }

    pub(crate) fn fire(&self) {
        let mut change = kev(0, libc::EVFILT_USER, 0, IGNORE_TOKEN);
        change.fflags = libc::NOTE_TRIGGER;

        let rc = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if rc != 0 {
            log::error!("wake trigger failed: {}", io::Error::last_os_error());
        }
    }
}

fn kev(ident: usize, filter: i16, flags: u16, token: u64) -> libc::kevent {
    let mut kev: libc::kevent = unsafe { std::mem::zeroed() };
    kev.ident = ident as _;
    kev.filter = filter as _;
    kev.flags = flags as _;
    kev.udata = token as _;
    kev
}
