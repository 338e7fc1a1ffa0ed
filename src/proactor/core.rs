//! The proactor: event loop, registration surface and statistics.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use super::handle::ProactorHandle;
use super::inbox::{Inbox, WAIT_SECTION_STATE};
use super::periodic::PeriodicItem;
use super::poller::common::{pack_token, Completion, EV_BATCH_SIZE, IGNORE_TOKEN, RESERVED_BASE};
use super::poller::{Poller, WakeFd};
use super::table::{CallbackTable, EventCb};
use crate::scheduler::Scheduler;
use crate::utils::clock;

/// Fully-idle iterations before the loop is willing to block.
const MAX_SPIN_LIMIT: u32 = 5;

/// Soft budget for one inbox sweep, in nanoseconds.
const TASK_BUDGET_NS: u64 = 500_000;

/// Tasks drained between availability pulses within one sweep.
const NOTIFY_BATCH: u32 = 32;

/// Initial callback-table capacity.
const INIT_CENTRIES: usize = 512;

/// State shared with [`ProactorHandle`]s on other threads.
pub(crate) struct Shared {
    pub(crate) pool_index: u32,
    pub(crate) inbox: Inbox,
    pub(crate) wake: WakeFd,

    /// Flipped on-thread by a dispatched stop request; the loop consults
    /// it only at its sleep gate. Starts true so a proactor that never ran
    /// can be dropped.
    pub(crate) stopped: AtomicBool,
}

#[derive(Default)]
struct Counters {
    loop_cnt: Cell<u64>,
    num_stalls: Cell<u64>,
    completions_fetches: Cell<u64>,
    num_task_runs: Cell<u64>,
    task_interrupts: Cell<u64>,
}

fn bump(counter: &Cell<u64>) {
    counter.set(counter.get() + 1);
}

/// Point-in-time statistics snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProactorStats {
    /// Loop iterations.
    pub loop_cnt: u64,

    /// Times the loop committed to blocking on the backend.
    pub num_stalls: u64,

    /// Completion batches fetched from the backend.
    pub completions_fetches: u64,

    /// Inbox tasklets executed.
    pub num_task_runs: u64,

    /// Inbox sweeps cut short by the task budget.
    pub task_interrupts: u64,

    /// Cross-thread wake-fd fires.
    pub tq_wakeups: u64,

    /// Armed callback-table entries.
    pub armed_entries: usize,

    /// Callback-table capacity.
    pub centries_capacity: usize,
}

/// A single-threaded I/O proactor.
///
/// One instance owns one OS thread: construction records the owning thread
/// and [`run`](Self::run) must be called on it. Everything the loop touches
/// — the callback table, the readiness backend, periodic timers — is
/// thread-confined; the only cross-thread entry points are on
/// [`ProactorHandle`].
pub struct Proactor {
    shared: Arc<Shared>,
    poller: RefCell<Poller>,
    centries: RefCell<CallbackTable>,

    periodic: RefCell<HashMap<u64, Rc<PeriodicItem>>>,
    next_periodic_id: Cell<u64>,

    /// Low-priority tasklets, drained once per loop iteration.
    l2_queue: RefCell<VecDeque<Box<dyn FnOnce(&Proactor)>>>,

    /// Callbacks run only on fully-idle iterations.
    idle_tasks: RefCell<Vec<Box<dyn FnMut() -> bool>>>,

    owner: ThreadId,

    /// Monotonic clock cached per loop phase, so tasklets and callbacks
    /// observing time do not hit the OS clock on every call.
    monotonic_time: Cell<u64>,

    counters: Counters,
}

impl Proactor {
    /// Creates a proactor on the current thread. `pool_index` identifies it
    /// among sibling proactors.
    pub fn new(pool_index: u32) -> Self {
        let poller = Poller::new();
        let wake = WakeFd::new(&poller);

        let proactor = Self {
            shared: Arc::new(Shared {
                pool_index,
                inbox: Inbox::new(),
                wake,
                stopped: AtomicBool::new(true),
            }),
            poller: RefCell::new(poller),
            centries: RefCell::new(CallbackTable::with_capacity(INIT_CENTRIES)),
            periodic: RefCell::new(HashMap::new()),
            next_periodic_id: Cell::new(0),
            l2_queue: RefCell::new(VecDeque::new()),
            idle_tasks: RefCell::new(Vec::new()),
            owner: thread::current().id(),
            monotonic_time: Cell::new(clock::monotonic_ns()),
            counters: Counters::default(),
        };

        // Linux delivers wakes through a regular table registration with a
        // drain callback; the BSD backend pre-registers its user event with
        // the ignore token instead.
        #[cfg(target_os = "linux")]
        {
            let shared = proactor.shared.clone();
            proactor.arm(
                proactor.shared.wake.fd(),
                move |_, _, _: &Proactor| shared.wake.drain(),
                super::poller::common::EV_IN,
            );
        }

        proactor
    }

    /// A cloneable handle for cross-thread submission.
    pub fn handle(&self) -> ProactorHandle {
        ProactorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Index of this proactor among its siblings.
    pub fn pool_index(&self) -> u32 {
        self.shared.pool_index
    }

    /// Registers `fd` for multishot readiness under `mask`.
    ///
    /// `cb` runs on the proactor thread for every completion until
    /// [`disarm`](Self::disarm); it receives the event mask, the backend
    /// error word and the proactor, and may arm or disarm freely. Linux
    /// masks reach the kernel unchanged, so callers opt into edge
    /// triggering with [`EV_ET`](crate::EV_ET); BSD registrations are
    /// always edge-cleared.
    pub fn arm<F>(&self, fd: RawFd, cb: F, mask: u32) -> u32
    where
        F: Fn(u32, i32, &Proactor) + 'static,
    {
        let (slot, generation) = self.centries.borrow_mut().arm(Rc::new(cb) as EventCb);
        log::trace!("arm fd {fd} on slot {slot} gen {generation}");

        self.poller.borrow().add(fd, mask, pack_token(slot, generation));
        slot
    }

    /// Removes the registration on `slot` and returns it to the free list.
    ///
    /// Must run on the owning thread. Completions already fetched for the
    /// old registration are discarded by the generation check.
    pub fn disarm(&self, fd: RawFd, slot: u32) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "disarm off the proactor thread"
        );
        log::trace!("disarm fd {fd} slot {slot}");

        self.centries.borrow_mut().disarm(slot);
        self.poller.borrow().del(fd);
    }

    /// Starts a recurring timer invoking `task` every `period`.
    pub fn add_periodic<F>(&self, period: Duration, task: F) -> u64
    where
        F: FnMut() + 'static,
    {
        let id = self.next_periodic_id.get();
        self.next_periodic_id.set(id + 1);

        let item = Rc::new(PeriodicItem::new(period, Box::new(task)));
        self.schedule_periodic(id, &item);
        self.periodic.borrow_mut().insert(id, item);

        log::trace!("periodic {id} every {period:?}");
        id
    }

    #[cfg(target_os = "linux")]
    fn schedule_periodic(&self, _id: u64, item: &Rc<PeriodicItem>) {
        let tfd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        assert!(
            tfd >= 0,
            "timerfd_create failed: {}",
            io::Error::last_os_error()
        );
        item.timer_fd.set(tfd);

        let cb_item = Rc::clone(item);
        let slot = self.arm(
            tfd,
            move |_, _, proactor: &Proactor| proactor.periodic_cb(&cb_item),
            super::poller::common::EV_IN,
        );
        item.slot.set(slot);

        let its = libc::itimerspec {
            it_interval: timespec_of(item.period),
            it_value: timespec_of(item.period),
        };
        let rc = unsafe { libc::timerfd_settime(tfd, 0, &its, std::ptr::null_mut()) };
        assert_eq!(
            rc,
            0,
            "timerfd_settime failed: {}",
            io::Error::last_os_error()
        );
    }

    #[cfg(any(target_os = "freebsd", target_os = "macos"))]
    fn schedule_periodic(&self, id: u64, item: &Rc<PeriodicItem>) {
        let period_ms = item.period.as_millis() as i64;
        self.poller.borrow().add_timer(id, period_ms);
    }

    /// Stops the recurring timer `id`.
    ///
    /// Must run on the owning thread. No further invocations occur after
    /// cancellation: a timer record already fetched resolves to a missing
    /// registry entry and is discarded.
    pub fn cancel_periodic(&self, id: u64) {
        let Some(item) = self.periodic.borrow_mut().remove(&id) else {
            log::error!("cancel of unknown periodic timer {id}");
            return;
        };
        log::trace!("cancel periodic {id}");

        #[cfg(target_os = "linux")]
        {
            let tfd = item.timer_fd.get();
            self.disarm(tfd, item.slot.get());
            if unsafe { libc::close(tfd) } == -1 {
                log::error!(
                    "could not close timer fd {tfd}: {}",
                    io::Error::last_os_error()
                );
            }
        }

        #[cfg(any(target_os = "freebsd", target_os = "macos"))]
        self.poller.borrow().del_timer(id);
    }

    fn periodic_cb(&self, item: &PeriodicItem) {
        (item.task.borrow_mut())();

        // Acknowledge expirations so the timer fd stops reading ready.
        #[cfg(target_os = "linux")]
        {
            let mut expirations: u64 = 0;
            let n = unsafe {
                libc::read(
                    item.timer_fd.get(),
                    &mut expirations as *mut u64 as *mut _,
                    8,
                )
            };
            if n == -1 {
                log::error!("error reading timer fd: {}", io::Error::last_os_error());
            }
        }
    }

    /// Queues a low-priority tasklet, run once per loop iteration after
    /// completion dispatch. On-thread counterpart of
    /// [`ProactorHandle::dispatch`].
    pub fn dispatch_l2<F>(&self, task: F)
    where
        F: FnOnce(&Proactor) + 'static,
    {
        self.l2_queue.borrow_mut().push_back(Box::new(task));
    }

    /// Registers an idle-time callback.
    ///
    /// It runs only on iterations with no other work. Returning true
    /// reports progress, which holds off the spin/sleep escalation for
    /// that iteration.
    pub fn on_idle<F>(&self, task: F)
    where
        F: FnMut() -> bool + 'static,
    {
        self.idle_tasks.borrow_mut().push(Box::new(task));
    }

    /// Marks the proactor stopped. The loop observes the flag at its sleep
    /// gate, once all pending work has drained. Usually reached through
    /// [`ProactorHandle::stop`].
    pub fn request_stop(&self) {
        self.shared.stopped.store(true, Ordering::Relaxed);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> ProactorStats {
        let centries = self.centries.borrow();

        ProactorStats {
            loop_cnt: self.counters.loop_cnt.get(),
            num_stalls: self.counters.num_stalls.get(),
            completions_fetches: self.counters.completions_fetches.get(),
            num_task_runs: self.counters.num_task_runs.get(),
            task_interrupts: self.counters.task_interrupts.get(),
            tq_wakeups: self.shared.inbox.wakeups.load(Ordering::Relaxed),
            armed_entries: centries.armed_len(),
            centries_capacity: centries.capacity(),
        }
    }

    /// Runs the event loop on the owning thread until a stop request is
    /// observed at the sleep gate.
    ///
    /// Each iteration interleaves, in order: an inbox sweep, remote-ready
    /// fiber intake, the sleep handshake and timeout choice, the backend
    /// wait, completion dispatch, low-priority tasks, one fiber step, and
    /// — only when fully idle — terminated-fiber reclamation, idle tasks
    /// and the adaptive spin.
    pub fn run<S: Scheduler>(&self, scheduler: &mut S) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "run off the owning thread"
        );
        log::debug!("proactor {} entering main loop", self.shared.pool_index);

        self.shared.stopped.store(false, Ordering::Relaxed);

        let inbox = &self.shared.inbox;
        let mut completions: Vec<Completion> = Vec::with_capacity(EV_BATCH_SIZE);
        let mut spin_loops: u32 = 0;

        loop {
            bump(&self.counters.loop_cnt);

            let tq_seq = inbox.seq.load(Ordering::Acquire);
            let task_queue_exhausted = self.drain_inbox();

            // Remote fibers come in inside the tq_seq section, before the
            // ready check below.
            scheduler.process_remote_ready();

            let mut timeout = 0;

            // Blocking requires a drained inbox, no ready fibers and a
            // spent spin allowance. The CAS advertises the wait section to
            // producers; it fails if any of them bumped the sequence since
            // it was read above, in which case we spin once more.
            if task_queue_exhausted && !scheduler.has_ready() && spin_loops >= MAX_SPIN_LIMIT {
                spin_loops = 0;
                if inbox
                    .seq
                    .compare_exchange_weak(
                        tq_seq,
                        WAIT_SECTION_STATE,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // All pending events are processed here; it is up to
                    // the caller to stop the incoming flow before stopping
                    // the proactor.
                    if self.shared.stopped.load(Ordering::Relaxed) {
                        break;
                    }
                    bump(&self.counters.num_stalls);
                    timeout = -1;
                }
            }

            if timeout == -1 && scheduler.has_sleeping_fibers() {
                if let Some(deadline) = scheduler.next_sleep_point() {
                    timeout = wait_timeout_ms(deadline, Instant::now());
                }
            }

            let fetched = match self.poller.borrow_mut().wait(&mut completions, timeout) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => panic!("readiness wait failed: {err}"),
            };

            // Publish the running state; producers stop firing the wake fd
            // from here on.
            inbox.seq.store(0, Ordering::Release);

            let mut cqe_count = fetched;
            if cqe_count > 0 {
                bump(&self.counters.completions_fetches);
                self.monotonic_time.set(clock::monotonic_ns());

                // A full batch means the backend may hold more; re-fetch
                // without blocking until a short batch shows it is drained.
                loop {
                    self.dispatch_completions(&completions);
                    if completions.len() < EV_BATCH_SIZE {
                        break;
                    }
                    match self.poller.borrow_mut().wait(&mut completions, 0) {
                        Ok(_) => bump(&self.counters.completions_fetches),
                        Err(_) => break,
                    }
                }
            }

            self.run_l2_tasks();

            // One step only; a non-quiescent scheduler sets the sentinel so
            // the next iteration skips the idle phase.
            if !scheduler.run_worker_fibers_step() {
                cqe_count = 1;
            }

            if cqe_count != 0 {
                continue;
            }

            scheduler.destroy_terminated();
            if !self.run_on_idle_tasks() {
                pause(spin_loops);
                spin_loops += 1;
            }
        }

        let stats = self.stats();
        log::debug!(
            "proactor {} exiting: loops/stalls/fetches {}/{}/{}, tasks/interrupts {}/{}, \
             wakeups {}, centries {}",
            self.shared.pool_index,
            stats.loop_cnt,
            stats.num_stalls,
            stats.completions_fetches,
            stats.num_task_runs,
            stats.task_interrupts,
            stats.tq_wakeups,
            stats.centries_capacity,
        );
    }

    /// Sweeps the inbox under the task budget, pulsing the availability
    /// notifier so producers can refill while the sweep runs. Returns
    /// whether the queue was observed empty at the end.
    fn drain_inbox(&self) -> bool {
        let inbox = &self.shared.inbox;
        let Some(mut task) = inbox.queue.pop() else {
            return true;
        };

        let mut exhausted = true;
        let mut cnt: u32 = 0;
        let start = clock::monotonic_ns();
        self.monotonic_time.set(start);

        loop {
            task(self);
            cnt += 1;

            self.monotonic_time.set(clock::monotonic_ns());
            if start + TASK_BUDGET_NS < self.monotonic_time.get() {
                bump(&self.counters.task_interrupts);
                exhausted = false;
                break;
            }

            if cnt == NOTIFY_BATCH {
                // Unparking producers mid-sweep lets them keep pushing
                // while this loop keeps unloading.
                inbox.avail.notify_all();
            }

            match inbox.queue.pop() {
                Some(next) => task = next,
                None => break,
            }
        }

        self.counters
            .num_task_runs
            .set(self.counters.num_task_runs.get() + cnt as u64);
        inbox.avail.notify_all();
        exhausted
    }

    /// Routes one fetched batch.
    ///
    /// Tokens below the reserved base are internal signals. Everything
    /// else addresses a table slot, gated on the armed state and the
    /// generation so completions from a disarmed or reused registration
    /// are discarded. Callbacks stay in place: readiness is multishot.
    fn dispatch_completions(&self, completions: &[Completion]) {
        for completion in completions {
            let (token, mask, error) = match completion {
                #[cfg(any(target_os = "freebsd", target_os = "macos"))]
                Completion::Timer { id } => {
                    let item = self.periodic.borrow().get(id).cloned();
                    if let Some(item) = item {
                        self.periodic_cb(&item);
                    }
                    continue;
                }
                Completion::Io { token, mask, error } => (*token, *mask, *error),
            };

            let low = token & 0xffff_ffff;
            if low < RESERVED_BASE {
                if low != IGNORE_TOKEN {
                    log::error!("unrecognized completion token {token}");
                }
                continue;
            }

            let slot = (low - RESERVED_BASE) as usize;
            let generation = (token >> 32) as u32;

            // Cloned out of the table so the callback can arm or disarm
            // freely while it runs.
            let cb = self.centries.borrow().armed(slot, generation);
            if let Some(cb) = cb {
                cb(mask, error, self);
            }
        }
    }

    fn run_l2_tasks(&self) {
        loop {
            let task = self.l2_queue.borrow_mut().pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    /// Runs the registered idle callbacks. Returns whether any reported
    /// progress.
    fn run_on_idle_tasks(&self) -> bool {
        let mut tasks = self.idle_tasks.take();
        if tasks.is_empty() {
            return false;
        }

        let mut any = false;
        for task in &mut tasks {
            any |= task();
        }

        // Keep callbacks registered while running, behind the existing set.
        let mut current = self.idle_tasks.borrow_mut();
        tasks.append(&mut current);
        *current = tasks;
        any
    }
}

impl Drop for Proactor {
    fn drop(&mut self) {
        assert!(
            self.shared.stopped.load(Ordering::Relaxed),
            "proactor dropped while running"
        );
    }
}

#[cfg(target_os = "linux")]
fn timespec_of(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

/// Adaptive relax between fully-idle iterations: short exponential
/// spin-wait first, yielding to the OS once the allowance grows.
fn pause(spin_count: u32) {
    if spin_count < 4 {
        for _ in 0..(1u32 << spin_count) * 64 {
            std::hint::spin_loop();
        }
    } else {
        thread::yield_now();
    }
}

/// Millisecond wait bound for the nearest fiber deadline.
///
/// The backend has millisecond precision; rounding down would return
/// early and spin against sub-millisecond deadlines, so the division
/// rounds up.
fn wait_timeout_ms(deadline: Instant, now: Instant) -> i32 {
    if deadline <= now {
        return 0;
    }

    let ns = (deadline - now).as_nanos();
    ((ns + 999_999) / 1_000_000).min(i32::MAX as u128) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proactor::poller::common::EV_IN;

    #[test]
    fn test_wait_timeout_rounds_up() {
        let now = Instant::now();

        assert_eq!(wait_timeout_ms(now + Duration::from_micros(300), now), 1);
        assert_eq!(wait_timeout_ms(now + Duration::from_millis(1), now), 1);
        assert_eq!(
            wait_timeout_ms(now + Duration::from_millis(1) + Duration::from_nanos(1), now),
            2
        );
        assert_eq!(wait_timeout_ms(now + Duration::from_micros(4500), now), 5);
    }

    #[test]
    fn test_wait_timeout_past_deadline() {
        let now = Instant::now();

        assert_eq!(wait_timeout_ms(now, now), 0);
        assert_eq!(wait_timeout_ms(now - Duration::from_millis(3), now), 0);
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_dispatch_discards_stale_generation() {
        let proactor = Proactor::new(0);
        let (read_fd, write_fd) = pipe();

        let hits = Rc::new(Cell::new(0u32));
        let cb_hits = hits.clone();
        let slot = proactor.arm(read_fd, move |_, _, _: &Proactor| cb_hits.set(cb_hits.get() + 1), EV_IN);
        let generation = proactor.centries.borrow().generation(slot);

        let live = [Completion::Io {
            token: pack_token(slot, generation),
            mask: EV_IN,
            error: 0,
        }];
        proactor.dispatch_completions(&live);
        assert_eq!(hits.get(), 1);

        // Multishot: the callback stays armed and fires again.
        proactor.dispatch_completions(&live);
        assert_eq!(hits.get(), 2);

        proactor.disarm(read_fd, slot);
        proactor.dispatch_completions(&live);
        assert_eq!(hits.get(), 2, "disarmed slot must not fire");

        // Reusing the slot must not route old-generation completions to
        // the new callback.
        let second_hits = Rc::new(Cell::new(0u32));
        let cb_hits = second_hits.clone();
        let reused = proactor.arm(read_fd, move |_, _, _: &Proactor| cb_hits.set(cb_hits.get() + 1), EV_IN);
        assert_eq!(reused, slot);

        proactor.dispatch_completions(&live);
        assert_eq!(second_hits.get(), 0, "stale token reached the new callback");

        let fresh = proactor.centries.borrow().generation(slot);
        proactor.dispatch_completions(&[Completion::Io {
            token: pack_token(slot, fresh),
            mask: EV_IN,
            error: 0,
        }]);
        assert_eq!(second_hits.get(), 1);

        proactor.disarm(read_fd, reused);
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn test_dispatch_skips_reserved_tokens() {
        let proactor = Proactor::new(0);

        // The ignore token and a garbage low token are both swallowed
        // without touching the table.
        proactor.dispatch_completions(&[
            Completion::Io {
                token: IGNORE_TOKEN,
                mask: EV_IN,
                error: 0,
            },
            Completion::Io {
                token: 17,
                mask: EV_IN,
                error: 0,
            },
        ]);
    }

    #[test]
    fn test_l2_tasks_run_in_order() {
        let proactor = Proactor::new(0);
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            proactor.dispatch_l2(move |_| order.borrow_mut().push(i));
        }
        proactor.run_l2_tasks();

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_idle_tasks_report_progress() {
        let proactor = Proactor::new(0);
        assert!(!proactor.run_on_idle_tasks(), "no registered tasks");

        proactor.on_idle(|| false);
        assert!(!proactor.run_on_idle_tasks());

        let remaining = Rc::new(Cell::new(2u32));
        let task_remaining = remaining.clone();
        proactor.on_idle(move || {
            if task_remaining.get() == 0 {
                return false;
            }
            task_remaining.set(task_remaining.get() - 1);
            true
        });

        assert!(proactor.run_on_idle_tasks());
        assert!(proactor.run_on_idle_tasks());
        assert!(!proactor.run_on_idle_tasks());
        assert_eq!(remaining.get(), 0);
    }
}
