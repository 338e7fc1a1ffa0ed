//! Cross-thread task inbox and the sleep/wake handshake.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use super::core::Proactor;
use crate::utils::notify::Notifier;

/// Work item executed on the proactor thread.
pub(crate) type Tasklet = Box<dyn FnOnce(&Proactor) + Send + 'static>;

/// Submission capacity before producers park on the availability notifier.
pub(crate) const TASK_QUEUE_LEN: usize = 1024;

/// `seq` value advertising that the loop has committed to blocking.
/// Producers bump by 2, so accumulation alone never reaches the bit.
pub(crate) const WAIT_SECTION_STATE: u32 = 1 << 31;

/// Multi-producer inbox feeding the proactor loop.
///
/// `seq` is the sleep/wake handshake word:
/// - `0` — the loop is running and will drain the queue soon;
/// - any other even value — producers bumped it since the loop last read
///   it, which fails the loop's sleep CAS and forces another spin;
/// - [`WAIT_SECTION_STATE`] — the loop committed to blocking; the producer
///   whose bump observes this value must fire the wake fd.
pub(crate) struct Inbox {
    pub(crate) queue: ArrayQueue<Tasklet>,
    pub(crate) seq: AtomicU32,

    /// Producers park here when the queue is full; the loop pulses it
    /// while unloading.
    pub(crate) avail: Notifier,

    /// Cross-thread wake-fd fire count.
    pub(crate) wakeups: AtomicU64,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self {
            queue: ArrayQueue::new(TASK_QUEUE_LEN),
            seq: AtomicU32::new(0),
            avail: Notifier::new(),
            wakeups: AtomicU64::new(0),
        }
    }

    /// Enqueues `task`, parking until a slot frees up. Returns whether the
    /// caller must fire the wake fd because the loop committed to sleep.
    pub(crate) fn push(&self, task: Tasklet) -> bool {
        if let Err(task) = self.queue.push(task) {
            let mut task = Some(task);
            self.avail.wait_until(|| match self.queue.push(task.take().unwrap()) {
                Ok(()) => true,
                Err(rejected) => {
                    task = Some(rejected);
                    false
                }
            });
        }

        // The bump publishes the enqueue to the loop's sleep CAS; only the
        // producer that observes the wait state wakes, so wakes coalesce.
        self.seq.fetch_add(2, Ordering::AcqRel) == WAIT_SECTION_STATE
    }

    /// Whether the loop has advertised the wait section.
    pub(crate) fn is_parked(&self) -> bool {
        self.seq.load(Ordering::Acquire) & WAIT_SECTION_STATE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Tasklet {
        Box::new(|_| {})
    }

    #[test]
    fn test_push_while_running_needs_no_wake() {
        let inbox = Inbox::new();

        assert!(!inbox.push(noop()));
        assert_eq!(inbox.seq.load(Ordering::Relaxed), 2);
        assert!(!inbox.is_parked());
    }

    #[test]
    fn test_push_into_wait_section_wakes_once() {
        let inbox = Inbox::new();
        inbox.seq.store(WAIT_SECTION_STATE, Ordering::Relaxed);
        assert!(inbox.is_parked());

        // First producer observes the wait state and must wake; followers
        // coalesce behind it.
        assert!(inbox.push(noop()));
        assert!(!inbox.push(noop()));
        assert!(inbox.is_parked());

        // The loop clears the word once the wait returns.
        inbox.seq.store(0, Ordering::Release);
        assert!(!inbox.is_parked());
    }

    #[test]
    fn test_queue_delivers_in_order() {
        let inbox = Inbox::new();
        inbox.push(noop());
        inbox.push(noop());

        assert!(inbox.queue.pop().is_some());
        assert!(inbox.queue.pop().is_some());
        assert!(inbox.queue.pop().is_none());
    }
}
