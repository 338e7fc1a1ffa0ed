use std::sync::{Condvar, Mutex};

/// Coalescing wake-up channel between the event loop and blocked producers.
///
/// Producers that find the task inbox full park here; the loop pulses the
/// notifier while unloading so producers can refill within the same sweep.
/// Notifications do not accumulate: a pulse wakes whoever is parked and is
/// otherwise lost.
pub(crate) struct Notifier {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Wakes all parked threads.
    ///
    /// The internal lock is taken briefly so a producer cannot slip between
    /// its failed attempt and its wait and miss the pulse.
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock.lock().unwrap();
        self.condvar.notify_all();
    }

    /// Parks the calling thread until `attempt` succeeds.
    ///
    /// The attempt runs under the internal lock, re-tried after every pulse.
    pub(crate) fn wait_until(&self, mut attempt: impl FnMut() -> bool) {
        let mut guard = self.lock.lock().unwrap();
        while !attempt() {
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}
