//! Cross-thread handle to a proactor.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::core::{Proactor, Shared};
use super::inbox::Tasklet;

/// Cloneable, `Send` handle other threads use to inject work into a
/// proactor and to wake or stop it.
///
/// Submitted tasklets always execute on the proactor's own thread, which
/// makes the handle the funnel for every operation that must run there
/// (periodic cancellation, stop requests, arming descriptors owned by the
/// loop).
pub struct ProactorHandle {
    pub(crate) shared: Arc<Shared>,
}

impl Clone for ProactorHandle {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl ProactorHandle {
    /// Enqueues `task` for execution on the proactor thread, waking the
    /// loop if it committed to sleep. Blocks while the inbox is full.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce(&Proactor) + Send + 'static,
    {
        let must_wake = self.shared.inbox.push(Box::new(task) as Tasklet);
        if must_wake {
            self.wake();
        }
    }

    /// Fires the wake fd, breaking a blocking backend wait.
    pub fn wake(&self) {
        log::trace!("waking proactor {}", self.shared.pool_index);

        self.shared.inbox.wakeups.fetch_add(1, Ordering::Relaxed);
        self.shared.wake.fire();
    }

    /// Requests a cooperative stop.
    ///
    /// The request is funnelled through the inbox so the flag flips on the
    /// proactor thread; the loop exits at its sleep gate once all pending
    /// work has drained.
    pub fn stop(&self) {
        self.dispatch(|proactor| proactor.request_stop());
    }

    /// Whether the loop has advertised its wait section (it is blocked, or
    /// about to block, on the readiness backend).
    pub fn is_parked(&self) -> bool {
        self.shared.inbox.is_parked()
    }

    /// Index of the proactor among its siblings.
    pub fn pool_index(&self) -> u32 {
        self.shared.pool_index
    }
}
