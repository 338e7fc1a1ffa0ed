//! Interface between the proactor loop and a fiber scheduler.
//!
//! The proactor does not schedule fibers itself. It drives an external
//! scheduler through this trait, interleaving fiber steps with inbox
//! draining and readiness dispatch, and uses the sleeping-fiber deadline
//! to bound how long it may block on the OS.

use std::time::Instant;

pub trait Scheduler {
    /// Moves fibers flagged runnable by other threads into the local ready
    /// queue. Called once per loop iteration, before the ready check.
    fn process_remote_ready(&mut self);

    /// Whether any fiber is ready to run locally.
    fn has_ready(&self) -> bool;

    /// Whether any fiber is suspended waiting on a deadline.
    fn has_sleeping_fibers(&self) -> bool;

    /// Earliest deadline among sleeping fibers, if any.
    fn next_sleep_point(&self) -> Option<Instant>;

    /// Runs one scheduling step. Returns true when the scheduler is
    /// quiescent; false tells the loop to skip its idle phase and come
    /// straight back.
    fn run_worker_fibers_step(&mut self) -> bool;

    /// Reclaims finished fibers. Called only on fully-idle iterations.
    fn destroy_terminated(&mut self);
}

/// A scheduler with no fibers, for running the proactor as a plain event
/// loop driven by the inbox and readiness callbacks alone.
impl Scheduler for () {
    fn process_remote_ready(&mut self) {}

    fn has_ready(&self) -> bool {
        false
    }

    fn has_sleeping_fibers(&self) -> bool {
        false
    }

    fn next_sleep_point(&self) -> Option<Instant> {
        None
    }

    fn run_worker_fibers_step(&mut self) -> bool {
        true
    }

    fn destroy_terminated(&mut self) {}
}
