//! Platform abstraction for background work.
//!
//! The engine never spawns threads on its own. Asynchronous computations are
//! handed to a [`TaskScheduler`] supplied by the host so they can run on a
//! worker pool, an executor, or inline in tests.

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs on behalf of the engine. Must be usable from any thread.
pub trait TaskScheduler: Send + Sync {
    /// Runs `job` at some later point, possibly on another thread.
    fn spawn(&self, job: Job);
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn spawn(&self, job: Job) {
        job();
    }
}
