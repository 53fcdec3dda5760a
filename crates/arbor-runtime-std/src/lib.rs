//! Worker pool for background computations.
//!
//! [`StdScheduler`] implements [`arbor_core::TaskScheduler`] on a dedicated
//! rayon thread pool so an engine can run asynchronous computations on a
//! fixed number of named background threads.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use arbor_core::{Job, TaskScheduler};
use log::{debug, error, warn};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};

#[derive(Default)]
struct Idle {
    in_flight: Mutex<usize>,
    changed: Condvar,
}

impl Idle {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish_one(&self) {
        let mut in_flight = self.lock();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.changed.notify_all();
        }
    }
}

/// Counts a job as finished when dropped, also while unwinding.
struct Finished(Arc<Idle>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.finish_one();
    }
}

/// Runs jobs on a bounded pool of named threads.
pub struct StdScheduler {
    pool: RwLock<Option<ThreadPool>>,
    idle: Arc<Idle>,
    name: String,
}

impl StdScheduler {
    /// Starts `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self, ThreadPoolBuildError> {
        Self::with_name("arbor-worker", workers)
    }

    pub fn with_name(prefix: &str, workers: usize) -> Result<Self, ThreadPoolBuildError> {
        let workers = workers.max(1);
        let thread_prefix = prefix.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |index| format!("{thread_prefix}-{index}"))
            .panic_handler(|_| {
                error!(
                    "job panicked on {}",
                    std::thread::current().name().unwrap_or("worker")
                );
            })
            .build()?;
        debug!("{prefix}: started {workers} worker(s)");

        Ok(Self {
            pool: RwLock::new(Some(pool)),
            idle: Arc::new(Idle::default()),
            name: prefix.to_string(),
        })
    }

    /// Pool size, or zero after shutdown.
    pub fn worker_count(&self) -> usize {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, ThreadPool::current_num_threads)
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        *self.idle.lock()
    }

    /// Blocks until every job spawned so far, and every job those spawned,
    /// has finished.
    pub fn wait_idle(&self) {
        let mut in_flight = self.idle.lock();
        while *in_flight > 0 {
            in_flight = self
                .idle
                .changed
                .wait(in_flight)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stops accepting jobs. Jobs already queued still run; the workers exit
    /// once the queue is empty.
    pub fn shutdown(&self) {
        let pool = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if pool.is_some() {
            debug!("{}: shut down", self.name);
        }
    }
}

impl TaskScheduler for StdScheduler {
    fn spawn(&self, job: Job) {
        let pool = self.pool.read().unwrap_or_else(PoisonError::into_inner);
        let Some(pool) = pool.as_ref() else {
            warn!("{}: job spawned after shutdown; dropped", self.name);
            return;
        };
        *self.idle.lock() += 1;
        let finished = Finished(Arc::clone(&self.idle));
        pool.spawn(move || {
            let _finished = finished;
            job();
        });
    }
}

impl fmt::Debug for StdScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdScheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
