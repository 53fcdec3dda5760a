//! Versioned, interruptible units of work.
//!
//! A [`VersionedTask`] wraps a [`Calculation`] and owns its result slot. Callers
//! run it through [`VersionedTask::start`]; concurrent callers of the same task
//! never run the calculation twice. A synchronous caller that finds the task
//! running in the background requests an interrupt, waits for the partial
//! result and resumes it on its own thread, so useful work is never thrown away.
//!
//! Interruption is cooperative: the calculation polls [`TaskContext::checkpoint`]
//! between units of work and returns [`StageOutcome::Partial`] with whatever it
//! needs to continue.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, trace, warn};

use crate::error::{EngineError, Result, ResumeRejection};

/// What a single calculate/resume step produced.
pub enum StageOutcome<T, R> {
    Complete(T),
    /// Interrupted at a checkpoint; carries the context needed to continue.
    Partial(R),
    /// The task was released while running; nothing usable was produced.
    Aborted,
}

impl<T, R> fmt::Debug for StageOutcome<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Complete(_) => f.write_str("Complete"),
            StageOutcome::Partial(_) => f.write_str("Partial"),
            StageOutcome::Aborted => f.write_str("Aborted"),
        }
    }
}

/// What a caller of [`VersionedTask::start`] gets back.
pub enum TaskOutcome<T> {
    Complete(Arc<T>),
    /// The run stopped at a checkpoint and nobody resumed it.
    Interrupted,
    /// The task was released before it produced a result.
    Released,
}

impl<T> TaskOutcome<T> {
    pub fn into_complete(self) -> Option<Arc<T>> {
        match self {
            TaskOutcome::Complete(value) => Some(value),
            TaskOutcome::Interrupted | TaskOutcome::Released => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TaskOutcome::Complete(_))
    }
}

impl<T> fmt::Debug for TaskOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Complete(_) => f.write_str("Complete"),
            TaskOutcome::Interrupted => f.write_str("Interrupted"),
            TaskOutcome::Released => f.write_str("Released"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Interrupt,
    Abort,
}

#[derive(Default)]
struct TaskFlags {
    interrupt: AtomicBool,
    released: AtomicBool,
    checkpoints: AtomicUsize,
}

/// Flags shared between a task and the calculation it runs.
///
/// Cloning is cheap and every clone observes the same flags, which lets tests
/// and components request an interrupt from inside a running calculation.
#[derive(Clone)]
pub struct TaskContext {
    flags: Arc<TaskFlags>,
    version: u64,
}

impl TaskContext {
    pub fn new(version: u64) -> Self {
        Self {
            flags: Arc::new(TaskFlags::default()),
            version,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Polled between units of work. Release wins over interruption.
    pub fn checkpoint(&self) -> Checkpoint {
        self.flags.checkpoints.fetch_add(1, Ordering::Relaxed);
        if self.flags.released.load(Ordering::Acquire) {
            trace!("checkpoint v{}: abort", self.version);
            Checkpoint::Abort
        } else if self.flags.interrupt.load(Ordering::Acquire) {
            trace!("checkpoint v{}: interrupt", self.version);
            Checkpoint::Interrupt
        } else {
            Checkpoint::Continue
        }
    }

    pub fn request_interrupt(&self) {
        self.flags.interrupt.store(true, Ordering::Release);
    }

    pub fn is_interrupt_requested(&self) -> bool {
        self.flags.interrupt.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.flags.released.load(Ordering::Acquire)
    }

    pub fn checkpoints_passed(&self) -> usize {
        self.flags.checkpoints.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_interrupt(&self) {
        self.flags.interrupt.store(false, Ordering::Release);
    }

    /// Returns `true` the first time only.
    pub(crate) fn mark_released(&self) -> bool {
        let first = !self.flags.released.swap(true, Ordering::AcqRel);
        if first {
            self.flags.interrupt.store(true, Ordering::Release);
        }
        first
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("version", &self.version)
            .field("interrupt", &self.is_interrupt_requested())
            .field("released", &self.is_released())
            .finish()
    }
}

/// The work a [`VersionedTask`] performs.
pub trait Calculation: Send + Sync + 'static {
    type Output: Send + Sync + 'static;
    type Resume: Send + 'static;

    fn description(&self) -> &str;

    /// Deduplication key. Must be symmetric and stable while both tasks live.
    fn is_equivalent_to(&self, other: &Self) -> bool;

    fn calculate(&self, ctx: &TaskContext) -> Result<StageOutcome<Self::Output, Self::Resume>>;

    fn resume(
        &self,
        ctx: &TaskContext,
        partial: Self::Resume,
    ) -> Result<StageOutcome<Self::Output, Self::Resume>>;
}

enum ResultSlot<C: Calculation> {
    Empty,
    Partial(C::Resume),
    Complete(Arc<C::Output>),
    Failed(EngineError),
    Aborted,
}

struct TaskSlot<C: Calculation> {
    result: ResultSlot<C>,
    /// `Some(on_calling_thread)` while a caller runs the calculation.
    running: Option<bool>,
    preempting: usize,
    waiters: usize,
}

enum Next<C: Calculation> {
    Return(Result<TaskOutcome<C::Output>>),
    Run(Option<C::Resume>),
}

pub struct VersionedTask<C: Calculation> {
    calculation: C,
    context: TaskContext,
    slot: Mutex<TaskSlot<C>>,
    changed: Condvar,
    refs: AtomicUsize,
    runs: AtomicUsize,
}

impl<C: Calculation> VersionedTask<C> {
    pub fn new(version: u64, calculation: C) -> Self {
        Self {
            calculation,
            context: TaskContext::new(version),
            slot: Mutex::new(TaskSlot {
                result: ResultSlot::Empty,
                running: None,
                preempting: 0,
                waiters: 0,
            }),
            changed: Condvar::new(),
            refs: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.context.version()
    }

    pub fn description(&self) -> &str {
        self.calculation.description()
    }

    pub fn calculation(&self) -> &C {
        &self.calculation
    }

    pub fn context(&self) -> &TaskContext {
        &self.context
    }

    pub fn is_released(&self) -> bool {
        self.context.is_released()
    }

    pub fn is_interrupt_requested(&self) -> bool {
        self.context.is_interrupt_requested()
    }

    pub fn is_equivalent_to(&self, other: &Self) -> bool {
        self.calculation.is_equivalent_to(&other.calculation)
    }

    /// Number of callers currently blocked on this task.
    pub fn waiter_count(&self) -> usize {
        self.lock_slot().waiters
    }

    /// Number of times `calculate` (not `resume`) has been invoked.
    pub fn calculate_count(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    pub fn has_partial_result(&self) -> bool {
        matches!(self.lock_slot().result, ResultSlot::Partial(_))
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Runs the task or attaches to the run already in progress.
    ///
    /// With `run_on_calling_thread` set, a background run is preempted: the
    /// caller requests an interrupt, takes over the partial result and resumes
    /// it here. Without it, the caller waits for whoever is running.
    pub fn start(&self, run_on_calling_thread: bool) -> Result<TaskOutcome<C::Output>> {
        let mut slot = self.lock_slot();
        let mut preempting = false;
        let mut waiting = false;
        let next: Next<C> = loop {
            if self.is_released() {
                break Next::Return(Ok(TaskOutcome::Released));
            }
            match &slot.result {
                ResultSlot::Complete(value) => {
                    break Next::Return(Ok(TaskOutcome::Complete(Arc::clone(value))))
                }
                ResultSlot::Failed(error) => break Next::Return(Err(error.clone())),
                ResultSlot::Aborted => break Next::Return(Ok(TaskOutcome::Released)),
                ResultSlot::Empty | ResultSlot::Partial(_) => {}
            }
            if slot.running.is_none() {
                if matches!(slot.result, ResultSlot::Empty) {
                    slot.running = Some(run_on_calling_thread);
                    break Next::Run(None);
                }
                if run_on_calling_thread {
                    if let ResultSlot::Partial(partial) =
                        std::mem::replace(&mut slot.result, ResultSlot::Empty)
                    {
                        slot.running = Some(true);
                        break Next::Run(Some(partial));
                    }
                } else if slot.preempting == 0 {
                    break Next::Return(Ok(TaskOutcome::Interrupted));
                }
            } else if run_on_calling_thread && slot.running == Some(false) && !preempting {
                preempting = true;
                slot.preempting += 1;
                debug!(
                    "preempting background run of `{}` (v{})",
                    self.description(),
                    self.version()
                );
                self.context.request_interrupt();
            }
            if !waiting {
                waiting = true;
                slot.waiters += 1;
            }
            slot = self
                .changed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        };
        if preempting {
            slot.preempting -= 1;
        }
        if waiting {
            slot.waiters -= 1;
        }
        match next {
            Next::Return(outcome) => outcome,
            Next::Run(partial) => {
                self.context.clear_interrupt();
                drop(slot);
                self.run(partial)
            }
        }
    }

    /// Continues an interrupted run on the calling thread.
    pub fn resume(&self) -> Result<TaskOutcome<C::Output>> {
        let mut slot = self.lock_slot();
        let rejection = if self.is_released() {
            Some(ResumeRejection::Released)
        } else if slot.running.is_some() {
            Some(ResumeRejection::AlreadyRunning)
        } else if !matches!(slot.result, ResultSlot::Partial(_)) {
            Some(ResumeRejection::NotPartial)
        } else {
            None
        };
        if let Some(reason) = rejection {
            return Err(EngineError::IllegalResume {
                description: self.description().to_string(),
                reason,
            });
        }
        match std::mem::replace(&mut slot.result, ResultSlot::Empty) {
            ResultSlot::Partial(partial) => {
                slot.running = Some(true);
                self.context.clear_interrupt();
                drop(slot);
                self.run(Some(partial))
            }
            other => {
                slot.result = other;
                Err(EngineError::IllegalResume {
                    description: self.description().to_string(),
                    reason: ResumeRejection::NotPartial,
                })
            }
        }
    }

    /// Cooperative; observed at the next checkpoint of the running calculation.
    pub fn request_interrupt(&self) {
        debug!(
            "interrupt requested for `{}` (v{})",
            self.description(),
            self.version()
        );
        self.context.request_interrupt();
    }

    /// Invalidates the task. Idempotent. Results already handed out stay valid.
    pub fn release(&self) {
        if !self.context.mark_released() {
            return;
        }
        debug!("released `{}` (v{})", self.description(), self.version());
        let mut slot = self.lock_slot();
        if matches!(slot.result, ResultSlot::Partial(_)) {
            slot.result = ResultSlot::Aborted;
        }
        drop(slot);
        self.changed.notify_all();
    }

    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns `true` when the last reference went away.
    pub(crate) fn release_ref(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn run(&self, partial: Option<C::Resume>) -> Result<TaskOutcome<C::Output>> {
        let outcome = match partial {
            None => {
                self.runs.fetch_add(1, Ordering::AcqRel);
                debug!("calculating `{}` (v{})", self.description(), self.version());
                self.calculation.calculate(&self.context)
            }
            Some(partial) => {
                debug!("resuming `{}` (v{})", self.description(), self.version());
                self.calculation.resume(&self.context, partial)
            }
        };

        let mut slot = self.lock_slot();
        slot.running = None;
        let result = match outcome {
            Ok(StageOutcome::Complete(value)) => {
                let value = Arc::new(value);
                slot.result = ResultSlot::Complete(Arc::clone(&value));
                Ok(TaskOutcome::Complete(value))
            }
            Ok(StageOutcome::Partial(partial)) if !self.is_released() => {
                debug!(
                    "`{}` (v{}) stopped at a checkpoint",
                    self.description(),
                    self.version()
                );
                slot.result = ResultSlot::Partial(partial);
                if slot.preempting > 0 {
                    // A synchronous caller takes over; wait for its result.
                    drop(slot);
                    self.changed.notify_all();
                    return self.start(false);
                }
                Ok(TaskOutcome::Interrupted)
            }
            Ok(StageOutcome::Partial(_)) | Ok(StageOutcome::Aborted) => {
                warn!(
                    "`{}` (v{}) abandoned after release",
                    self.description(),
                    self.version()
                );
                slot.result = ResultSlot::Aborted;
                Ok(TaskOutcome::Released)
            }
            Err(error) => {
                debug!(
                    "`{}` (v{}) failed: {error}",
                    self.description(),
                    self.version()
                );
                slot.result = ResultSlot::Failed(error.clone());
                Err(error)
            }
        };
        drop(slot);
        self.changed.notify_all();
        result
    }

    fn lock_slot(&self) -> MutexGuard<'_, TaskSlot<C>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Calculation> fmt::Debug for VersionedTask<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedTask")
            .field("description", &self.description())
            .field("version", &self.version())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/task_tests.rs"]
mod tests;
