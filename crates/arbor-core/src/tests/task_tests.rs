use super::*;
use std::sync::mpsc;
use std::thread::{self, ThreadId};
use std::time::Duration;

struct Steps {
    name: &'static str,
    total: usize,
    delay: Duration,
    interrupt_at: Option<usize>,
    fail: bool,
    started: Mutex<Option<mpsc::Sender<()>>>,
}

impl Steps {
    fn new(total: usize) -> Self {
        Self {
            name: "steps",
            total,
            delay: Duration::ZERO,
            interrupt_at: None,
            fail: false,
            started: Mutex::new(None),
        }
    }

    fn run_from(
        &self,
        ctx: &TaskContext,
        mut done: Vec<ThreadId>,
    ) -> Result<StageOutcome<Vec<ThreadId>, Vec<ThreadId>>> {
        while done.len() < self.total {
            match ctx.checkpoint() {
                Checkpoint::Continue => {}
                Checkpoint::Interrupt => return Ok(StageOutcome::Partial(done)),
                Checkpoint::Abort => return Ok(StageOutcome::Aborted),
            }
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            done.push(thread::current().id());
            if done.len() == 1 {
                if let Some(sender) = self.started.lock().unwrap().take() {
                    let _ = sender.send(());
                }
            }
            if Some(done.len()) == self.interrupt_at {
                ctx.request_interrupt();
            }
        }
        if self.fail {
            return Err(EngineError::component("steps", "boom"));
        }
        Ok(StageOutcome::Complete(done))
    }
}

impl Calculation for Steps {
    type Output = Vec<ThreadId>;
    type Resume = Vec<ThreadId>;

    fn description(&self) -> &str {
        self.name
    }

    fn is_equivalent_to(&self, other: &Self) -> bool {
        self.total == other.total
    }

    fn calculate(&self, ctx: &TaskContext) -> Result<StageOutcome<Self::Output, Self::Resume>> {
        self.run_from(ctx, Vec::new())
    }

    fn resume(
        &self,
        ctx: &TaskContext,
        partial: Self::Resume,
    ) -> Result<StageOutcome<Self::Output, Self::Resume>> {
        self.run_from(ctx, partial)
    }
}

#[test]
fn completed_result_is_shared_by_later_callers() {
    let task = VersionedTask::new(1, Steps::new(3));

    let first = task.start(true).unwrap().into_complete().unwrap();
    let second = task.start(false).unwrap().into_complete().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.len(), 3);
    assert_eq!(task.calculate_count(), 1);
}

#[test]
fn interrupted_run_resumes_to_the_same_result() {
    let mut steps = Steps::new(6);
    steps.interrupt_at = Some(2);
    let task = VersionedTask::new(1, steps);

    assert!(matches!(task.start(false).unwrap(), TaskOutcome::Interrupted));
    assert!(task.has_partial_result());

    let resumed = task.resume().unwrap().into_complete().unwrap();
    let uninterrupted = VersionedTask::new(2, Steps::new(6))
        .start(true)
        .unwrap()
        .into_complete()
        .unwrap();

    assert_eq!(resumed.len(), uninterrupted.len());
    assert_eq!(task.calculate_count(), 1);
}

#[test]
fn synchronous_start_resumes_an_interrupted_task() {
    let mut steps = Steps::new(4);
    steps.interrupt_at = Some(1);
    let task = VersionedTask::new(1, steps);

    assert!(matches!(task.start(false).unwrap(), TaskOutcome::Interrupted));
    let result = task.start(true).unwrap().into_complete().unwrap();

    assert_eq!(result.len(), 4);
    assert_eq!(task.calculate_count(), 1);
}

#[test]
fn resume_without_partial_result_is_rejected() {
    let task = VersionedTask::new(1, Steps::new(2));

    let err = task.resume().unwrap_err();
    assert!(matches!(
        err,
        EngineError::IllegalResume {
            reason: ResumeRejection::NotPartial,
            ..
        }
    ));

    task.start(true).unwrap();
    assert!(matches!(
        task.resume().unwrap_err(),
        EngineError::IllegalResume {
            reason: ResumeRejection::NotPartial,
            ..
        }
    ));
}

#[test]
fn resume_after_release_is_rejected() {
    let mut steps = Steps::new(4);
    steps.interrupt_at = Some(1);
    let task = VersionedTask::new(1, steps);
    task.start(false).unwrap();

    task.release();
    task.release();

    assert!(!task.has_partial_result());
    let err = task.resume().unwrap_err();
    assert!(matches!(
        err,
        EngineError::IllegalResume {
            reason: ResumeRejection::Released,
            ..
        }
    ));
    assert!(err.to_string().ends_with(": task was released"), "{err}");
    let reason: &dyn std::error::Error = &ResumeRejection::AlreadyRunning;
    assert_eq!(reason.to_string(), "task is already running");
    assert!(matches!(task.start(true).unwrap(), TaskOutcome::Released));
}

#[test]
fn failure_is_reported_to_every_caller() {
    let mut steps = Steps::new(2);
    steps.fail = true;
    let task = VersionedTask::new(1, steps);

    assert!(task.start(true).is_err());
    let err = task.start(false).unwrap_err();
    assert_eq!(err, EngineError::component("steps", "boom"));
    assert_eq!(task.calculate_count(), 1);
}

#[test]
fn concurrent_callers_share_one_calculation() {
    let mut steps = Steps::new(20);
    steps.delay = Duration::from_millis(2);
    let task = Arc::new(VersionedTask::new(1, steps));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let task = Arc::clone(&task);
            thread::spawn(move || task.start(false).unwrap().into_complete().unwrap())
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(task.calculate_count(), 1);
    for result in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], result));
    }
    assert_eq!(task.waiter_count(), 0);
}

#[test]
fn synchronous_caller_preempts_background_run() {
    let (sender, started) = mpsc::channel();
    let mut steps = Steps::new(200);
    steps.delay = Duration::from_millis(2);
    steps.started = Mutex::new(Some(sender));
    let task = Arc::new(VersionedTask::new(1, steps));

    let background = {
        let task = Arc::clone(&task);
        thread::spawn(move || task.start(false).unwrap().into_complete())
    };
    started.recv().unwrap();

    let result = task.start(true).unwrap().into_complete().unwrap();
    let main = thread::current().id();

    assert_eq!(result.len(), 200);
    assert_eq!(*result.last().unwrap(), main);
    assert_ne!(result[0], main);
    assert_eq!(task.calculate_count(), 1);

    let background_result = background.join().unwrap().unwrap();
    assert!(Arc::ptr_eq(&result, &background_result));
}

#[test]
fn checkpoint_prefers_abort_over_interrupt() {
    let ctx = TaskContext::new(7);
    assert_eq!(ctx.checkpoint(), Checkpoint::Continue);

    ctx.request_interrupt();
    assert_eq!(ctx.checkpoint(), Checkpoint::Interrupt);

    assert!(ctx.mark_released());
    assert!(!ctx.mark_released());
    assert_eq!(ctx.checkpoint(), Checkpoint::Abort);
    assert_eq!(ctx.checkpoints_passed(), 3);
}
