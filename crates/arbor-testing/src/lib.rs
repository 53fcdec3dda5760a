//! Fixtures shared by engine tests and benchmarks: small components that
//! count how often they render and measure, and a scheduler that queues
//! jobs until the test drains it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arbor_core::{EngineError, Job, Result, StateUpdate, TaskScheduler, UpdateMode};
use arbor_engine::{Component, Element, MeasureScope, Render, RenderScope};
use arbor_layout::{LinearPolicy, Size, SizeSpecs};

/// Shared call counter.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

impl fmt::Debug for CallCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallCounter({})", self.get())
    }
}

/// Leaf with a fixed desired size.
#[derive(Clone, Debug)]
pub struct Text {
    pub label: String,
    pub size: Size,
    pub renders: CallCounter,
    pub measures: CallCounter,
}

impl Text {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            size: Size::new(40.0, 10.0),
            renders: CallCounter::new(),
            measures: CallCounter::new(),
        }
    }

    pub fn sized(mut self, width: f32, height: f32) -> Self {
        self.size = Size::new(width, height);
        self
    }

    pub fn counting(mut self, renders: &CallCounter, measures: &CallCounter) -> Self {
        self.renders = renders.clone();
        self.measures = measures.clone();
        self
    }
}

impl Component for Text {
    fn render(&self, _scope: &mut RenderScope<'_>) -> Result<Render> {
        self.renders.hit();
        let size = self.size;
        let measures = self.measures.clone();
        Ok(Render::leaf(
            move |_: &mut MeasureScope<'_>, specs: SizeSpecs| -> Result<Size> {
                measures.hit();
                Ok(specs.resolve(size))
            },
        ))
    }
}

/// Vertical stack of its children.
#[derive(Clone, Debug, Default)]
pub struct Column {
    pub children: Vec<Element>,
    pub spacing: f32,
}

impl Column {
    pub fn new(children: Vec<Element>) -> Self {
        Self {
            children,
            spacing: 0.0,
        }
    }

    pub fn spaced_by(mut self, spacing: f32) -> Self {
        self.spacing = spacing;
        self
    }
}

impl Component for Column {
    fn render(&self, _scope: &mut RenderScope<'_>) -> Result<Render> {
        Ok(Render::children(
            LinearPolicy::column().spaced_by(self.spacing),
            self.children.clone(),
        ))
    }
}

/// Horizontal stack of its children.
#[derive(Clone, Debug, Default)]
pub struct Row {
    pub children: Vec<Element>,
}

impl Row {
    pub fn new(children: Vec<Element>) -> Self {
        Self { children }
    }
}

impl Component for Row {
    fn render(&self, _scope: &mut RenderScope<'_>) -> Result<Render> {
        Ok(Render::children(LinearPolicy::row(), self.children.clone()))
    }
}

/// Stateful leaf: an `i32` count in slot 0, ten pixels wide per unit.
/// Handles `"increment"` with a synchronous update.
#[derive(Clone, Debug)]
pub struct Counter {
    pub initial: i32,
    pub seen: Arc<Mutex<Vec<i32>>>,
    pub inits: CallCounter,
}

impl Counter {
    pub fn new(initial: i32) -> Self {
        Self {
            initial,
            seen: Arc::new(Mutex::new(Vec::new())),
            inits: CallCounter::new(),
        }
    }

    /// Values observed by every render so far.
    pub fn seen(&self) -> Vec<i32> {
        self.seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    pub fn last_seen(&self) -> Option<i32> {
        self.seen().last().copied()
    }
}

impl Component for Counter {
    fn render(&self, scope: &mut RenderScope<'_>) -> Result<Render> {
        let inits = self.inits.clone();
        let initial = self.initial;
        let count = *scope.use_state(move || {
            inits.hit();
            initial
        })?;
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(count);
        }
        scope.on_event("increment", |ctx| {
            ctx.update(0, StateUpdate::apply(|count: &i32| count + 1), UpdateMode::Sync)
        });
        Ok(Render::fixed(Size::new(10.0 * count as f32, 10.0)))
    }
}

/// Renders nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct Empty;

impl Component for Empty {
    fn render(&self, _scope: &mut RenderScope<'_>) -> Result<Render> {
        Ok(Render::Nothing)
    }
}

/// Fails every render.
#[derive(Clone, Debug)]
pub struct Failing {
    pub message: String,
}

impl Failing {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Component for Failing {
    fn render(&self, scope: &mut RenderScope<'_>) -> Result<Render> {
        Err(EngineError::component(scope.key(), &self.message))
    }
}

type Hook = Arc<dyn Fn() + Send + Sync>;

/// Runs a hook on every render, then renders its child (or a fixed leaf).
#[derive(Clone)]
pub struct RenderHook {
    hook: Hook,
    child: Option<Element>,
    pub renders: CallCounter,
}

impl RenderHook {
    pub fn new(hook: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            hook: Arc::new(hook),
            child: None,
            renders: CallCounter::new(),
        }
    }

    pub fn wrapping(mut self, child: impl Into<Element>) -> Self {
        self.child = Some(child.into());
        self
    }
}

impl Component for RenderHook {
    fn render(&self, _scope: &mut RenderScope<'_>) -> Result<Render> {
        self.renders.hit();
        (self.hook)();
        Ok(match &self.child {
            Some(child) => Render::children(LinearPolicy::column(), vec![child.clone()]),
            None => Render::fixed(Size::new(1.0, 1.0)),
        })
    }
}

impl fmt::Debug for RenderHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderHook")
            .field("child", &self.child)
            .field("renders", &self.renders)
            .finish()
    }
}

/// Queues spawned jobs until [`ManualScheduler::run_pending`] is called.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Runs queued jobs, including ones they queue, until none are left.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = match self.jobs.lock() {
                Ok(mut jobs) => jobs.pop_front(),
                Err(_) => None,
            };
            let Some(job) = job else {
                return ran;
            };
            job();
            ran += 1;
        }
    }

    /// Runs only the oldest queued job.
    pub fn run_one(&self) -> bool {
        let job = match self.jobs.lock() {
            Ok(mut jobs) => jobs.pop_front(),
            Err(_) => None,
        };
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }
}

impl TaskScheduler for ManualScheduler {
    fn spawn(&self, job: Job) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.push_back(job);
        }
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
