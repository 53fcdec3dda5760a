//! The engine that owns a tree: inputs, committed results, state and the
//! task registries that deduplicate work.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use arbor_core::{
    ComponentKey, EngineError, InlineScheduler, Result, StateKey, StateStore, StateUpdate,
    TaskOutcome, TaskRegistry, TaskScheduler, UpdateMode, VersionCounter,
};
use arbor_layout::Constraints;
use indexmap::IndexMap;
use log::{debug, error, trace, warn};

use crate::component::Element;
use crate::layout::{LayoutCalculation, LayoutState};
use crate::props::TreeProps;
use crate::resolve::{lock_salvage, ResolveCalculation, ResolveResult, Salvage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct EngineConfig {
    /// Where asynchronous computations run.
    pub scheduler: Arc<dyn TaskScheduler>,
    /// Copy unchanged subtrees from the previous resolve instead of rendering them.
    pub reconcile: bool,
    /// Reuse measurements of the previous layout.
    pub reuse_layout_cache: bool,
    /// After an asynchronous computation, compute again if updates are still queued.
    pub follow_up_pending_updates: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler: Arc::new(InlineScheduler),
            reconcile: true,
            reuse_layout_cache: true,
            follow_up_pending_updates: true,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("reconcile", &self.reconcile)
            .field("reuse_layout_cache", &self.reuse_layout_cache)
            .field("follow_up_pending_updates", &self.follow_up_pending_updates)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Compute on the calling thread and return the result.
    Sync,
    /// Hand the computation to the configured scheduler.
    Async,
}

type Listener = Arc<dyn Fn(&Arc<LayoutState>) + Send + Sync>;

struct Inputs {
    root: Option<Element>,
    props: TreeProps,
    constraints: Constraints,
}

#[derive(Default)]
struct Committed {
    resolve: Option<Arc<ResolveResult>>,
    layout: Option<Arc<LayoutState>>,
    /// Applied commits so far. State of both stages is committed under this
    /// sequence so the store orders it the same way as the tree.
    sequence: u64,
}

struct EngineInner {
    config: EngineConfig,
    store: StateStore,
    resolves: TaskRegistry<ResolveCalculation>,
    layouts: TaskRegistry<LayoutCalculation>,
    inputs: Mutex<Inputs>,
    committed: Mutex<Committed>,
    salvage: Salvage,
    listeners: Mutex<IndexMap<u64, Listener>>,
    next_listener: AtomicU64,
    follow_up_scheduled: AtomicBool,
}

/// Computes a component tree into a positioned layout and keeps the latest
/// result. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct TreeEngine {
    inner: Arc<EngineInner>,
}

impl Default for TreeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeEngine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let versions = Arc::new(VersionCounter::new());
        Self {
            inner: Arc::new(EngineInner {
                config,
                store: StateStore::new(),
                resolves: TaskRegistry::new("resolve", Arc::clone(&versions)),
                layouts: TaskRegistry::new("layout", versions),
                inputs: Mutex::new(Inputs {
                    root: None,
                    props: TreeProps::new(),
                    constraints: Constraints::unbounded(),
                }),
                committed: Mutex::new(Committed::default()),
                salvage: Arc::new(Mutex::new(None)),
                listeners: Mutex::new(IndexMap::new()),
                next_listener: AtomicU64::new(1),
                follow_up_scheduled: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    pub fn set_root(&self, root: impl Into<Element>) {
        lock(&self.inner.inputs).root = Some(root.into());
    }

    pub fn set_tree_props(&self, props: TreeProps) {
        lock(&self.inner.inputs).props = props;
    }

    pub fn set_constraints(&self, constraints: Constraints) {
        lock(&self.inner.inputs).constraints = constraints;
    }

    pub fn committed(&self) -> Option<Arc<LayoutState>> {
        lock(&self.inner.committed).layout.clone()
    }

    pub fn committed_resolve(&self) -> Option<Arc<ResolveResult>> {
        lock(&self.inner.committed).resolve.clone()
    }

    /// Resolve and layout tasks currently registered.
    pub fn in_flight(&self) -> usize {
        self.inner.resolves.len() + self.inner.layouts.len()
    }

    /// Computes the current inputs. `Sync` blocks and returns the committed
    /// layout; `Async` schedules the work and returns `None`.
    pub fn compute(&self, mode: RunMode) -> Result<Option<Arc<LayoutState>>> {
        match mode {
            RunMode::Sync => loop {
                if let Some(layout) = self.compute_now(true)? {
                    return Ok(Some(layout));
                }
                // Our task was superseded before finishing; the newer inputs win.
                trace!("synchronous computation released, retrying");
            },
            RunMode::Async => {
                self.spawn_compute();
                Ok(None)
            }
        }
    }

    /// Queues a resolve-stage state update and schedules a computation as
    /// `mode` asks.
    pub fn update_state<T>(&self, key: StateKey, update: StateUpdate<T>, mode: UpdateMode) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner.store.queue_update(key, update, mode);
        match mode {
            UpdateMode::Sync => self.compute(RunMode::Sync).map(drop),
            UpdateMode::Async => {
                self.spawn_compute();
                Ok(())
            }
            UpdateMode::Lazy => Ok(()),
        }
    }

    /// Like [`TreeEngine::update_state`], but does nothing when the value
    /// would not change. Returns whether the update was queued.
    pub fn update_state_if_changed<T>(
        &self,
        key: StateKey,
        update: StateUpdate<T>,
        mode: UpdateMode,
    ) -> Result<bool>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        if self.inner.store.can_skip_update(&key, &update)? {
            trace!("update of {key} leaves the value unchanged; skipped");
            return Ok(false);
        }
        self.update_state(key, update, mode)?;
        Ok(true)
    }

    /// Runs the handler `name` registered by the component at `key` in the
    /// committed tree. Returns `false` when there is none.
    pub fn dispatch_event(&self, key: &ComponentKey, name: &str) -> Result<bool> {
        let handler = lock(&self.inner.committed)
            .resolve
            .as_ref()
            .and_then(|resolve| resolve.handler(key, name));
        let Some(handler) = handler else {
            debug!("no `{name}` handler at {key}");
            return Ok(false);
        };
        let context = EventContext {
            engine: self.clone(),
            key: key.clone(),
        };
        handler(&context)?;
        Ok(true)
    }

    /// Calls `listener` after every applied commit until the registration
    /// is dropped.
    pub fn add_listener(
        &self,
        listener: impl Fn(&Arc<LayoutState>) + Send + Sync + 'static,
    ) -> ListenerRegistration {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).insert(id, Arc::new(listener));
        ListenerRegistration {
            engine: Arc::downgrade(&self.inner),
            id,
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// The committed layout when it was computed from these inputs and no
    /// state update is waiting.
    fn committed_for(
        &self,
        root: &Element,
        props: &TreeProps,
        constraints: Constraints,
    ) -> Option<Arc<LayoutState>> {
        let committed = lock(&self.inner.committed);
        let layout = committed.layout.as_ref()?;
        let resolve = layout.resolve();
        let unchanged = resolve.root().same(root)
            && resolve.props().same(props)
            && layout.constraints() == constraints
            && !self.inner.store.has_pending_updates();
        unchanged.then(|| Arc::clone(layout))
    }

    fn compute_now(&self, run_on_calling_thread: bool) -> Result<Option<Arc<LayoutState>>> {
        let inner = &self.inner;
        let (root, props, constraints) = {
            let inputs = lock(&inner.inputs);
            let root = inputs.root.clone().ok_or(EngineError::NoRoot)?;
            (root, inputs.props.clone(), inputs.constraints)
        };
        if let Some(layout) = self.committed_for(&root, &props, constraints) {
            trace!("inputs unchanged since v{}; reusing it", layout.version());
            return Ok(Some(layout));
        }
        let (previous_resolve, previous_layout) = {
            let committed = lock(&inner.committed);
            (committed.resolve.clone(), committed.layout.clone())
        };

        let resolve_task = inner.resolves.get_or_create(ResolveCalculation::new(
            root.clone(),
            props.clone(),
            inner.store.clone(),
            previous_resolve,
            Arc::clone(&inner.salvage),
            inner.config.reconcile,
        ))?;
        // An equivalent task may have committed and unregistered between the
        // check above and the registration. Whoever registered after that
        // commit sees it here.
        if let Some(layout) = self.committed_for(&root, &props, constraints) {
            trace!("v{} committed while registering resolve", layout.version());
            return Ok(Some(layout));
        }
        let resolve = match resolve_task.start(run_on_calling_thread)? {
            TaskOutcome::Complete(resolve) => resolve,
            outcome => {
                debug!("resolve v{} ended without a result: {outcome:?}", resolve_task.version());
                return Ok(None);
            }
        };

        let layout_task = inner.layouts.get_or_create(LayoutCalculation::new(
            Arc::clone(&resolve),
            constraints,
            inner.store.clone(),
            previous_layout,
            inner.config.reuse_layout_cache,
        ))?;
        if let Some(layout) = self.committed_for(&root, &props, constraints) {
            trace!("v{} committed while registering layout", layout.version());
            return Ok(Some(layout));
        }
        let layout = match layout_task.start(run_on_calling_thread)? {
            TaskOutcome::Complete(layout) => layout,
            outcome => {
                debug!("layout v{} ended without a result: {outcome:?}", layout_task.version());
                return Ok(None);
            }
        };

        // Tasks stay registered until the commit so late callers attach to
        // them or find the committed result.
        let committed = self.commit(resolve, layout);
        drop(layout_task);
        drop(resolve_task);
        Ok(Some(committed))
    }

    /// Makes `layout` the committed result unless a newer one got there
    /// first, and returns whichever is committed afterwards.
    fn commit(&self, resolve: Arc<ResolveResult>, layout: Arc<LayoutState>) -> Arc<LayoutState> {
        let inner = &self.inner;
        {
            let mut committed = lock(&inner.committed);
            if let Some(current) = &committed.layout {
                if Arc::ptr_eq(current, &layout) {
                    return layout;
                }
                let newer = (resolve.version(), layout.version())
                    > (current.resolve().version(), current.version());
                if !newer {
                    warn!(
                        "layout v{} (resolve v{}) finished after v{}; dropped",
                        layout.version(),
                        resolve.version(),
                        current.version()
                    );
                    return Arc::clone(current);
                }
            }

            committed.sequence += 1;
            let sequence = committed.sequence;
            if let Some(state) = resolve.take_state() {
                inner.store.commit(sequence, &state);
            }
            if let Some(state) = layout.take_state() {
                inner.store.commit(sequence, &state);
            }
            committed.resolve = Some(Arc::clone(&resolve));
            committed.layout = Some(Arc::clone(&layout));
            lock_salvage(&inner.salvage).take();
        }
        debug!(
            "committed layout v{} (resolve v{})",
            layout.version(),
            resolve.version()
        );

        inner.resolves.supersede(resolve.version());
        inner.layouts.supersede(layout.version());

        let listeners: Vec<Listener> = lock(&inner.listeners).values().cloned().collect();
        for listener in listeners {
            listener(&layout);
        }
        layout
    }

    fn spawn_compute(&self) {
        let engine = self.clone();
        self.inner.config.scheduler.spawn(Box::new(move || {
            engine.run_in_background();
        }));
    }

    fn run_in_background(&self) {
        match self.compute_now(false) {
            Ok(Some(_)) => self.schedule_follow_up(),
            Ok(None) => {}
            Err(error) => error!("background computation failed: {error}"),
        }
    }

    /// Updates queued while an asynchronous computation ran are picked up by
    /// one more computation. At most one follow-up is queued at a time.
    fn schedule_follow_up(&self) {
        let inner = &self.inner;
        if !inner.config.follow_up_pending_updates || !inner.store.has_pending_updates() {
            return;
        }
        if inner.follow_up_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("state updates arrived during computation; scheduling a follow-up");
        let engine = self.clone();
        inner.config.scheduler.spawn(Box::new(move || {
            engine
                .inner
                .follow_up_scheduled
                .store(false, Ordering::Release);
            engine.run_in_background();
        }));
    }
}

impl fmt::Debug for TreeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let committed = lock(&self.inner.committed);
        f.debug_struct("TreeEngine")
            .field("config", &self.inner.config)
            .field(
                "committed",
                &committed.layout.as_ref().map(|layout| layout.version()),
            )
            .field("store", &self.inner.store)
            .finish()
    }
}

/// Keeps a listener registered; dropping it unregisters.
pub struct ListenerRegistration {
    engine: Weak<EngineInner>,
    id: u64,
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.engine.upgrade() {
            lock(&inner.listeners).shift_remove(&self.id);
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("id", &self.id)
            .finish()
    }
}

/// Handed to event handlers. Reads see queued updates, lazy ones included.
pub struct EventContext {
    engine: TreeEngine,
    key: ComponentKey,
}

impl EventContext {
    pub fn key(&self) -> &ComponentKey {
        &self.key
    }

    pub fn state_key(&self, slot: u32) -> StateKey {
        self.key.state(slot)
    }

    pub fn current<T: Send + Sync + 'static>(&self, slot: u32) -> Result<Option<Arc<T>>> {
        self.engine.store().current_value(&self.state_key(slot))
    }

    pub fn update<T>(&self, slot: u32, update: StateUpdate<T>, mode: UpdateMode) -> Result<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.engine.update_state(self.state_key(slot), update, mode)
    }

    pub fn engine(&self) -> &TreeEngine {
        &self.engine
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext").field("key", &self.key).finish()
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
