use super::*;
use crate::component::{Component, Render};
use crate::scope::{MeasureScope, RenderScope};
use arbor_core::{Calculation, Job, Stage, StageOutcome, TaskContext};
use arbor_layout::{LinearPolicy, Size, SizeSpecs};
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;

#[derive(Default)]
struct Queue(Mutex<VecDeque<Job>>);

impl Queue {
    fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.0.lock().unwrap().pop_front();
            let Some(job) = job else {
                return ran;
            };
            job();
            ran += 1;
        }
    }
}

impl TaskScheduler for Queue {
    fn spawn(&self, job: Job) {
        self.0.lock().unwrap().push_back(job);
    }
}

#[derive(Clone, Default)]
struct Count {
    renders: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<i32>>>,
}

impl Component for Count {
    fn render(&self, scope: &mut RenderScope<'_>) -> Result<Render> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let value = *scope.use_state(|| 0i32)?;
        self.seen.lock().unwrap().push(value);
        scope.on_event("bump", |ctx| {
            ctx.update(0, StateUpdate::apply(|v: &i32| v + 1), UpdateMode::Sync)
        });
        scope.on_event("peek", |ctx| {
            ctx.update(0, StateUpdate::apply(|v: &i32| v + 100), UpdateMode::Lazy)?;
            assert_eq!(ctx.current::<i32>(0)?.as_deref().copied(), Some(100));
            Ok(())
        });
        Ok(Render::fixed(Size::new(value as f32, 1.0)))
    }
}

struct Pair(Element, Element);

impl Component for Pair {
    fn render(&self, _scope: &mut RenderScope<'_>) -> Result<Render> {
        Ok(Render::children(
            LinearPolicy::row(),
            vec![self.0.clone(), self.1.clone()],
        ))
    }
}

/// Leaf whose width lives in layout state slot 0.
struct FixedWidth(f32);

impl Component for FixedWidth {
    fn render(&self, _scope: &mut RenderScope<'_>) -> Result<Render> {
        let width = self.0;
        Ok(Render::leaf(
            move |scope: &mut MeasureScope<'_>, _: SizeSpecs| -> Result<Size> {
                let width = scope.use_state(|| width)?;
                Ok(Size::new(*width, 1.0))
            },
        ))
    }
}

struct Broken;

impl Component for Broken {
    fn render(&self, scope: &mut RenderScope<'_>) -> Result<Render> {
        Err(EngineError::component(scope.key(), "cannot render"))
    }
}

fn count_key() -> StateKey {
    ComponentKey::new("root").state(0)
}

fn committed_count(engine: &TreeEngine) -> Option<i32> {
    engine
        .store()
        .committed_value::<i32>(arbor_core::Stage::Resolve, &count_key())
        .unwrap()
        .as_deref()
        .copied()
}

#[test]
fn compute_without_root_fails() {
    let engine = TreeEngine::new();
    assert!(matches!(engine.compute(RunMode::Sync), Err(EngineError::NoRoot)));
}

#[test]
fn unchanged_inputs_return_the_committed_layout() {
    let engine = TreeEngine::new();
    let count = Count::default();
    engine.set_root(count.clone());
    engine.set_constraints(Constraints::loose(100.0, 100.0));

    let first = engine.compute(RunMode::Sync).unwrap().unwrap();
    let again = engine.compute(RunMode::Sync).unwrap().unwrap();

    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(count.renders.load(Ordering::SeqCst), 1);
    assert_eq!(engine.in_flight(), 0);
    assert!(Arc::ptr_eq(&engine.committed().unwrap(), &first));
}

#[test]
fn queued_updates_apply_in_order() {
    let queue = Arc::new(Queue::default());
    let engine = TreeEngine::with_config(EngineConfig {
        scheduler: queue.clone(),
        ..EngineConfig::default()
    });
    let count = Count::default();
    engine.set_root(count.clone());
    engine.compute(RunMode::Sync).unwrap();

    engine
        .update_state(count_key(), StateUpdate::set(5), UpdateMode::Async)
        .unwrap();
    engine
        .update_state(count_key(), StateUpdate::apply(|v: &i32| v + 1), UpdateMode::Async)
        .unwrap();
    assert_eq!(committed_count(&engine), Some(0));
    queue.drain();

    assert_eq!(committed_count(&engine), Some(6));
    assert_eq!(*count.seen.lock().unwrap(), vec![0, 6]);
    assert!(!engine.store().has_pending_updates());
}

#[test]
fn events_update_state_through_the_committed_tree() {
    let engine = TreeEngine::new();
    let count = Count::default();
    engine.set_root(count.clone());
    engine.compute(RunMode::Sync).unwrap();

    assert!(engine.dispatch_event(&ComponentKey::new("root"), "bump").unwrap());
    assert!(engine.dispatch_event(&ComponentKey::new("root"), "bump").unwrap());
    assert!(!engine.dispatch_event(&ComponentKey::new("root"), "missing").unwrap());

    assert_eq!(committed_count(&engine), Some(2));
    assert_eq!(engine.committed().unwrap().size(), Size::new(2.0, 1.0));
}

#[test]
fn lazy_updates_wait_for_the_next_computation() {
    let engine = TreeEngine::new();
    let count = Count::default();
    engine.set_root(count.clone());
    engine.compute(RunMode::Sync).unwrap();

    assert!(engine.dispatch_event(&ComponentKey::new("root"), "peek").unwrap());
    assert_eq!(committed_count(&engine), Some(0));
    assert_eq!(count.renders.load(Ordering::SeqCst), 1);
    assert!(!engine.store().has_pending_updates());

    // Lazy updates do not count as pending, so new inputs are needed.
    engine.set_constraints(Constraints::loose(500.0, 10.0));
    engine.compute(RunMode::Sync).unwrap();
    assert_eq!(committed_count(&engine), Some(100));
}

#[test]
fn skipped_updates_do_not_compute() {
    let engine = TreeEngine::new();
    let count = Count::default();
    engine.set_root(count.clone());
    engine.compute(RunMode::Sync).unwrap();

    let queued = engine
        .update_state_if_changed(count_key(), StateUpdate::set(0), UpdateMode::Sync)
        .unwrap();
    assert!(!queued);
    assert_eq!(count.renders.load(Ordering::SeqCst), 1);

    let queued = engine
        .update_state_if_changed(count_key(), StateUpdate::set(3), UpdateMode::Sync)
        .unwrap();
    assert!(queued);
    assert_eq!(committed_count(&engine), Some(3));
}

#[test]
fn failure_leaves_the_committed_tree_intact() {
    let engine = TreeEngine::new();
    engine.set_root(Count::default());
    let good = engine.compute(RunMode::Sync).unwrap().unwrap();

    engine.set_root(Pair(Element::new(Count::default()), Element::new(Broken)));
    let err = engine.compute(RunMode::Sync).unwrap_err();

    assert!(matches!(err, EngineError::Component { .. }));
    assert!(Arc::ptr_eq(&engine.committed().unwrap(), &good));
    assert_eq!(committed_count(&engine), Some(0));
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn listeners_hear_commits_until_dropped() {
    let engine = TreeEngine::new();
    engine.set_root(Count::default());
    let versions = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&versions);
    let registration = engine.add_listener(move |layout| seen.lock().unwrap().push(layout.version()));

    engine.compute(RunMode::Sync).unwrap();
    engine.dispatch_event(&ComponentKey::new("root"), "bump").unwrap();
    assert_eq!(versions.lock().unwrap().len(), 2);
    assert!(versions.lock().unwrap().windows(2).all(|pair| pair[0] < pair[1]));

    drop(registration);
    assert_eq!(engine.listener_count(), 0);
    engine.dispatch_event(&ComponentKey::new("root"), "bump").unwrap();
    assert_eq!(versions.lock().unwrap().len(), 2);
}

#[test]
fn stale_results_do_not_replace_newer_ones() {
    let engine = TreeEngine::new();
    engine.set_root(Count::default());
    let older = engine.compute(RunMode::Sync).unwrap().unwrap();
    engine.set_constraints(Constraints::loose(10.0, 10.0));
    let newer = engine.compute(RunMode::Sync).unwrap().unwrap();

    let kept = engine.commit(Arc::clone(older.resolve()), Arc::clone(&older));

    assert!(Arc::ptr_eq(&kept, &newer));
    assert!(Arc::ptr_eq(&engine.committed().unwrap(), &newer));
}

fn finished_pass(
    engine: &TreeEngine,
    root: impl Component,
    resolve_version: u64,
    layout_version: u64,
) -> (Arc<ResolveResult>, Arc<LayoutState>) {
    let store = engine.store().clone();
    let resolve = ResolveCalculation::new(
        Element::new(root),
        TreeProps::new(),
        store.clone(),
        None,
        Arc::default(),
        true,
    );
    let resolve = match resolve.calculate(&TaskContext::new(resolve_version)) {
        Ok(StageOutcome::Complete(result)) => Arc::new(result),
        other => panic!("expected a complete resolve, got {other:?}"),
    };
    let layout = LayoutCalculation::new(
        Arc::clone(&resolve),
        Constraints::loose(100.0, 100.0),
        store,
        None,
        true,
    );
    match layout.calculate(&TaskContext::new(layout_version)) {
        Ok(StageOutcome::Complete(state)) => (resolve, Arc::new(state)),
        other => panic!("expected a complete layout, got {other:?}"),
    }
}

#[test]
fn layout_state_follows_the_committed_tree() {
    let engine = TreeEngine::new();
    // The older tree got a higher layout version than the newer one.
    let (resolve, layout) = finished_pass(&engine, FixedWidth(9.0), 3, 6);
    engine.commit(resolve, layout);
    let pair = Pair(Element::new(FixedWidth(5.0)), Element::new(FixedWidth(5.0)));
    let (resolve, layout) = finished_pass(&engine, pair, 4, 5);
    let kept = engine.commit(resolve, Arc::clone(&layout));

    assert!(Arc::ptr_eq(&kept, &layout));
    let width = |key: &str| {
        engine
            .store()
            .committed_value::<f32>(Stage::Layout, &ComponentKey::new(key).state(0))
            .unwrap()
            .as_deref()
            .copied()
    };
    assert_eq!(width("root/FixedWidth[0]"), Some(5.0));
    assert_eq!(width("root/FixedWidth[1]"), Some(5.0));
    assert_eq!(width("root"), None);
}
