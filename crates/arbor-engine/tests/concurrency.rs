use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use arbor_core::Stage;
use arbor_engine::{
    ComponentKey, Constraints, EngineConfig, Element, RunMode, StateUpdate, TreeEngine, UpdateMode,
};
use arbor_runtime_std::StdScheduler;
use arbor_testing::{CallCounter, Column, Counter, Text};

const THREADS: usize = 8;

fn pooled_engine(scheduler: &Arc<StdScheduler>) -> TreeEngine {
    TreeEngine::with_config(EngineConfig {
        scheduler: scheduler.clone(),
        ..EngineConfig::default()
    })
}

#[test]
fn concurrent_equivalent_computations_share_one_pass() {
    let engine = TreeEngine::new();
    let renders = CallCounter::new();
    let measures = CallCounter::new();
    engine.set_root(Column::new(vec![Element::new(
        Text::new("shared").counting(&renders, &measures),
    )]));
    engine.set_constraints(Constraints::loose(100.0, 100.0));

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.compute(RunMode::Sync).unwrap().unwrap()
            })
        })
        .collect();
    let layouts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(renders.get(), 1);
    assert_eq!(measures.get(), 1);
    assert!(layouts.iter().all(|layout| Arc::ptr_eq(layout, &layouts[0])));
    assert_eq!(engine.in_flight(), 0);
}

#[test]
fn callers_arriving_around_a_commit_reuse_it() {
    // Late callers race the first commit and its unregistering; over many
    // rounds every one of them must still find the shared result.
    for round in 0..200 {
        let engine = TreeEngine::new();
        let renders = CallCounter::new();
        let measures = CallCounter::new();
        engine.set_root(Text::new("shared").counting(&renders, &measures));

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let engine = engine.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    engine.compute(RunMode::Sync).unwrap().unwrap()
                })
            })
            .collect();
        let layouts: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(renders.get(), 1, "round {round}");
        assert_eq!(measures.get(), 1, "round {round}");
        assert!(layouts.iter().all(|layout| Arc::ptr_eq(layout, &layouts[0])));
    }
}

#[test]
fn async_updates_from_many_threads_all_land() {
    let scheduler = Arc::new(StdScheduler::with_name("updates", 4).unwrap());
    let engine = pooled_engine(&scheduler);
    let counter = Counter::new(0);
    engine.set_root(counter.clone());
    engine.compute(RunMode::Sync).unwrap();

    let key = ComponentKey::new("root").state(0);
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let engine = engine.clone();
            let key = key.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine
                    .update_state(key, StateUpdate::apply(|count: &i32| count + 1), UpdateMode::Async)
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    scheduler.wait_idle();
    let layout = engine.compute(RunMode::Sync).unwrap().unwrap();

    let committed = engine
        .store()
        .committed_value::<i32>(Stage::Resolve, &key)
        .unwrap()
        .as_deref()
        .copied();
    assert_eq!(committed, Some(THREADS as i32));
    assert_eq!(layout.size().width, 10.0 * THREADS as f32);
    assert_eq!(counter.inits.get(), 1);
    assert_eq!(counter.seen().iter().max(), Some(&(THREADS as i32)));
    assert!(!engine.store().has_pending_updates());
    scheduler.shutdown();
}

#[test]
fn async_commits_notify_listeners_from_the_pool() {
    let scheduler = Arc::new(StdScheduler::with_name("notify", 2).unwrap());
    let engine = pooled_engine(&scheduler);
    engine.set_root(Text::new("hello"));
    let (sender, receiver) = mpsc::channel();
    let _registration = engine.add_listener(move |layout| {
        let name = thread::current().name().map(str::to_owned);
        let _ = sender.send((name, layout.version()));
    });

    assert!(engine.compute(RunMode::Async).unwrap().is_none());
    let (name, version) = receiver.recv_timeout(Duration::from_secs(10)).unwrap();

    assert!(name.unwrap_or_default().starts_with("notify-"));
    assert_eq!(engine.committed().unwrap().version(), version);
    scheduler.wait_idle();
    scheduler.shutdown();
}

#[test]
fn newer_inputs_win_over_older_async_work() {
    let scheduler = Arc::new(StdScheduler::with_name("inputs", 4).unwrap());
    let engine = pooled_engine(&scheduler);
    engine.set_root(Text::new("sized").sized(1000.0, 1000.0));

    for width in 1..=20 {
        engine.set_constraints(Constraints::loose(width as f32 * 10.0, 100.0));
        engine.compute(RunMode::Async).unwrap();
    }
    scheduler.wait_idle();
    // A final synchronous pass sees the last inputs whatever finished first.
    let layout = engine.compute(RunMode::Sync).unwrap().unwrap();

    assert_eq!(layout.constraints(), Constraints::loose(200.0, 100.0));
    assert_eq!(layout.size().width, 200.0);
    assert!(Arc::ptr_eq(&engine.committed().unwrap(), &layout));
    scheduler.shutdown();
}
