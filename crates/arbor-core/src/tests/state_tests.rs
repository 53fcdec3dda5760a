use super::*;
use crate::error::EngineError;
use crate::key::{ComponentKey, StateKey};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn key(name: &str) -> StateKey {
    ComponentKey::new(name).state(1)
}

fn commit_initial(store: &StateStore, version: u64, key: &StateKey, value: i32) {
    let mut handler = store.create_handler(Stage::Resolve);
    handler.get_or_init(key, || Ok(value)).unwrap();
    assert_eq!(store.commit(version, &handler), CommitOutcome::Applied);
}

#[test]
fn pending_updates_apply_in_queue_order() {
    let store = StateStore::new();
    let counter = key("comp");
    commit_initial(&store, 1, &counter, 0);

    store.queue_update(counter.clone(), StateUpdate::set(5), UpdateMode::Sync);
    store.queue_update(counter.clone(), StateUpdate::apply(|v: &i32| v + 1), UpdateMode::Sync);

    let mut handler = store.create_handler(Stage::Resolve);
    let (value, _) = handler.get_or_init::<i32, _>(&counter, || Ok(0)).unwrap();
    assert_eq!(*value, 6);
    assert_eq!(handler.applied_updates().len(), 2);

    assert_eq!(store.commit(2, &handler), CommitOutcome::Applied);
    assert_eq!(store.pending_update_count(Stage::Resolve), 0);
    assert_eq!(
        store.committed_value::<i32>(Stage::Resolve, &counter).unwrap().as_deref(),
        Some(&6)
    );
}

#[test]
fn stale_commit_is_ignored() {
    let store = StateStore::new();
    let counter = key("comp");
    commit_initial(&store, 1, &counter, 0);

    store.queue_update(counter.clone(), StateUpdate::set(1), UpdateMode::Sync);
    let older = store.create_handler(Stage::Resolve);
    store.queue_update(counter.clone(), StateUpdate::set(2), UpdateMode::Sync);
    let mut newer = store.create_handler(Stage::Resolve);
    newer.get_or_init::<i32, _>(&counter, || Ok(0)).unwrap();

    assert_eq!(store.commit(3, &newer), CommitOutcome::Applied);
    assert_eq!(store.commit(2, &older), CommitOutcome::StaleIgnored);
    assert_eq!(
        store.committed_value::<i32>(Stage::Resolve, &counter).unwrap().as_deref(),
        Some(&2)
    );
    assert_eq!(store.last_committed_version(Stage::Resolve), Some(3));
}

#[test]
fn uncommitted_work_leaves_snapshot_untouched() {
    let store = StateStore::new();
    let counter = key("comp");
    commit_initial(&store, 1, &counter, 3);
    store.queue_update(counter.clone(), StateUpdate::set(9), UpdateMode::Async);

    {
        let mut handler = store.create_handler(Stage::Resolve);
        let (value, _) = handler.get_or_init::<i32, _>(&counter, || Ok(0)).unwrap();
        assert_eq!(*value, 9);
    }

    assert_eq!(
        store.committed_value::<i32>(Stage::Resolve, &counter).unwrap().as_deref(),
        Some(&3)
    );
    assert_eq!(store.pending_update_count(Stage::Resolve), 1);
    assert!(store.has_pending_updates());
}

#[test]
fn concurrent_initialization_runs_once() {
    let store = StateStore::new();
    let shared = key("new");
    let inits = Arc::new(AtomicUsize::new(0));
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let mut handler = store.create_handler(Stage::Resolve);
            let (shared, inits, barrier) = (shared.clone(), Arc::clone(&inits), Arc::clone(&barrier));
            thread::spawn(move || {
                barrier.wait();
                let (value, _) = handler
                    .get_or_init::<usize, _>(&shared, || {
                        inits.fetch_add(1, Ordering::SeqCst);
                        Ok(i)
                    })
                    .unwrap();
                *value
            })
        })
        .collect();
    let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| *v == values[0]));
    assert_eq!(store.live_handler_count(Stage::Resolve), 0);
    assert_eq!(store.initial_state_count(Stage::Resolve), 0);
}

#[test]
fn initial_state_lives_while_a_handler_does() {
    let store = StateStore::new();
    let fresh = key("fresh");
    let first = store.create_handler(Stage::Layout);

    let a = store
        .create_or_get_initial_state(Stage::Layout, &fresh, || Ok(1))
        .unwrap();
    let b = store
        .create_or_get_initial_state(Stage::Layout, &fresh, || Ok(2))
        .unwrap();
    assert!(Arc::ptr_eq(a.value(), b.value()));
    assert_eq!(a.revision(), b.revision());
    assert_eq!(*a.downcast::<i32>(&fresh).unwrap(), 1);
    assert_eq!(store.initial_state_count(Stage::Layout), 1);

    drop(first);
    assert_eq!(store.initial_state_count(Stage::Layout), 0);
}

#[test]
fn initializer_failure_is_shared() {
    let store = StateStore::new();
    let broken = key("broken");
    let mut first = store.create_handler(Stage::Resolve);
    let mut second = store.create_handler(Stage::Resolve);
    let failure = EngineError::InitializerFailure {
        key: broken.to_string(),
        message: "no".into(),
    };

    let err = first
        .get_or_init::<i32, _>(&broken, || Err(failure.clone()))
        .unwrap_err();
    assert_eq!(err, failure);
    let err = second.get_or_init::<i32, _>(&broken, || Ok(1)).unwrap_err();
    assert_eq!(err, failure);
}

#[test]
fn update_for_new_state_waits_for_its_initialization() {
    let store = StateStore::new();
    let later = key("later");
    store.queue_update(later.clone(), StateUpdate::apply(|v: &i32| v + 10), UpdateMode::Sync);

    let mut handler = store.create_handler(Stage::Resolve);
    assert_eq!(handler.deferred_count(), 1);
    let (value, _) = handler.get_or_init::<i32, _>(&later, || Ok(1)).unwrap();

    assert_eq!(*value, 11);
    assert_eq!(handler.deferred_count(), 0);
}

#[test]
fn commit_drops_state_and_updates_of_removed_components() {
    let store = StateStore::new();
    let kept = key("kept");
    let gone = key("gone");
    let mut handler = store.create_handler(Stage::Resolve);
    handler.get_or_init(&kept, || Ok(1)).unwrap();
    handler.get_or_init(&gone, || Ok(2)).unwrap();
    store.commit(1, &handler);
    drop(handler);

    store.queue_update(gone.clone(), StateUpdate::set(5), UpdateMode::Sync);
    let mut handler = store.create_handler(Stage::Resolve);
    handler.get_or_init::<i32, _>(&kept, || Ok(0)).unwrap();
    store.queue_update(gone.clone(), StateUpdate::set(6), UpdateMode::Sync);
    store.commit(2, &handler);

    assert_eq!(store.committed_len(Stage::Resolve), 1);
    assert!(store.committed_value::<i32>(Stage::Resolve, &gone).unwrap().is_none());
    // Queued after the snapshot, so it survives for the next computation.
    assert_eq!(store.pending_update_count(Stage::Resolve), 1);
}

#[test]
fn can_skip_update_sees_queued_updates() {
    let store = StateStore::new();
    let flag = key("flag");
    commit_initial(&store, 1, &flag, 1);

    assert!(store.can_skip_update(&flag, &StateUpdate::set(1)).unwrap());
    store.queue_update(flag.clone(), StateUpdate::set(2), UpdateMode::Lazy);
    assert!(!store.can_skip_update(&flag, &StateUpdate::set(1)).unwrap());
    assert!(store.can_skip_update(&flag, &StateUpdate::set(2)).unwrap());
    assert!(!store.can_skip_update(&key("unknown"), &StateUpdate::set(2)).unwrap());

    assert!(!store.has_pending_updates());
    assert_eq!(store.current_value::<i32>(&flag).unwrap().as_deref(), Some(&2));
}

#[test]
fn reading_with_the_wrong_type_fails() {
    let store = StateStore::new();
    let text = key("text");
    commit_initial(&store, 1, &text, 4);

    let mut handler = store.create_handler(Stage::Resolve);
    let err = handler.get_or_init::<String, _>(&text, || Ok(String::new())).unwrap_err();
    assert!(matches!(err, EngineError::StateTypeMismatch { .. }));
}
