use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};

use super::handler::StateHandler;
use super::initial::InitialStateContainer;
use super::update::{
    erase, type_mismatch, ErasedUpdate, PendingUpdate, StateContainer, StateUpdate, StateValue,
    UpdateMode,
};
use crate::collections::map::{HashMap, HashSet};
use crate::error::Result;
use crate::key::StateKey;

/// The two computation stages that own state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Resolve,
    Layout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// A newer version already committed; the snapshot was left untouched.
    StaleIgnored,
}

#[derive(Default)]
struct StageShared {
    committed: HashMap<StateKey, StateContainer>,
    pending: VecDeque<PendingUpdate>,
    last_committed: Option<u64>,
}

#[derive(Default)]
pub(crate) struct StageStore {
    shared: Mutex<StageShared>,
    pub(crate) initial: InitialStateContainer,
}

impl StageStore {
    fn lock(&self) -> MutexGuard<'_, StageShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub(crate) struct StoreInner {
    resolve: StageStore,
    layout: StageStore,
    revisions: AtomicU64,
    handler_ids: AtomicU64,
    update_seq: AtomicU64,
}

impl StoreInner {
    pub(crate) fn stage(&self, stage: Stage) -> &StageStore {
        match stage {
            Stage::Resolve => &self.resolve,
            Stage::Layout => &self.layout,
        }
    }

    pub(crate) fn next_revision(&self) -> u64 {
        self.revisions.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Committed state of both stages plus the queue of updates not yet folded
/// into a commit. Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the committed state with the currently pending updates
    /// applied, for a computation about to run.
    pub fn create_handler(&self, stage: Stage) -> StateHandler {
        let id = self.inner.handler_ids.fetch_add(1, Ordering::AcqRel) + 1;
        let stage_store = self.inner.stage(stage);
        stage_store.initial.register(id);
        let (containers, pending, snapshot_seq) = {
            let shared = stage_store.lock();
            (
                shared.committed.clone(),
                shared.pending.iter().cloned().collect::<Vec<_>>(),
                self.inner.update_seq.load(Ordering::Acquire),
            )
        };
        StateHandler::new(
            id,
            stage,
            Arc::clone(&self.inner),
            containers,
            pending,
            snapshot_seq,
        )
    }

    /// Initializes `key` at most once per round of live handlers.
    pub fn create_or_get_initial_state<T, F>(
        &self,
        stage: Stage,
        key: &StateKey,
        init: F,
    ) -> Result<StateContainer>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        self.inner.stage(stage).initial.create_or_get(
            key,
            || self.inner.next_revision(),
            || init().map(|value| Arc::new(value) as StateValue),
        )
    }

    /// Queues an update against resolve-stage state.
    pub fn queue_update<T>(&self, key: StateKey, update: StateUpdate<T>, mode: UpdateMode) -> u64
    where
        T: Clone + Send + Sync + 'static,
    {
        self.queue_update_for(Stage::Resolve, key, update, mode)
    }

    pub fn queue_update_for<T>(
        &self,
        stage: Stage,
        key: StateKey,
        update: StateUpdate<T>,
        mode: UpdateMode,
    ) -> u64
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut shared = self.inner.stage(stage).lock();
        let seq = self.inner.update_seq.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("queued {mode:?} update {seq} for {key} ({stage:?})");
        shared.pending.push_back(PendingUpdate {
            seq,
            key,
            mode,
            apply: erase(update),
        });
        seq
    }

    /// Replaces the committed snapshot of the handler's stage with the state
    /// the handler used. Versions at or below the last committed one are
    /// ignored.
    pub fn commit(&self, version: u64, handler: &StateHandler) -> CommitOutcome {
        let stage = handler.stage();
        let mut shared = self.inner.stage(stage).lock();
        if let Some(last) = shared.last_committed {
            if version <= last {
                warn!("{stage:?} state v{version} arrived after v{last}; commit ignored");
                return CommitOutcome::StaleIgnored;
            }
        }

        let mut committed = HashMap::default();
        for key in handler.used_keys() {
            if let Some(container) = handler.container(key) {
                committed.insert(key.clone(), container.clone());
            }
        }
        let applied: HashSet<u64> = handler.applied_updates().iter().copied().collect();
        let snapshot_seq = handler.snapshot_seq();
        let before = shared.pending.len();
        shared.pending.retain(|update| {
            if applied.contains(&update.seq) {
                return false;
            }
            // Seen by the snapshot but never applied: its state left the tree.
            update.seq > snapshot_seq || committed.contains_key(&update.key)
        });
        debug!(
            "{stage:?} state v{version} committed: {} states, {} of {before} updates consumed",
            committed.len(),
            before - shared.pending.len()
        );
        shared.committed = committed;
        shared.last_committed = Some(version);
        CommitOutcome::Applied
    }

    /// Whether applying `update` on top of everything already queued would
    /// leave the resolve-stage value unchanged.
    pub fn can_skip_update<T>(&self, key: &StateKey, update: &StateUpdate<T>) -> Result<bool>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let Some(current) = self.value_after_pending(Stage::Resolve, key)? else {
            return Ok(false);
        };
        let current = (*current)
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(key))?;
        Ok(update.resolve(current) == *current)
    }

    /// Committed resolve-stage value with all queued updates applied,
    /// lazy ones included.
    pub fn current_value<T: Send + Sync + 'static>(&self, key: &StateKey) -> Result<Option<Arc<T>>> {
        self.current_value_for(Stage::Resolve, key)
    }

    pub fn current_value_for<T: Send + Sync + 'static>(
        &self,
        stage: Stage,
        key: &StateKey,
    ) -> Result<Option<Arc<T>>> {
        self.value_after_pending(stage, key)?
            .map(|value| value.downcast::<T>().map_err(|_| type_mismatch::<T>(key)))
            .transpose()
    }

    pub fn committed_value<T: Send + Sync + 'static>(
        &self,
        stage: Stage,
        key: &StateKey,
    ) -> Result<Option<Arc<T>>> {
        let shared = self.inner.stage(stage).lock();
        shared
            .committed
            .get(key)
            .map(|container| container.downcast(key))
            .transpose()
    }

    pub fn committed_revision(&self, stage: Stage, key: &StateKey) -> Option<u64> {
        let shared = self.inner.stage(stage).lock();
        shared.committed.get(key).map(StateContainer::revision)
    }

    pub fn committed_len(&self, stage: Stage) -> usize {
        self.inner.stage(stage).lock().committed.len()
    }

    /// `true` when an update that asked for a computation is still queued.
    pub fn has_pending_updates(&self) -> bool {
        [Stage::Resolve, Stage::Layout].into_iter().any(|stage| {
            self.inner
                .stage(stage)
                .lock()
                .pending
                .iter()
                .any(|update| update.mode.schedules_computation())
        })
    }

    pub fn pending_update_count(&self, stage: Stage) -> usize {
        self.inner.stage(stage).lock().pending.len()
    }

    /// Sequence number of the most recently queued update in any stage.
    pub fn latest_update_seq(&self) -> u64 {
        self.inner.update_seq.load(Ordering::Acquire)
    }

    pub fn last_committed_version(&self, stage: Stage) -> Option<u64> {
        self.inner.stage(stage).lock().last_committed
    }

    pub fn initial_state_count(&self, stage: Stage) -> usize {
        self.inner.stage(stage).initial.len()
    }

    pub fn live_handler_count(&self, stage: Stage) -> usize {
        self.inner.stage(stage).initial.handler_count()
    }

    fn value_after_pending(&self, stage: Stage, key: &StateKey) -> Result<Option<StateValue>> {
        let (base, pending) = {
            let shared = self.inner.stage(stage).lock();
            let Some(base) = shared.committed.get(key) else {
                return Ok(None);
            };
            let pending: Vec<ErasedUpdate> = shared
                .pending
                .iter()
                .filter(|update| &update.key == key)
                .map(|update| Arc::clone(&update.apply))
                .collect();
            (Arc::clone(base.value()), pending)
        };
        pending
            .into_iter()
            .try_fold(base, |value, apply| apply(key, &value))
            .map(Some)
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("resolve_states", &self.committed_len(Stage::Resolve))
            .field("layout_states", &self.committed_len(Stage::Layout))
            .field("latest_update_seq", &self.latest_update_seq())
            .finish()
    }
}
