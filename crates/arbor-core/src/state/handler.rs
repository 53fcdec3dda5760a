use std::fmt;
use std::sync::Arc;

use log::{trace, warn};

use super::initial::HandlerId;
use super::store::{Stage, StoreInner};
use super::update::{PendingUpdate, StateContainer, StateValue};
use crate::collections::map::{HashMap, HashSet};
use crate::error::Result;
use crate::key::StateKey;

/// Working copy of one stage's state for a single computation.
///
/// Built from the committed snapshot with the pending updates of that moment
/// applied in queue order. Updates for state that does not exist yet are held
/// back and applied once the state is initialized. Reads mark keys as used;
/// only used keys survive the commit.
pub struct StateHandler {
    id: HandlerId,
    stage: Stage,
    store: Arc<StoreInner>,
    containers: HashMap<StateKey, StateContainer>,
    used: HashSet<StateKey>,
    applied: Vec<u64>,
    deferred: Vec<PendingUpdate>,
    snapshot_seq: u64,
}

impl StateHandler {
    pub(crate) fn new(
        id: HandlerId,
        stage: Stage,
        store: Arc<StoreInner>,
        containers: HashMap<StateKey, StateContainer>,
        pending: Vec<PendingUpdate>,
        snapshot_seq: u64,
    ) -> Self {
        let mut handler = Self {
            id,
            stage,
            store,
            containers,
            used: HashSet::default(),
            applied: Vec::new(),
            deferred: Vec::new(),
            snapshot_seq,
        };
        for update in pending {
            handler.apply_or_defer(update);
        }
        handler
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Highest update sequence number the snapshot saw.
    pub fn snapshot_seq(&self) -> u64 {
        self.snapshot_seq
    }

    /// Returns the value for `key`, creating it through the stage's shared
    /// initial state when neither the snapshot nor this handler has it.
    pub fn get_or_init<T, F>(&mut self, key: &StateKey, init: F) -> Result<(Arc<T>, u64)>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T>,
    {
        self.used.insert(key.clone());
        if let Some(container) = self.containers.get(key) {
            return Ok((container.downcast(key)?, container.revision()));
        }

        let store = Arc::clone(&self.store);
        let container = store.stage(self.stage).initial.create_or_get(
            key,
            || store.next_revision(),
            || init().map(|value| Arc::new(value) as StateValue),
        )?;
        self.containers.insert(key.clone(), container);

        let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|update| &update.key == key);
        self.deferred = rest;
        for update in ready {
            self.apply_or_defer(update);
        }

        match self.containers.get(key) {
            Some(container) => Ok((container.downcast(key)?, container.revision())),
            None => Err(super::update::type_mismatch::<T>(key)),
        }
    }

    pub fn value<T: Send + Sync + 'static>(&self, key: &StateKey) -> Result<Option<Arc<T>>> {
        self.containers
            .get(key)
            .map(|container| container.downcast(key))
            .transpose()
    }

    pub fn revision(&self, key: &StateKey) -> Option<u64> {
        self.containers.get(key).map(StateContainer::revision)
    }

    pub fn mark_used(&mut self, key: &StateKey) {
        if self.containers.contains_key(key) {
            self.used.insert(key.clone());
        }
    }

    pub fn is_used(&self, key: &StateKey) -> bool {
        self.used.contains(key)
    }

    pub fn used_keys(&self) -> impl Iterator<Item = &StateKey> + '_ {
        self.used.iter()
    }

    pub fn container(&self, key: &StateKey) -> Option<&StateContainer> {
        self.containers.get(key)
    }

    /// Sequence numbers of the queued updates folded into this copy.
    pub fn applied_updates(&self) -> &[u64] {
        &self.applied
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    fn apply_or_defer(&mut self, update: PendingUpdate) {
        let Some(container) = self.containers.get(&update.key) else {
            self.deferred.push(update);
            return;
        };
        match (update.apply)(&update.key, container.value()) {
            Ok(value) => {
                let revision = self.store.next_revision();
                trace!("applied update {} to {} (r{revision})", update.seq, update.key);
                self.containers
                    .insert(update.key, StateContainer::new(value, revision));
            }
            Err(error) => warn!("dropping update {} for {}: {error}", update.seq, update.key),
        }
        self.applied.push(update.seq);
    }
}

impl Drop for StateHandler {
    fn drop(&mut self) {
        self.store.stage(self.stage).initial.unregister(self.id);
    }
}

impl fmt::Debug for StateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandler")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("states", &self.containers.len())
            .field("used", &self.used.len())
            .field("applied", &self.applied.len())
            .finish()
    }
}
