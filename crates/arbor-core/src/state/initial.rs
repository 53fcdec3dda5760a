//! At-most-once creation of state that no committed snapshot holds yet.
//!
//! Two computations racing over a new component must agree on its initial
//! value, so the first initializer to run wins and everyone else reads its
//! result. Each key has its own lock; initializers for different keys never
//! block each other. Entries live as long as some handler of the stage is
//! registered and are cleared when the last one goes away.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{trace, warn};

use super::update::{StateContainer, StateValue};
use crate::collections::map::{HashMap, HashSet};
use crate::error::Result;
use crate::key::StateKey;

pub(crate) type HandlerId = u64;

#[derive(Default)]
struct InitialSlot {
    value: Mutex<Option<Result<StateContainer>>>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<StateKey, Arc<InitialSlot>>,
    handlers: HashSet<HandlerId>,
}

#[derive(Default)]
pub(crate) struct InitialStateContainer {
    registry: Mutex<Registry>,
}

impl InitialStateContainer {
    pub(crate) fn register(&self, handler: HandlerId) {
        self.lock().handlers.insert(handler);
    }

    pub(crate) fn unregister(&self, handler: HandlerId) {
        let mut registry = self.lock();
        registry.handlers.remove(&handler);
        if registry.handlers.is_empty() && !registry.slots.is_empty() {
            trace!("clearing {} initial state entries", registry.slots.len());
            registry.slots.clear();
        }
    }

    /// Runs `init` unless some caller already did for `key`. A failed
    /// initializer is remembered too, so every caller sees the same error.
    pub(crate) fn create_or_get(
        &self,
        key: &StateKey,
        revision: impl FnOnce() -> u64,
        init: impl FnOnce() -> Result<StateValue>,
    ) -> Result<StateContainer> {
        let slot = Arc::clone(self.lock().slots.entry(key.clone()).or_default());
        let mut value = slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = value.as_ref() {
            return existing.clone();
        }
        let created = init().map(|state| StateContainer::new(state, revision()));
        if let Err(error) = &created {
            warn!("initial state for {key} failed: {error}");
        }
        *value = Some(created.clone());
        created
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.lock().handlers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
