use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::key::StateKey;

/// Type-erased state value as stored by the engine.
pub type StateValue = Arc<dyn Any + Send + Sync>;

/// A committed or working-copy value together with the revision it was
/// written at. Revisions are unique per store and only grow.
#[derive(Clone)]
pub struct StateContainer {
    value: StateValue,
    revision: u64,
}

impl StateContainer {
    pub fn new(value: StateValue, revision: u64) -> Self {
        Self { value, revision }
    }

    pub fn value(&self) -> &StateValue {
        &self.value
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn downcast<T: Send + Sync + 'static>(&self, key: &StateKey) -> Result<Arc<T>> {
        Arc::clone(&self.value)
            .downcast::<T>()
            .map_err(|_| type_mismatch::<T>(key))
    }
}

impl fmt::Debug for StateContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateContainer")
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

/// A queued change to one state slot.
pub enum StateUpdate<T> {
    Set(T),
    Apply(Arc<dyn Fn(&T) -> T + Send + Sync>),
}

impl<T> StateUpdate<T> {
    pub fn set(value: T) -> Self {
        StateUpdate::Set(value)
    }

    pub fn apply(f: impl Fn(&T) -> T + Send + Sync + 'static) -> Self {
        StateUpdate::Apply(Arc::new(f))
    }

    pub fn resolve(&self, current: &T) -> T
    where
        T: Clone,
    {
        match self {
            StateUpdate::Set(value) => value.clone(),
            StateUpdate::Apply(f) => f(current),
        }
    }
}

impl<T: Clone> Clone for StateUpdate<T> {
    fn clone(&self) -> Self {
        match self {
            StateUpdate::Set(value) => StateUpdate::Set(value.clone()),
            StateUpdate::Apply(f) => StateUpdate::Apply(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for StateUpdate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateUpdate::Set(value) => f.debug_tuple("Set").field(value).finish(),
            StateUpdate::Apply(_) => f.write_str("Apply(..)"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    /// Recompute on the calling thread before returning.
    Sync,
    /// Schedule a background recomputation.
    Async,
    /// Queue only; picked up by whatever computation runs next.
    Lazy,
}

impl UpdateMode {
    pub fn schedules_computation(self) -> bool {
        !matches!(self, UpdateMode::Lazy)
    }
}

pub(crate) type ErasedUpdate = Arc<dyn Fn(&StateKey, &StateValue) -> Result<StateValue> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct PendingUpdate {
    pub(crate) seq: u64,
    pub(crate) key: StateKey,
    pub(crate) mode: UpdateMode,
    pub(crate) apply: ErasedUpdate,
}

impl fmt::Debug for PendingUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingUpdate")
            .field("seq", &self.seq)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .finish()
    }
}

pub(crate) fn erase<T>(update: StateUpdate<T>) -> ErasedUpdate
where
    T: Clone + Send + Sync + 'static,
{
    Arc::new(move |key, current| {
        let typed = (**current)
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(key))?;
        Ok(Arc::new(update.resolve(typed)) as StateValue)
    })
}

pub(crate) fn type_mismatch<T>(key: &StateKey) -> EngineError {
    EngineError::StateTypeMismatch {
        key: key.to_string(),
        expected: type_name::<T>(),
    }
}
