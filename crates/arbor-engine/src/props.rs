use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_core::collections::map::HashMap;

static NEXT_PROPS_ID: AtomicU64 = AtomicU64::new(1);

/// Typed values visible to every component of a tree, one per type.
///
/// Copy-on-write: [`TreeProps::with`] returns a new set with a new identity.
/// Resolve passes are equivalent only for the same identity.
#[derive(Clone, Default)]
pub struct TreeProps {
    id: u64,
    values: Arc<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl TreeProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(&self, value: T) -> Self {
        let mut values = (*self.values).clone();
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            id: NEXT_PROPS_ID.fetch_add(1, Ordering::Relaxed),
            values: Arc::new(values),
        }
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let value = self.values.get(&TypeId::of::<T>())?;
        Arc::clone(value).downcast::<T>().ok()
    }

    pub fn same(&self, other: &TreeProps) -> bool {
        self.id == other.id
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for TreeProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeProps")
            .field("id", &self.id)
            .field("values", &self.values.len())
            .finish()
    }
}
