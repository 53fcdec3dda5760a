use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Hierarchical identity of a component instance, stable across computations.
///
/// Keys are path-like strings (`root/Column[0]/title`) so that state and
/// cached measurements can follow a component from one tree to the next.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentKey(Arc<str>);

impl ComponentKey {
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Appends one path segment.
    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}/{}", self.0, segment).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn state(&self, slot: u32) -> StateKey {
        StateKey::new(self.clone(), slot)
    }
}

impl fmt::Debug for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentKey({})", self.0)
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A state slot owned by a component: the component key plus the hook index.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    component: ComponentKey,
    slot: u32,
}

impl StateKey {
    pub fn new(component: ComponentKey, slot: u32) -> Self {
        Self { component, slot }
    }

    pub fn component(&self) -> &ComponentKey {
        &self.component
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }
}

impl fmt::Debug for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({}#{})", self.component, self.slot)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.component, self.slot)
    }
}

/// Identity of a resolved node. Reused subtrees keep their ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn next() -> Self {
        Self(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
