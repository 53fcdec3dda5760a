//! Per-computation memo of measurement results.
//!
//! Entries are keyed first by component key (recorded while resolving, before
//! node ids exist) and then linked to the node id once the node is built. A
//! cache can delegate lookups to an older frozen cache, which is how work
//! salvaged from a failed computation is reused by the next one.

use std::fmt;
use std::sync::Arc;

use log::trace;

use crate::collections::map::HashMap;
use crate::error::{EngineError, Result};
use crate::key::{ComponentKey, NodeId};

pub struct ResultCache<V> {
    by_component: HashMap<ComponentKey, V>,
    by_node: HashMap<NodeId, V>,
    frozen: bool,
    delegate: Option<Arc<ResultCache<V>>>,
}

impl<V> Default for ResultCache<V> {
    fn default() -> Self {
        Self {
            by_component: HashMap::default(),
            by_node: HashMap::default(),
            frozen: false,
            delegate: None,
        }
    }
}

impl<V: Clone> ResultCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delegate(delegate: Arc<ResultCache<V>>) -> Self {
        Self {
            delegate: Some(delegate),
            ..Self::default()
        }
    }

    pub fn delegate(&self) -> Option<&Arc<ResultCache<V>>> {
        self.delegate.as_ref()
    }

    pub fn get_for_component(&self, key: &ComponentKey) -> Option<&V> {
        self.by_component
            .get(key)
            .or_else(|| self.delegate.as_deref()?.get_for_component(key))
    }

    pub fn get_for_node(&self, id: NodeId) -> Option<&V> {
        self.by_node
            .get(&id)
            .or_else(|| self.delegate.as_deref()?.get_for_node(id))
    }

    pub fn put_for_component(&mut self, key: ComponentKey, value: V) -> Result<()> {
        self.check_writable()?;
        self.by_component.insert(key, value);
        Ok(())
    }

    pub fn put_for_node(&mut self, id: NodeId, value: V) -> Result<()> {
        self.check_writable()?;
        self.by_node.insert(id, value);
        Ok(())
    }

    /// Makes the entry recorded for `key` reachable by `id` as well.
    /// Returns `false` when nothing is recorded for `key`.
    pub fn link_node(&mut self, key: &ComponentKey, id: NodeId) -> Result<bool> {
        self.check_writable()?;
        match self.get_for_component(key).cloned() {
            Some(value) => {
                trace!("linking cached result of {key} to node {id}");
                self.by_node.insert(id, value);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Irreversible. Reads keep working, writes fail with `CacheFrozen`.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Entries held locally, not counting the delegate.
    pub fn len(&self) -> usize {
        self.by_component.len() + self.by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies local and delegated entries into a new writable cache with no
    /// delegate. Local entries win over delegated ones.
    pub fn flattened(&self) -> Self {
        let mut flat = match self.delegate.as_deref() {
            Some(delegate) => delegate.flattened(),
            None => Self::default(),
        };
        flat.by_component.extend(
            self.by_component
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        flat.by_node
            .extend(self.by_node.iter().map(|(id, value)| (*id, value.clone())));
        flat
    }

    fn check_writable(&self) -> Result<()> {
        if self.frozen {
            Err(EngineError::CacheFrozen)
        } else {
            Ok(())
        }
    }
}

impl<V> fmt::Debug for ResultCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("components", &self.by_component.len())
            .field("nodes", &self.by_node.len())
            .field("frozen", &self.frozen)
            .field("delegate", &self.delegate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_cache_rejects_writes_but_serves_reads() {
        let mut cache = ResultCache::new();
        cache.put_for_component(ComponentKey::new("a"), 1).unwrap();
        cache.freeze();

        assert_eq!(cache.get_for_component(&"a".into()), Some(&1));
        assert_eq!(
            cache.put_for_component(ComponentKey::new("b"), 2),
            Err(EngineError::CacheFrozen)
        );
        assert_eq!(
            cache.link_node(&"a".into(), NodeId::next()),
            Err(EngineError::CacheFrozen)
        );
        assert!(cache.is_frozen());
    }

    #[test]
    fn lookups_fall_back_to_delegate() {
        let mut old = ResultCache::new();
        let node = NodeId::next();
        old.put_for_component(ComponentKey::new("a"), 1).unwrap();
        old.put_for_node(node, 10).unwrap();
        old.freeze();

        let mut cache = ResultCache::with_delegate(Arc::new(old));
        cache.put_for_component(ComponentKey::new("a"), 2).unwrap();

        assert_eq!(cache.get_for_component(&"a".into()), Some(&2));
        assert_eq!(cache.get_for_node(node), Some(&10));
        assert_eq!(cache.get_for_node(NodeId::next()), None);
    }

    #[test]
    fn link_node_copies_component_entry() {
        let mut cache = ResultCache::new();
        let node = NodeId::next();
        let key = ComponentKey::new("root/text");

        assert!(!cache.link_node(&key, node).unwrap());
        cache.put_for_component(key.clone(), "measured").unwrap();
        assert!(cache.link_node(&key, node).unwrap());
        assert_eq!(cache.get_for_node(node), Some(&"measured"));
    }

    #[test]
    fn flattened_merges_the_delegate_chain() {
        let mut oldest = ResultCache::new();
        oldest.put_for_component(ComponentKey::new("a"), 1).unwrap();
        oldest.put_for_component(ComponentKey::new("b"), 1).unwrap();
        let mut middle = ResultCache::with_delegate(Arc::new(oldest));
        middle.put_for_component(ComponentKey::new("b"), 2).unwrap();
        middle.freeze();

        let flat = middle.flattened();

        assert!(flat.delegate().is_none());
        assert!(!flat.is_frozen());
        assert_eq!(flat.len(), 2);
        assert_eq!(flat.get_for_component(&"a".into()), Some(&1));
        assert_eq!(flat.get_for_component(&"b".into()), Some(&2));
    }
}
