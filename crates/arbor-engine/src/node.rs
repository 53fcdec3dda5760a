//! Arena of resolved nodes produced by the resolve stage.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use arbor_core::collections::map::HashMap;
use arbor_core::{ComponentKey, NodeId};
use arbor_layout::MeasurePolicy;

use crate::component::{Element, EventHandler, MeasureFunction};
use crate::scope::StateRead;

#[derive(Clone)]
pub enum NodeKind {
    Container(Arc<dyn MeasurePolicy>),
    Leaf(Arc<dyn MeasureFunction>),
    /// Rendered nothing; keeps its position for reconciliation.
    Null,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Container(_) => "container",
            NodeKind::Leaf(_) => "leaf",
            NodeKind::Null => "null",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A child position: either already resolved into the arena, or still
/// waiting for expansion after an interrupt.
#[derive(Clone, Debug)]
pub enum ChildSlot {
    Resolved(usize),
    Pending { element: Element, key: ComponentKey },
}

#[derive(Clone)]
pub struct ResolvedNode {
    pub(crate) id: NodeId,
    pub(crate) key: ComponentKey,
    pub(crate) element: Element,
    pub(crate) kind: NodeKind,
    pub(crate) children: Vec<ChildSlot>,
    pub(crate) reads: Vec<StateRead>,
    pub(crate) handlers: Vec<(String, EventHandler)>,
}

impl ResolvedNode {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &ComponentKey {
        &self.key
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn component_type(&self) -> &'static str {
        self.element.type_name()
    }

    pub fn reads(&self) -> &[StateRead] {
        &self.reads
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.handlers.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for ResolvedNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedNode")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("children", &self.children.len())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct NodeTree {
    nodes: Vec<ResolvedNode>,
    by_key: HashMap<ComponentKey, usize>,
    root: Option<usize>,
}

impl NodeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<usize> {
        self.root
    }

    pub fn node(&self, index: usize) -> &ResolvedNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, key: &ComponentKey) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    /// Arena indices of the resolved children of `index`, skipping pending ones.
    pub fn children(&self, index: usize) -> impl Iterator<Item = usize> + '_ {
        self.nodes[index].children.iter().filter_map(|slot| match slot {
            ChildSlot::Resolved(child) => Some(*child),
            ChildSlot::Pending { .. } => None,
        })
    }

    /// Number of children still waiting for expansion.
    pub fn pending_count(&self) -> usize {
        self.nodes
            .iter()
            .flat_map(|node| node.children.iter())
            .filter(|slot| matches!(slot, ChildSlot::Pending { .. }))
            .count()
    }

    /// Pre-order walk from the root yielding `(index, depth)`.
    pub fn preorder(&self) -> Vec<(usize, usize)> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, usize)> = self.root.into_iter().map(|root| (root, 0)).collect();
        while let Some((index, depth)) = stack.pop() {
            order.push((index, depth));
            let children: Vec<usize> = self.children(index).collect();
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }
        order
    }

    /// Indented outline of keys and node kinds, without node ids. Two
    /// passes over the same inputs produce the same outline.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (index, depth) in self.preorder() {
            let node = &self.nodes[index];
            let _ = writeln!(
                out,
                "{:indent$}{} {} ({})",
                "",
                node.key,
                node.kind.label(),
                node.component_type(),
                indent = depth * 2
            );
        }
        out
    }

    pub(crate) fn push(&mut self, node: ResolvedNode) -> usize {
        let index = self.nodes.len();
        self.by_key.insert(node.key.clone(), index);
        self.nodes.push(node);
        index
    }

    pub(crate) fn set_root(&mut self, index: usize) {
        self.root = Some(index);
    }

    pub(crate) fn node_mut(&mut self, index: usize) -> &mut ResolvedNode {
        &mut self.nodes[index]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ResolvedNode> + '_ {
        self.nodes.iter()
    }
}

impl fmt::Debug for NodeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTree")
            .field("nodes", &self.nodes.len())
            .field("root", &self.root)
            .finish()
    }
}
