//! Resolve stage: expands the element tree into a [`NodeTree`].
//!
//! Expansion is depth first and driven by an explicit stack so it can stop
//! at any child boundary. An interrupted pass hands back the half-built
//! arena, the stack and its private state handler; resuming continues with
//! the first child that was not expanded yet.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arbor_core::collections::map::{HashMap, HashSet};
use arbor_core::{
    Calculation, Checkpoint, ComponentKey, EngineError, NodeId, Result, Stage, StageOutcome,
    StateHandler, StateStore, TaskContext,
};
use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::component::{Element, EventHandler, Render};
use crate::node::{ChildSlot, NodeKind, NodeTree, ResolvedNode};
use crate::props::TreeProps;
use crate::scope::{MeasureCache, RenderScope};

/// Frozen cache left behind by a failed pass, consulted by the next one.
pub(crate) type Salvage = Arc<Mutex<Option<Arc<MeasureCache>>>>;

pub(crate) fn lock_salvage(salvage: &Salvage) -> MutexGuard<'_, Option<Arc<MeasureCache>>> {
    salvage.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// Components whose `render` ran.
    pub rendered: usize,
    /// Nodes copied from the previous tree.
    pub reused: usize,
    pub interruptions: usize,
}

pub struct ResolveCalculation {
    description: String,
    root: Element,
    props: TreeProps,
    state_seq: u64,
    store: StateStore,
    previous: Option<Arc<ResolveResult>>,
    salvage: Salvage,
    reconcile: bool,
}

impl ResolveCalculation {
    pub(crate) fn new(
        root: Element,
        props: TreeProps,
        store: StateStore,
        previous: Option<Arc<ResolveResult>>,
        salvage: Salvage,
        reconcile: bool,
    ) -> Self {
        Self {
            description: format!("resolve {}", root.type_name()),
            state_seq: store.latest_update_seq(),
            root,
            props,
            store,
            previous,
            salvage,
            reconcile,
        }
    }

    fn drive(
        &self,
        ctx: &TaskContext,
        mut progress: ResolveProgress,
    ) -> Result<StageOutcome<ResolveResult, ResolveProgress>> {
        while let Some(frame) = progress.stack.last_mut() {
            let node = frame.node;
            let next = frame.next_child;
            if next >= progress.tree.node(node).children.len() {
                progress.stack.pop();
                continue;
            }
            match ctx.checkpoint() {
                Checkpoint::Continue => {}
                Checkpoint::Interrupt => {
                    progress.stats.interruptions += 1;
                    debug!(
                        "{} interrupted with {} nodes resolved",
                        self.description,
                        progress.tree.len()
                    );
                    return Ok(StageOutcome::Partial(progress));
                }
                Checkpoint::Abort => {
                    debug!("{} abandoned", self.description);
                    return Ok(StageOutcome::Aborted);
                }
            }
            if let Some(frame) = progress.stack.last_mut() {
                frame.next_child += 1;
            }
            let (element, key) = match &progress.tree.node(node).children[next] {
                ChildSlot::Pending { element, key } => (element.clone(), key.clone()),
                ChildSlot::Resolved(_) => continue,
            };
            match self.expand(&mut progress, element, key) {
                Ok(child) => progress.tree.node_mut(node).children[next] = ChildSlot::Resolved(child),
                Err(error) => return Err(self.salvage(ctx, progress, error)),
            }
        }
        Ok(StageOutcome::Complete(self.finish(ctx, progress)))
    }

    fn expand(
        &self,
        progress: &mut ResolveProgress,
        element: Element,
        key: ComponentKey,
    ) -> Result<usize> {
        if let Some(index) = self.reuse(progress, &element, &key) {
            return Ok(index);
        }

        let (render, reads, handlers) = {
            let mut scope = RenderScope::new(
                &key,
                &mut progress.state,
                &self.store,
                &mut progress.cache,
                &self.props,
            );
            let render = element.component().render(&mut scope)?;
            let (reads, handlers) = scope.finish();
            (render, reads, handlers)
        };
        progress.stats.rendered += 1;

        let id = NodeId::next();
        let (kind, children) = match render {
            Render::Children { policy, children } => {
                let keys = child_keys(&key, &children);
                let slots = children
                    .into_iter()
                    .zip(keys)
                    .map(|(element, key)| ChildSlot::Pending { element, key })
                    .collect();
                (NodeKind::Container(policy), slots)
            }
            Render::Leaf(measure) => {
                if progress.cache.link_node(&key, id)? {
                    trace!("{key} carries a measurement taken while resolving");
                }
                (NodeKind::Leaf(measure), Vec::new())
            }
            Render::Nothing => (NodeKind::Null, Vec::new()),
        };
        let expands = !children.is_empty();
        let index = progress.tree.push(ResolvedNode {
            id,
            key,
            element,
            kind,
            children,
            reads,
            handlers,
        });
        if expands {
            progress.stack.push(Frame {
                node: index,
                next_child: 0,
            });
        }
        Ok(index)
    }

    /// Copies the previous subtree at `key` when it was built from the same
    /// element and none of the state it read has changed since.
    fn reuse(
        &self,
        progress: &mut ResolveProgress,
        element: &Element,
        key: &ComponentKey,
    ) -> Option<usize> {
        if !self.reconcile {
            return None;
        }
        let previous = self.previous.as_deref()?;
        if !previous.props.same(&self.props) {
            return None;
        }
        let prev_index = previous.tree.find(key)?;
        if !previous.tree.node(prev_index).element.same(element) {
            return None;
        }
        let unchanged = subtree(&previous.tree, prev_index).into_iter().all(|index| {
            previous
                .tree
                .node(index)
                .reads
                .iter()
                .all(|read| progress.state.revision(&read.key) == Some(read.revision))
        });
        if !unchanged {
            return None;
        }
        trace!("reusing resolved subtree at {key}");
        Some(copy_subtree(&previous.tree, prev_index, progress))
    }

    fn salvage(&self, ctx: &TaskContext, progress: ResolveProgress, error: EngineError) -> EngineError {
        if ctx.is_released() {
            // A newer pass owns the salvage slot now.
            debug!("{} failed after release: {error}", self.description);
            return error;
        }
        let mut cache = progress.cache.flattened();
        if !cache.is_empty() {
            cache.freeze();
            debug!(
                "{} failed, keeping {} cached measurements: {error}",
                self.description,
                cache.len()
            );
            *lock_salvage(&self.salvage) = Some(Arc::new(cache));
        }
        error
    }

    fn finish(&self, ctx: &TaskContext, mut progress: ResolveProgress) -> ResolveResult {
        progress.cache.freeze();
        let mut handlers = IndexMap::new();
        for (index, _) in progress.tree.preorder() {
            let node = progress.tree.node(index);
            for (name, handler) in &node.handlers {
                handlers.insert((node.key.clone(), name.clone()), Arc::clone(handler));
            }
        }
        debug!(
            "{} (v{}) complete: {} nodes, {} rendered, {} reused",
            self.description,
            ctx.version(),
            progress.tree.len(),
            progress.stats.rendered,
            progress.stats.reused
        );
        ResolveResult {
            version: ctx.version(),
            tree: progress.tree,
            state: Mutex::new(Some(progress.state)),
            cache: Arc::new(progress.cache),
            handlers,
            root: self.root.clone(),
            props: self.props.clone(),
            stats: progress.stats,
        }
    }
}

impl Calculation for ResolveCalculation {
    type Output = ResolveResult;
    type Resume = ResolveProgress;

    fn description(&self) -> &str {
        &self.description
    }

    fn is_equivalent_to(&self, other: &Self) -> bool {
        self.root.same(&other.root)
            && self.props.same(&other.props)
            && self.state_seq == other.state_seq
    }

    fn calculate(&self, ctx: &TaskContext) -> Result<StageOutcome<ResolveResult, ResolveProgress>> {
        let cache = match lock_salvage(&self.salvage).clone() {
            Some(salvaged) => MeasureCache::with_delegate(salvaged),
            None => MeasureCache::new(),
        };
        let mut progress = ResolveProgress {
            tree: NodeTree::new(),
            stack: Vec::new(),
            state: self.store.create_handler(Stage::Resolve),
            cache,
            stats: ResolveStats::default(),
        };
        match self.expand(&mut progress, self.root.clone(), ComponentKey::new("root")) {
            Ok(root) => progress.tree.set_root(root),
            Err(error) => return Err(self.salvage(ctx, progress, error)),
        }
        self.drive(ctx, progress)
    }

    fn resume(
        &self,
        ctx: &TaskContext,
        partial: ResolveProgress,
    ) -> Result<StageOutcome<ResolveResult, ResolveProgress>> {
        self.drive(ctx, partial)
    }
}

impl fmt::Debug for ResolveCalculation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveCalculation")
            .field("root", &self.root)
            .field("state_seq", &self.state_seq)
            .finish()
    }
}

struct Frame {
    node: usize,
    next_child: usize,
}

/// Everything an interrupted resolve pass needs to continue.
pub struct ResolveProgress {
    tree: NodeTree,
    stack: Vec<Frame>,
    state: StateHandler,
    cache: MeasureCache,
    stats: ResolveStats,
}

impl ResolveProgress {
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }
}

/// A completed resolve pass.
pub struct ResolveResult {
    version: u64,
    tree: NodeTree,
    state: Mutex<Option<StateHandler>>,
    cache: Arc<MeasureCache>,
    handlers: IndexMap<(ComponentKey, String), EventHandler>,
    root: Element,
    props: TreeProps,
    stats: ResolveStats,
}

impl ResolveResult {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// Frozen measurements taken while resolving.
    pub fn cache(&self) -> &Arc<MeasureCache> {
        &self.cache
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn props(&self) -> &TreeProps {
        &self.props
    }

    pub fn stats(&self) -> ResolveStats {
        self.stats
    }

    pub fn handler(&self, key: &ComponentKey, name: &str) -> Option<EventHandler> {
        self.handlers
            .get(&(key.clone(), name.to_string()))
            .map(Arc::clone)
    }

    /// Registered `(component, event)` pairs in tree order.
    pub fn handler_keys(&self) -> impl Iterator<Item = &(ComponentKey, String)> + '_ {
        self.handlers.keys()
    }

    /// The working copy of state this pass used, until it is committed.
    pub(crate) fn take_state(&self) -> Option<StateHandler> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for ResolveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolveResult")
            .field("version", &self.version)
            .field("tree", &self.tree)
            .field("handlers", &self.handlers.len())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Keys for the children of `parent`: explicit keys become path segments
/// as-is, unkeyed children are numbered per component type.
pub(crate) fn child_keys(parent: &ComponentKey, children: &[Element]) -> Vec<ComponentKey> {
    let mut per_type: HashMap<&'static str, usize> = HashMap::default();
    let mut seen: HashSet<ComponentKey> = HashSet::default();
    children
        .iter()
        .map(|child| {
            let segment = match child.key() {
                Some(key) => key.to_string(),
                None => {
                    let count = per_type.entry(child.type_name()).or_insert(0);
                    let segment = format!("{}[{}]", child.type_name(), count);
                    *count += 1;
                    segment
                }
            };
            let mut key = parent.child(&segment);
            let mut duplicate = 1;
            while !seen.insert(key.clone()) {
                warn!("duplicate child key {key}; state may move between siblings");
                key = parent.child(&format!("{segment}~{duplicate}"));
                duplicate += 1;
            }
            key
        })
        .collect()
}

fn subtree(tree: &NodeTree, index: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = vec![index];
    while let Some(index) = stack.pop() {
        out.push(index);
        stack.extend(tree.children(index));
    }
    out
}

fn copy_subtree(source: &NodeTree, index: usize, progress: &mut ResolveProgress) -> usize {
    let node = source.node(index);
    for read in &node.reads {
        progress.state.mark_used(&read.key);
    }
    let children: Vec<usize> = source.children(index).collect();
    let copied = children
        .into_iter()
        .map(|child| ChildSlot::Resolved(copy_subtree(source, child, progress)))
        .collect();
    progress.stats.reused += 1;
    let mut copy = node.clone();
    copy.children = copied;
    progress.tree.push(copy)
}

#[cfg(test)]
#[path = "tests/resolve_tests.rs"]
mod tests;
