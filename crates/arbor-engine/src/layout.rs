//! Layout stage: measures and positions a resolved tree.
//!
//! A pass runs in two phases. The conversion walk mirrors the resolved tree
//! into layout nodes and pairs each with its diff node from the previous
//! layout (same position, same component type); it checks for interrupts
//! between nodes. Measurement then runs the container policies and leaf
//! measure functions, reusing previous subtrees and cached leaf sizes when
//! the new specs are compatible with the old measurement.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use arbor_core::{
    Calculation, Checkpoint, ComponentKey, EngineError, NodeId, Result, Stage, StageOutcome,
    StateHandler, StateStore, TaskContext,
};
use arbor_layout::{Constraints, MeasureSpec, Measurables, Point, Size, SizeSpecs};
use indexmap::IndexMap;
use log::{debug, trace};

use crate::component::{ElementId, MeasureFunction};
use crate::mount::{collect_outputs, IncrementalMountIndex, MountableOutput};
use crate::node::{NodeKind, NodeTree, ResolvedNode};
use crate::resolve::ResolveResult;
use crate::scope::{CachedMeasure, MeasureCache, MeasureScope, StateRead};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LayoutStats {
    /// Leaf measure functions invoked.
    pub measured: usize,
    pub cache_hits: usize,
    /// Subtrees taken over from the previous layout.
    pub reused: usize,
    pub interruptions: usize,
}

/// Geometry of one node, relative to its parent.
pub struct MeasuredNode {
    node_id: NodeId,
    key: ComponentKey,
    component_type: &'static str,
    element_id: ElementId,
    specs: SizeSpecs,
    size: Size,
    state_reads: Vec<StateRead>,
    children: Vec<(Point, Arc<MeasuredNode>)>,
    is_null: bool,
}

impl MeasuredNode {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn key(&self) -> &ComponentKey {
        &self.key
    }

    pub fn component_type(&self) -> &'static str {
        self.component_type
    }

    pub fn element_id(&self) -> ElementId {
        self.element_id
    }

    pub fn specs(&self) -> SizeSpecs {
        self.specs
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn state_reads(&self) -> &[StateRead] {
        &self.state_reads
    }

    /// Children with their offsets inside this node.
    pub fn children(&self) -> &[(Point, Arc<MeasuredNode>)] {
        &self.children
    }

    /// Placeholder for a component that rendered nothing.
    pub fn is_null(&self) -> bool {
        self.is_null
    }

    fn reads_unchanged(&self, state: &StateHandler) -> bool {
        self.state_reads
            .iter()
            .all(|read| state.revision(&read.key) == Some(read.revision))
            && self
                .children
                .iter()
                .all(|(_, child)| child.reads_unchanged(state))
    }

    fn mark_reads(&self, state: &mut StateHandler) {
        for read in &self.state_reads {
            state.mark_used(&read.key);
        }
        for (_, child) in &self.children {
            child.mark_reads(state);
        }
    }

    fn count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(|(_, child)| child.count())
            .sum::<usize>()
    }
}

impl fmt::Debug for MeasuredNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasuredNode")
            .field("node_id", &self.node_id)
            .field("key", &self.key)
            .field("size", &self.size)
            .field("children", &self.children.len())
            .finish()
    }
}

pub struct LayoutCalculation {
    description: String,
    resolve: Arc<ResolveResult>,
    constraints: Constraints,
    state_seq: u64,
    previous: Option<Arc<LayoutState>>,
    store: StateStore,
    reuse: bool,
}

impl LayoutCalculation {
    pub(crate) fn new(
        resolve: Arc<ResolveResult>,
        constraints: Constraints,
        store: StateStore,
        previous: Option<Arc<LayoutState>>,
        reuse: bool,
    ) -> Self {
        Self {
            description: format!("layout of resolve v{}", resolve.version()),
            state_seq: store.latest_update_seq(),
            resolve,
            constraints,
            previous,
            store,
            reuse,
        }
    }

    fn convert(
        &self,
        ctx: &TaskContext,
        mut progress: LayoutProgress,
    ) -> Result<StageOutcome<LayoutState, LayoutProgress>> {
        let tree = self.resolve.tree();
        while let Some(pending) = progress.stack.pop() {
            match ctx.checkpoint() {
                Checkpoint::Continue => {}
                Checkpoint::Interrupt => {
                    progress.stack.push(pending);
                    progress.stats.interruptions += 1;
                    debug!(
                        "{} interrupted after {} conversions",
                        self.description,
                        progress.nodes.len()
                    );
                    return Ok(StageOutcome::Partial(progress));
                }
                Checkpoint::Abort => return Ok(StageOutcome::Aborted),
            }

            let index = progress.nodes.len();
            let resolved_children: Vec<usize> = tree.children(pending.resolved).collect();
            progress.nodes.push(LayoutNode {
                resolved: pending.resolved,
                children: Vec::with_capacity(resolved_children.len()),
                diff: pending.diff.clone(),
            });
            if let Some(parent) = pending.parent {
                progress.nodes[parent].children.push(index);
            }
            // Reversed so the stack pops children in order.
            for (position, child) in resolved_children.into_iter().enumerate().rev() {
                let diff = pending
                    .diff
                    .as_ref()
                    .and_then(|diff| diff.children.get(position))
                    .map(|(_, node)| node)
                    .filter(|node| node.component_type == tree.node(child).component_type())
                    .cloned();
                progress.stack.push(PendingConversion {
                    resolved: child,
                    diff,
                    parent: Some(index),
                });
            }
        }

        let LayoutProgress {
            nodes,
            state,
            cache,
            stats,
            ..
        } = progress;
        let mut pass = MeasurePass {
            ctx,
            tree,
            reuse: self.reuse,
            nodes,
            state,
            cache,
            stats,
        };
        let specs = SizeSpecs::from_constraints(&self.constraints);
        let root = match pass.measure(0, specs) {
            Ok(root) => root,
            Err(EngineError::TaskReleased { .. }) if ctx.is_released() => {
                debug!("{} abandoned while measuring", self.description);
                return Ok(StageOutcome::Aborted);
            }
            Err(error) => return Err(error),
        };
        Ok(StageOutcome::Complete(self.finish(ctx, root, pass)))
    }

    fn finish(&self, ctx: &TaskContext, root: Arc<MeasuredNode>, pass: MeasurePass<'_>) -> LayoutState {
        let MeasurePass {
            state,
            mut cache,
            stats,
            ..
        } = pass;
        cache.freeze();
        let outputs = collect_outputs(&root);
        let mount_index = IncrementalMountIndex::new(outputs.values());
        debug!(
            "{} (v{}) complete: {}x{}, {} outputs, {} measured, {} cache hits, {} reused",
            self.description,
            ctx.version(),
            root.size.width,
            root.size.height,
            outputs.len(),
            stats.measured,
            stats.cache_hits,
            stats.reused
        );
        LayoutState {
            version: ctx.version(),
            resolve: Arc::clone(&self.resolve),
            constraints: self.constraints,
            root,
            outputs,
            mount_index,
            state: Mutex::new(Some(state)),
            cache: Arc::new(cache),
            stats,
        }
    }
}

impl Calculation for LayoutCalculation {
    type Output = LayoutState;
    type Resume = LayoutProgress;

    fn description(&self) -> &str {
        &self.description
    }

    fn is_equivalent_to(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.resolve, &other.resolve)
            && self.constraints == other.constraints
            && self.state_seq == other.state_seq
    }

    fn calculate(&self, ctx: &TaskContext) -> Result<StageOutcome<LayoutState, LayoutProgress>> {
        let Some(root) = self.resolve.tree().root() else {
            return Err(EngineError::NoRoot);
        };
        let diff = self
            .previous
            .as_ref()
            .map(|previous| Arc::clone(&previous.root))
            .filter(|node| node.component_type == self.resolve.tree().node(root).component_type());
        let progress = LayoutProgress {
            nodes: Vec::with_capacity(self.resolve.tree().len()),
            stack: vec![PendingConversion {
                resolved: root,
                diff,
                parent: None,
            }],
            state: self.store.create_handler(Stage::Layout),
            cache: MeasureCache::with_delegate(Arc::clone(self.resolve.cache())),
            stats: LayoutStats::default(),
        };
        self.convert(ctx, progress)
    }

    fn resume(
        &self,
        ctx: &TaskContext,
        partial: LayoutProgress,
    ) -> Result<StageOutcome<LayoutState, LayoutProgress>> {
        self.convert(ctx, partial)
    }
}

impl fmt::Debug for LayoutCalculation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutCalculation")
            .field("resolve", &self.resolve.version())
            .field("constraints", &self.constraints)
            .finish()
    }
}

struct PendingConversion {
    resolved: usize,
    diff: Option<Arc<MeasuredNode>>,
    parent: Option<usize>,
}

struct LayoutNode {
    resolved: usize,
    children: Vec<usize>,
    diff: Option<Arc<MeasuredNode>>,
}

/// Conversion state of an interrupted layout pass.
pub struct LayoutProgress {
    nodes: Vec<LayoutNode>,
    stack: Vec<PendingConversion>,
    state: StateHandler,
    cache: MeasureCache,
    stats: LayoutStats,
}

impl LayoutProgress {
    /// Layout nodes built so far.
    pub fn converted(&self) -> usize {
        self.nodes.len()
    }
}

struct MeasurePass<'a> {
    ctx: &'a TaskContext,
    tree: &'a NodeTree,
    reuse: bool,
    nodes: Vec<LayoutNode>,
    state: StateHandler,
    cache: MeasureCache,
    stats: LayoutStats,
}

impl<'a> MeasurePass<'a> {
    fn measure(&mut self, index: usize, specs: SizeSpecs) -> Result<Arc<MeasuredNode>> {
        if self.ctx.is_released() {
            return Err(EngineError::TaskReleased {
                description: "layout".to_string(),
            });
        }
        let tree = self.tree;
        let resolved = tree.node(self.nodes[index].resolved);

        if let Some(diff) = self.reusable_diff(index, specs) {
            trace!("reusing measured subtree of {}", resolved.key());
            diff.mark_reads(&mut self.state);
            self.stats.reused += diff.count();
            return Ok(diff);
        }

        let (size, state_reads, children) = match resolved.kind() {
            NodeKind::Null => (Size::ZERO, Vec::new(), Vec::new()),
            NodeKind::Leaf(measure) => {
                let (size, reads) = self.measure_leaf(resolved, measure.as_ref(), specs)?;
                (size, reads, Vec::new())
            }
            NodeKind::Container(policy) => {
                let children = self.nodes[index].children.clone();
                let mut measurer = ChildMeasurer {
                    pass: self,
                    children: &children,
                    measured: vec![None; children.len()],
                    error: None,
                };
                let result = policy.measure(&mut measurer, specs.to_constraints());
                let ChildMeasurer {
                    mut measured,
                    error,
                    ..
                } = measurer;
                if let Some(error) = error {
                    return Err(error);
                }

                let mut offsets = vec![Point::ZERO; children.len()];
                for placement in result.placements {
                    if let Some(offset) = offsets.get_mut(placement.child) {
                        *offset = Point::new(placement.x, placement.y);
                    }
                }
                let mut placed = Vec::with_capacity(children.len());
                for (position, child) in children.iter().enumerate() {
                    let node = match measured[position].take() {
                        Some(node) => node,
                        // Children the policy skipped still take part, with no space.
                        None => self.measure(
                            *child,
                            SizeSpecs::new(MeasureSpec::exactly(0.0), MeasureSpec::exactly(0.0)),
                        )?,
                    };
                    placed.push((offsets[position], node));
                }
                (result.size, Vec::new(), placed)
            }
        };

        let is_null = matches!(resolved.kind(), NodeKind::Null);
        Ok(Arc::new(MeasuredNode {
            node_id: resolved.id(),
            key: resolved.key().clone(),
            component_type: resolved.component_type(),
            element_id: resolved.element().id(),
            specs,
            // Null nodes hold a position only, whatever the specs demand.
            size: if is_null { Size::ZERO } else { specs.resolve(size) },
            state_reads,
            children,
            is_null,
        }))
    }

    fn reusable_diff(&self, index: usize, specs: SizeSpecs) -> Option<Arc<MeasuredNode>> {
        if !self.reuse {
            return None;
        }
        let node = &self.nodes[index];
        let diff = node.diff.as_ref()?;
        let resolved = self.tree.node(node.resolved);
        let reusable = diff.node_id == resolved.id()
            && diff.specs.is_compatible(&specs, diff.size)
            && diff.reads_unchanged(&self.state);
        reusable.then(|| Arc::clone(diff))
    }

    fn measure_leaf(
        &mut self,
        resolved: &ResolvedNode,
        measure: &dyn MeasureFunction,
        specs: SizeSpecs,
    ) -> Result<(Size, Vec<StateRead>)> {
        let id = resolved.id();
        if let Some(cached) = self.cache.get_for_node(id) {
            let fresh = cached
                .reads
                .iter()
                .all(|read| self.state.revision(&read.key) == Some(read.revision));
            if cached.element_id == resolved.element().id()
                && cached.specs.is_compatible(&specs, cached.size)
                && fresh
            {
                trace!("measure cache hit for {}", resolved.key());
                let (size, reads) = (cached.size, cached.reads.clone());
                for read in &reads {
                    self.state.mark_used(&read.key);
                }
                self.stats.cache_hits += 1;
                return Ok((size, reads));
            }
        }

        let mut scope = MeasureScope::new(resolved.key(), &mut self.state);
        let size = specs.resolve(measure.measure(&mut scope, specs)?);
        let reads = scope.into_reads();
        self.stats.measured += 1;
        self.cache.put_for_node(
            id,
            CachedMeasure {
                element_id: resolved.element().id(),
                specs,
                size,
                reads: reads.clone(),
            },
        )?;
        Ok((size, reads))
    }
}

/// The children of one container as the policy sees them. The first
/// failure is kept and later requests answer with a zero size.
struct ChildMeasurer<'p, 'a> {
    pass: &'p mut MeasurePass<'a>,
    children: &'p [usize],
    measured: Vec<Option<Arc<MeasuredNode>>>,
    error: Option<EngineError>,
}

impl Measurables for ChildMeasurer<'_, '_> {
    fn len(&self) -> usize {
        self.children.len()
    }

    fn measure(&mut self, index: usize, constraints: Constraints) -> Size {
        if self.error.is_some() {
            return Size::ZERO;
        }
        let Some(&child) = self.children.get(index) else {
            self.error = Some(EngineError::Component {
                key: "layout".to_string(),
                message: format!("policy measured child {index} of {}", self.children.len()),
            });
            return Size::ZERO;
        };
        match self.pass.measure(child, SizeSpecs::from_constraints(&constraints)) {
            Ok(node) => {
                let size = node.size;
                self.measured[index] = Some(node);
                size
            }
            Err(error) => {
                self.error = Some(error);
                Size::ZERO
            }
        }
    }
}

/// A completed layout pass, ready to mount.
pub struct LayoutState {
    version: u64,
    resolve: Arc<ResolveResult>,
    constraints: Constraints,
    root: Arc<MeasuredNode>,
    outputs: IndexMap<NodeId, MountableOutput>,
    mount_index: IncrementalMountIndex,
    state: Mutex<Option<StateHandler>>,
    cache: Arc<MeasureCache>,
    stats: LayoutStats,
}

impl LayoutState {
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The resolve pass whose nodes this layout measured.
    pub fn resolve(&self) -> &Arc<ResolveResult> {
        &self.resolve
    }

    pub fn constraints(&self) -> Constraints {
        self.constraints
    }

    pub fn root(&self) -> &Arc<MeasuredNode> {
        &self.root
    }

    pub fn size(&self) -> Size {
        self.root.size
    }

    /// Mountable outputs in tree order.
    pub fn outputs(&self) -> impl Iterator<Item = &MountableOutput> + '_ {
        self.outputs.values()
    }

    pub fn output(&self, id: NodeId) -> Option<&MountableOutput> {
        self.outputs.get(&id)
    }

    pub fn output_for_key(&self, key: &ComponentKey) -> Option<&MountableOutput> {
        self.outputs.values().find(|output| &output.key == key)
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn mount_index(&self) -> &IncrementalMountIndex {
        &self.mount_index
    }

    pub fn cache(&self) -> &Arc<MeasureCache> {
        &self.cache
    }

    pub fn stats(&self) -> LayoutStats {
        self.stats
    }

    pub(crate) fn take_state(&self) -> Option<StateHandler> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for LayoutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutState")
            .field("version", &self.version)
            .field("resolve", &self.resolve.version())
            .field("size", &self.root.size)
            .field("outputs", &self.outputs.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/layout_tests.rs"]
mod tests;
