//! Flattened outputs of a layout pass and the index used to mount only what
//! a viewport shows.

use arbor_core::{ComponentKey, NodeId};
use arbor_layout::{Point, Rect};
use indexmap::IndexMap;

use crate::layout::MeasuredNode;

/// One positioned node handed to the mount consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct MountableOutput {
    pub node_id: NodeId,
    pub key: ComponentKey,
    pub component_type: &'static str,
    /// Absolute bounds in root coordinates.
    pub bounds: Rect,
    pub depth: usize,
    /// Position in mount order.
    pub index: usize,
}

/// Walks `root` in pre-order and records every non-null node.
pub(crate) fn collect_outputs(root: &MeasuredNode) -> IndexMap<NodeId, MountableOutput> {
    let mut outputs = IndexMap::new();
    let mut stack = vec![(root, Point::ZERO, 0usize)];
    while let Some((node, origin, depth)) = stack.pop() {
        if !node.is_null() {
            let index = outputs.len();
            outputs.insert(
                node.node_id(),
                MountableOutput {
                    node_id: node.node_id(),
                    key: node.key().clone(),
                    component_type: node.component_type(),
                    bounds: Rect::from_origin_size(origin, node.size()),
                    depth,
                    index,
                },
            );
        }
        for (offset, child) in node.children().iter().rev() {
            stack.push((child.as_ref(), origin.offset(*offset), depth + 1));
        }
    }
    outputs
}

/// Cursor pair into the sorted edge lists for one viewport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountRange {
    /// Outputs whose top edge lies above the viewport bottom.
    pub top: usize,
    /// Outputs whose bottom edge lies at or above the viewport top.
    pub bottom: usize,
}

/// Outputs sorted by top and by bottom edge, so a scrolling viewport can
/// find the outputs entering and leaving it without a full scan.
#[derive(Clone, Debug, Default)]
pub struct IncrementalMountIndex {
    bounds: Vec<Rect>,
    by_top: Vec<usize>,
    by_bottom: Vec<usize>,
}

impl IncrementalMountIndex {
    pub(crate) fn new<'a>(outputs: impl IntoIterator<Item = &'a MountableOutput>) -> Self {
        let bounds: Vec<Rect> = outputs.into_iter().map(|output| output.bounds).collect();
        let mut by_top: Vec<usize> = (0..bounds.len()).collect();
        by_top.sort_by(|a, b| bounds[*a].top().total_cmp(&bounds[*b].top()).then(a.cmp(b)));
        let mut by_bottom: Vec<usize> = (0..bounds.len()).collect();
        by_bottom.sort_by(|a, b| {
            bounds[*a]
                .bottom()
                .total_cmp(&bounds[*b].bottom())
                .then(a.cmp(b))
        });
        Self {
            bounds,
            by_top,
            by_bottom,
        }
    }

    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    /// Output indices ordered by top edge.
    pub fn by_top(&self) -> &[usize] {
        &self.by_top
    }

    /// Output indices ordered by bottom edge.
    pub fn by_bottom(&self) -> &[usize] {
        &self.by_bottom
    }

    pub fn visible_range(&self, viewport: &Rect) -> MountRange {
        MountRange {
            top: self
                .by_top
                .partition_point(|index| self.bounds[*index].top() < viewport.bottom()),
            bottom: self
                .by_bottom
                .partition_point(|index| self.bounds[*index].bottom() <= viewport.top()),
        }
    }

    /// Indices of the outputs intersecting `viewport`, in mount order.
    pub fn visible_outputs(&self, viewport: &Rect) -> Vec<usize> {
        let range = self.visible_range(viewport);
        let mut visible: Vec<usize> = self.by_top[..range.top]
            .iter()
            .copied()
            .filter(|index| self.bounds[*index].intersects(viewport))
            .collect();
        visible.sort_unstable();
        visible
    }
}

#[cfg(test)]
#[path = "tests/mount_tests.rs"]
mod tests;
