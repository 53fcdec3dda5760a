//! Measure-policy contract consumed by the layout stage.
//!
//! A policy sizes a container from its children. The layout stage treats it
//! as a black box: it hands the policy a [`Measurables`] view of the
//! children and records whatever sizes and placements come back.

use crate::{Axis, Constraints, Size};

/// Children of the container being measured, addressed by index.
pub trait Measurables {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Measures child `index`. Measuring the same child twice replaces the
    /// earlier result.
    fn measure(&mut self, index: usize, constraints: Constraints) -> Size;
}

/// Offset of one child relative to its parent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub child: usize,
    pub x: f32,
    pub y: f32,
}

impl Placement {
    pub fn new(child: usize, x: f32, y: f32) -> Self {
        Self { child, x, y }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeasureResult {
    pub size: Size,
    pub placements: Vec<Placement>,
}

impl MeasureResult {
    pub fn new(size: Size, placements: Vec<Placement>) -> Self {
        Self { size, placements }
    }
}

pub trait MeasurePolicy: Send + Sync {
    fn measure(&self, children: &mut dyn Measurables, constraints: Constraints) -> MeasureResult;
}

impl<F> MeasurePolicy for F
where
    F: Fn(&mut dyn Measurables, Constraints) -> MeasureResult + Send + Sync,
{
    fn measure(&self, children: &mut dyn Measurables, constraints: Constraints) -> MeasureResult {
        self(children, constraints)
    }
}

/// Position of a child within the free space along one axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Alignment {
    #[default]
    Start,
    Center,
    End,
}

impl Alignment {
    pub fn offset(self, available: f32, size: f32) -> f32 {
        match self {
            Alignment::Start => 0.0,
            Alignment::Center => ((available - size) / 2.0).max(0.0),
            Alignment::End => (available - size).max(0.0),
        }
    }
}

/// Lays children out one after another along `axis`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearPolicy {
    pub axis: Axis,
    pub spacing: f32,
    pub cross_alignment: Alignment,
}

impl LinearPolicy {
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            spacing: 0.0,
            cross_alignment: Alignment::Start,
        }
    }

    pub fn column() -> Self {
        Self::new(Axis::Vertical)
    }

    pub fn row() -> Self {
        Self::new(Axis::Horizontal)
    }

    pub fn spaced_by(mut self, spacing: f32) -> Self {
        self.spacing = spacing.max(0.0);
        self
    }

    pub fn aligned(mut self, alignment: Alignment) -> Self {
        self.cross_alignment = alignment;
        self
    }
}

impl MeasurePolicy for LinearPolicy {
    fn measure(&self, children: &mut dyn Measurables, constraints: Constraints) -> MeasureResult {
        let axis = self.axis;
        let (main_min, main_max) = axis.main_bounds(&constraints);
        let (cross_min, cross_max) = axis.cross_bounds(&constraints);
        let count = children.len();

        let mut offsets = Vec::with_capacity(count);
        let mut sizes = Vec::with_capacity(count);
        let mut used = 0.0_f32;
        let mut max_cross = 0.0_f32;
        for index in 0..count {
            if index > 0 {
                used += self.spacing;
            }
            let remaining = (main_max - used).max(0.0);
            let size = children.measure(index, axis.constraints((0.0, remaining), (0.0, cross_max)));
            offsets.push(used);
            used += axis.main(size);
            max_cross = max_cross.max(axis.cross(size));
            sizes.push(size);
        }

        let main = used.clamp(main_min, main_max);
        let cross = max_cross.clamp(cross_min, cross_max);
        let placements = offsets
            .into_iter()
            .zip(sizes)
            .enumerate()
            .map(|(index, (offset, size))| {
                let cross_offset = self.cross_alignment.offset(cross, axis.cross(size));
                let point = axis.point(offset, cross_offset);
                Placement::new(index, point.x, point.y)
            })
            .collect();

        MeasureResult::new(axis.size(main, cross), placements)
    }
}

/// Stacks children on top of each other.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BoxPolicy {
    pub horizontal: Alignment,
    pub vertical: Alignment,
    pub propagate_min_constraints: bool,
}

impl BoxPolicy {
    pub fn new(horizontal: Alignment, vertical: Alignment) -> Self {
        Self {
            horizontal,
            vertical,
            propagate_min_constraints: false,
        }
    }
}

impl MeasurePolicy for BoxPolicy {
    fn measure(&self, children: &mut dyn Measurables, constraints: Constraints) -> MeasureResult {
        let child_constraints = if self.propagate_min_constraints {
            constraints
        } else {
            constraints.loosen()
        };

        let sizes: Vec<Size> = (0..children.len())
            .map(|index| children.measure(index, child_constraints))
            .collect();
        let max_width = sizes.iter().map(|s| s.width).fold(0.0, f32::max);
        let max_height = sizes.iter().map(|s| s.height).fold(0.0, f32::max);
        let (width, height) = constraints.constrain(max_width, max_height);

        let placements = sizes
            .iter()
            .enumerate()
            .map(|(index, size)| {
                Placement::new(
                    index,
                    self.horizontal.offset(width, size.width),
                    self.vertical.offset(height, size.height),
                )
            })
            .collect();

        MeasureResult::new(Size::new(width, height), placements)
    }
}

#[cfg(test)]
#[path = "tests/policy_tests.rs"]
mod tests;
