//! Axis definitions for linear layouts.

use crate::{Constraints, Point, Size};

/// Identifies the primary direction for measuring and placing children.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    /// Horizontal main axis.
    Horizontal,
    /// Vertical main axis.
    Vertical,
}

impl Axis {
    pub fn is_horizontal(self) -> bool {
        matches!(self, Axis::Horizontal)
    }

    pub fn is_vertical(self) -> bool {
        matches!(self, Axis::Vertical)
    }

    pub fn main(self, size: Size) -> f32 {
        match self {
            Axis::Horizontal => size.width,
            Axis::Vertical => size.height,
        }
    }

    pub fn cross(self, size: Size) -> f32 {
        match self {
            Axis::Horizontal => size.height,
            Axis::Vertical => size.width,
        }
    }

    /// `(min, max)` of the constraints along this axis.
    pub fn main_bounds(self, constraints: &Constraints) -> (f32, f32) {
        match self {
            Axis::Horizontal => (constraints.min_width, constraints.max_width),
            Axis::Vertical => (constraints.min_height, constraints.max_height),
        }
    }

    pub fn cross_bounds(self, constraints: &Constraints) -> (f32, f32) {
        match self {
            Axis::Horizontal => (constraints.min_height, constraints.max_height),
            Axis::Vertical => (constraints.min_width, constraints.max_width),
        }
    }

    pub fn size(self, main: f32, cross: f32) -> Size {
        match self {
            Axis::Horizontal => Size::new(main, cross),
            Axis::Vertical => Size::new(cross, main),
        }
    }

    pub fn point(self, main: f32, cross: f32) -> Point {
        match self {
            Axis::Horizontal => Point::new(main, cross),
            Axis::Vertical => Point::new(cross, main),
        }
    }

    pub fn constraints(self, main: (f32, f32), cross: (f32, f32)) -> Constraints {
        match self {
            Axis::Horizontal => Constraints {
                min_width: main.0,
                max_width: main.1,
                min_height: cross.0,
                max_height: cross.1,
            },
            Axis::Vertical => Constraints {
                min_width: cross.0,
                max_width: cross.1,
                min_height: main.0,
                max_height: main.1,
            },
        }
    }
}
