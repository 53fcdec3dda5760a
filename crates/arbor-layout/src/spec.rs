//! Per-axis measure specs and the rule deciding when an earlier
//! measurement can stand in for a new one.

use crate::{Constraints, Size};

/// Sizes closer than this are treated as equal.
pub const SIZE_TOLERANCE: f32 = 0.0001;

fn same_size(a: f32, b: f32) -> bool {
    (a - b).abs() < SIZE_TOLERANCE || a == b
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MeasureMode {
    Exactly,
    AtMost,
    Unspecified,
}

/// A measurement request along one axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeasureSpec {
    mode: MeasureMode,
    size: f32,
}

impl MeasureSpec {
    pub fn exactly(size: f32) -> Self {
        Self {
            mode: MeasureMode::Exactly,
            size,
        }
    }

    pub fn at_most(size: f32) -> Self {
        Self {
            mode: MeasureMode::AtMost,
            size,
        }
    }

    pub fn unspecified() -> Self {
        Self {
            mode: MeasureMode::Unspecified,
            size: 0.0,
        }
    }

    pub fn mode(&self) -> MeasureMode {
        self.mode
    }

    /// The bound; meaningless for `Unspecified`.
    pub fn size(&self) -> f32 {
        self.size
    }

    /// Spec equivalent to a `[min, max]` range. A loose range keeps only
    /// its maximum, an infinite maximum becomes `Unspecified`.
    pub fn from_bounds(min: f32, max: f32) -> Self {
        if same_size(min, max) && max.is_finite() {
            Self::exactly(max)
        } else if max.is_finite() {
            Self::at_most(max)
        } else {
            Self::unspecified()
        }
    }

    pub fn bounds(&self) -> (f32, f32) {
        match self.mode {
            MeasureMode::Exactly => (self.size, self.size),
            MeasureMode::AtMost => (0.0, self.size),
            MeasureMode::Unspecified => (0.0, f32::INFINITY),
        }
    }

    /// The size a measurement wanting `desired` ends up with.
    pub fn resolve(&self, desired: f32) -> f32 {
        match self.mode {
            MeasureMode::Exactly => self.size,
            MeasureMode::AtMost => desired.min(self.size),
            MeasureMode::Unspecified => desired,
        }
    }

    /// Same mode and, where it matters, the same bound.
    pub fn is_same(&self, other: &MeasureSpec) -> bool {
        self.mode == other.mode
            && (self.mode == MeasureMode::Unspecified || same_size(self.size, other.size))
    }
}

/// Whether a measurement taken under `old` that produced `old_measured` is
/// still valid under `new`.
pub fn is_measure_spec_compatible(old: MeasureSpec, new: MeasureSpec, old_measured: f32) -> bool {
    if old.is_same(&new) {
        return true;
    }
    match (old.mode, new.mode) {
        (MeasureMode::Unspecified, MeasureMode::Unspecified) => true,
        (_, MeasureMode::Exactly) => same_size(new.size, old_measured),
        (MeasureMode::Unspecified, MeasureMode::AtMost) => new.size >= old_measured,
        (MeasureMode::AtMost, MeasureMode::AtMost) => {
            old.size > new.size && old_measured <= new.size
        }
        _ => false,
    }
}

/// Measure specs for both axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SizeSpecs {
    pub width: MeasureSpec,
    pub height: MeasureSpec,
}

impl SizeSpecs {
    pub fn new(width: MeasureSpec, height: MeasureSpec) -> Self {
        Self { width, height }
    }

    pub fn from_constraints(constraints: &Constraints) -> Self {
        Self {
            width: MeasureSpec::from_bounds(constraints.min_width, constraints.max_width),
            height: MeasureSpec::from_bounds(constraints.min_height, constraints.max_height),
        }
    }

    pub fn to_constraints(&self) -> Constraints {
        let (min_width, max_width) = self.width.bounds();
        let (min_height, max_height) = self.height.bounds();
        Constraints {
            min_width,
            max_width,
            min_height,
            max_height,
        }
    }

    pub fn resolve(&self, desired: Size) -> Size {
        Size::new(
            self.width.resolve(desired.width),
            self.height.resolve(desired.height),
        )
    }

    pub fn is_same(&self, other: &SizeSpecs) -> bool {
        self.width.is_same(&other.width) && self.height.is_same(&other.height)
    }

    /// Both axes must be compatible.
    pub fn is_compatible(&self, new: &SizeSpecs, measured: Size) -> bool {
        is_measure_spec_compatible(self.width, new.width, measured.width)
            && is_measure_spec_compatible(self.height, new.height, measured.height)
    }
}

#[cfg(test)]
#[path = "tests/spec_tests.rs"]
mod tests;
