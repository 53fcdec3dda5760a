//! Layout contracts for the arbor tree engine: geometry, constraints, measure
//! specs and the measure policies containers delegate to.

mod axis;
mod constraints;
mod geometry;
mod policy;
mod spec;

pub use axis::Axis;
pub use constraints::Constraints;
pub use geometry::{Point, Rect, Size};
pub use policy::{
    Alignment, BoxPolicy, LinearPolicy, MeasurePolicy, MeasureResult, Measurables, Placement,
};
pub use spec::{is_measure_spec_compatible, MeasureMode, MeasureSpec, SizeSpecs, SIZE_TOLERANCE};

pub mod prelude {
    pub use crate::constraints::Constraints;
    pub use crate::geometry::{Point, Rect, Size};
    pub use crate::policy::{MeasurePolicy, MeasureResult, Measurables, Placement};
    pub use crate::spec::{MeasureSpec, SizeSpecs};
}
