#![doc = r"Resolve and layout stages of the arbor tree engine, and the engine that runs them."]

pub mod component;
pub mod engine;
pub mod layout;
pub mod mount;
pub mod node;
pub mod props;
pub mod resolve;
pub mod scope;

pub use component::{Component, Element, ElementId, EventHandler, MeasureFunction, Render};
pub use engine::{EngineConfig, EventContext, ListenerRegistration, RunMode, TreeEngine};
pub use layout::{LayoutCalculation, LayoutProgress, LayoutState, LayoutStats, MeasuredNode};
pub use mount::{IncrementalMountIndex, MountRange, MountableOutput};
pub use node::{ChildSlot, NodeKind, NodeTree, ResolvedNode};
pub use props::TreeProps;
pub use resolve::{ResolveCalculation, ResolveProgress, ResolveResult, ResolveStats};
pub use scope::{CachedMeasure, MeasureCache, MeasureScope, RenderScope, StateRead};

pub use arbor_core::{
    ComponentKey, EngineError, NodeId, Result, StateKey, StateUpdate, UpdateMode,
};
pub use arbor_layout::{
    Alignment, BoxPolicy, Constraints, LinearPolicy, MeasureSpec, Point, Rect, Size, SizeSpecs,
};

pub mod prelude {
    pub use crate::{
        Component, Constraints, Element, LinearPolicy, MeasureScope, Render, RenderScope, Result,
        RunMode, Size, SizeSpecs, StateUpdate, TreeEngine, UpdateMode,
    };
}
