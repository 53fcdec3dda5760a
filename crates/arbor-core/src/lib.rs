#![doc = r"Core runtime pieces for the arbor tree engine: versioned tasks, result caches and component state."]

pub mod cache;
pub mod collections;
pub mod error;
pub mod key;
pub mod platform;
pub mod registry;
pub mod state;
pub mod task;

pub use cache::ResultCache;
pub use error::{EngineError, Result, ResumeRejection};
pub use key::{ComponentKey, NodeId, StateKey};
pub use platform::{InlineScheduler, Job, TaskScheduler};
pub use registry::{TaskHandle, TaskRegistry, VersionCounter};
pub use state::{
    CommitOutcome, Stage, StateContainer, StateHandler, StateStore, StateUpdate, StateValue,
    UpdateMode,
};
pub use task::{Calculation, Checkpoint, StageOutcome, TaskContext, TaskOutcome, VersionedTask};
