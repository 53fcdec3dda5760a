//! Component state shared between computations.
//!
//! Committed state is only replaced by [`StateStore::commit`]. Computations
//! work on a [`StateHandler`], a private copy with queued updates applied,
//! so an abandoned computation leaves nothing behind.

mod handler;
mod initial;
mod store;
mod update;

pub use handler::StateHandler;
pub use store::{CommitOutcome, Stage, StateStore};
pub use update::{StateContainer, StateUpdate, StateValue, UpdateMode};

#[cfg(test)]
#[path = "../tests/state_tests.rs"]
mod tests;
