use std::fmt;

use thiserror::Error;

/// Why a resume request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResumeRejection {
    /// The task was released; its partial state is gone.
    #[error("task was released")]
    Released,
    /// The task holds no partial result (never interrupted, or already finished).
    #[error("task holds no partial result")]
    NotPartial,
    /// Another caller is already running the task.
    #[error("task is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("task `{description}` reports equivalence inconsistently")]
    EquivalenceViolation { description: String },
    #[error("cannot resume task `{description}`: {reason}")]
    IllegalResume {
        description: String,
        reason: ResumeRejection,
    },
    #[error("state initializer for `{key}` failed: {message}")]
    InitializerFailure { key: String, message: String },
    #[error("task `{description}` was released")]
    TaskReleased { description: String },
    #[error("result cache is frozen and rejects writes")]
    CacheFrozen,
    #[error("state `{key}` does not hold a value of type {expected}")]
    StateTypeMismatch { key: String, expected: &'static str },
    #[error("component `{key}` failed: {message}")]
    Component { key: String, message: String },
    #[error("no root component has been set")]
    NoRoot,
}

impl EngineError {
    pub fn component(key: impl fmt::Display, message: impl fmt::Display) -> Self {
        EngineError::Component {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
