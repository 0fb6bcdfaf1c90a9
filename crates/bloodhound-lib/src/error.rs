//! Error types for the aggregation engine

use thiserror::Error;

/// Errors raised while configuring or starting the engine
///
/// Alarm evaluation itself never fails; runtime edge cases such as unknown
/// keys have a non-error outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BloodhoundError {
    /// Interval, window or threshold settings are unusable
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// `start` was called twice; a stopped scheduler is not restarted
    #[error("aggregation scheduler has already been started")]
    AlreadyStarted,

    /// `start` was called outside of a tokio runtime
    #[error("aggregation scheduler requires a tokio runtime")]
    NoRuntime,
}

impl BloodhoundError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        BloodhoundError::InvalidConfiguration(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, BloodhoundError>;
