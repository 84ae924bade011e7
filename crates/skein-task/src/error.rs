use std::fmt::Display;

/// A specialized error type for task-system operations.
///
/// Statuses are cloned when they fan out to multiple downstream consumers
/// (poisoned tasks, failed semaphores), so every variant carries only
/// cheaply clonable payloads.
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// An allocation could not be satisfied.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A caller-supplied argument was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The operation is not valid in the current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    /// A wait finished because its deadline passed, not because the waited
    /// condition was met.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Create a resource-exhausted error from a displayable value.
    pub fn resource_exhausted<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::ResourceExhausted(msg.to_string())
    }

    /// Create an invalid-argument error from a displayable value.
    pub fn invalid_argument<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidArgument(msg.to_string())
    }

    /// Create a failed-precondition error from a displayable value.
    pub fn failed_precondition<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::FailedPrecondition(msg.to_string())
    }

    /// Create an internal error from a displayable value.
    pub fn internal<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Internal(msg.to_string())
    }
}

/// A Result type alias for task-system operations.
pub type TaskResult<T> = Result<T, TaskError>;
