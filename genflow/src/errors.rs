//! Error types for the genflow engine.
//!
//! The taxonomy follows how failures travel through a pipeline run:
//! store errors are mostly swallowed at the handoff layer, task errors are
//! converted into terminal task results at the unit boundary, and retry
//! errors wrap the last underlying failure once a budget is spent.

use thiserror::Error;

/// The main error type for genflow operations.
#[derive(Debug, Error)]
pub enum GenflowError {
    /// A handoff store error that could not be degraded.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request or registration failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A task id was not registered with the runner.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// A registration named a dependency that does not exist yet.
    #[error("Task '{task}' depends on unregistered task '{dependency}'")]
    UnknownDependency {
        /// The task being registered.
        task: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The engine is shutting down.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by a handoff store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached at all.
    #[error("Store connection failed: {0}")]
    Connection(String),

    /// A single operation failed after the connection was established.
    #[error("Store operation '{operation}' failed for '{key}': {message}")]
    Backend {
        /// Operation name (`set`, `get`, `scan`, ...).
        operation: &'static str,
        /// Key or pattern involved.
        key: String,
        /// Backend message.
        message: String,
    },

    /// A value could not be encoded for storage.
    #[error("Failed to encode value for '{key}': {message}")]
    Encode {
        /// Target key.
        key: String,
        /// Encoder message.
        message: String,
    },
}

impl StoreError {
    /// Creates a backend error.
    pub fn backend(operation: &'static str, key: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }
}

/// Failure of a single task unit.
///
/// Every variant ends up as the `error` text of a failed
/// [`TaskResult`](crate::dag::TaskResult).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The work function returned an error.
    #[error("{0}")]
    Failed(String),

    /// A declared dependency did not complete.
    #[error("dependency '{dependency}' failed: {reason}")]
    DependencyFailed {
        /// Name of the failed dependency.
        dependency: String,
        /// Its error text.
        reason: String,
    },

    /// The unit was cancelled by engine shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The work function panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Creates a plain failure.
    pub fn failed(message: impl ToString) -> Self {
        Self::Failed(message.to_string())
    }

    /// Returns true if this error short-circuited on a dependency.
    #[must_use]
    pub fn is_dependency_failure(&self) -> bool {
        matches!(self, Self::DependencyFailed { .. })
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

impl From<GenflowError> for TaskError {
    fn from(err: GenflowError) -> Self {
        match err {
            GenflowError::Cancelled(reason) => Self::Cancelled(reason),
            other => Self::Failed(other.to_string()),
        }
    }
}

/// Error returned by [`retry_with_backoff`](crate::retry::retry_with_backoff).
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Label of the retried operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The final underlying error.
        last_error: E,
    },
}

impl<E> RetryError<E> {
    /// Returns the last underlying error.
    pub fn into_last_error(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
        }
    }

    /// Returns the number of attempts that were made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = GenflowError> = std::result::Result<T, E>;
