//! Terminal result of a task unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TaskStatus;
use crate::errors::TaskError;

/// Outcome of one task unit, produced exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// `completed` or `failed`.
    pub status: TaskStatus,
    /// Value returned by the work, if it completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    /// A completed result carrying `value`.
    #[must_use]
    pub fn completed(value: Value) -> Self {
        Self {
            status: TaskStatus::Completed,
            result: Some(value),
            error: None,
        }
    }

    /// A failed result carrying the error's display text.
    #[must_use]
    pub fn failed(error: &TaskError) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.to_string()),
        }
    }

    /// Returns true if the work completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Error text, or an empty string for completed results.
    #[must_use]
    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or_default()
    }
}
