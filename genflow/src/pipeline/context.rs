//! Pipeline request and run context.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{GenflowError, Result};

/// Largest page count a request may ask for.
pub const MAX_PAGE_COUNT: usize = 64;

/// A request to generate one story book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    /// Requesting user.
    pub owner_id: String,
    /// Free-text story prompt.
    pub prompt: String,
    /// Number of pages to generate.
    pub page_count: usize,
    /// Optional illustration style hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl PipelineRequest {
    /// Creates a request without a style hint.
    #[must_use]
    pub fn new(owner_id: impl Into<String>, prompt: impl Into<String>, page_count: usize) -> Self {
        Self {
            owner_id: owner_id.into(),
            prompt: prompt.into(),
            page_count,
            style: None,
        }
    }

    /// Sets the style hint.
    #[must_use]
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Rejects empty prompts and out-of-range page counts.
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(GenflowError::Validation("owner_id must not be empty".to_string()));
        }
        if self.prompt.trim().is_empty() {
            return Err(GenflowError::Validation("prompt must not be empty".to_string()));
        }
        if self.page_count == 0 || self.page_count > MAX_PAGE_COUNT {
            return Err(GenflowError::Validation(format!(
                "page_count must be between 1 and {MAX_PAGE_COUNT}, got {}",
                self.page_count
            )));
        }
        Ok(())
    }
}

/// Identity of one pipeline run, shared read-only with every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Pipeline (and record) id.
    pub pipeline_id: String,
    /// Requesting user.
    pub owner_id: String,
    /// Id of this execution attempt.
    pub execution_id: String,
    /// How many times the pipeline has been re-run.
    pub retry_count: u32,
}

impl PipelineContext {
    /// Creates a context for an existing pipeline record.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            owner_id: owner_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            retry_count: 0,
        }
    }

    /// Sets the re-run counter.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}
