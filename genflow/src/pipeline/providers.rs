//! External generation providers.
//!
//! Every provider is a trait object chosen once at construction and bundled
//! in [`GenerationProviders`]. Providers report failures as `anyhow` errors;
//! the stages decide whether a failure is retried, recorded per item, or
//! fatal for the stage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Produces a structured story from a prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoryGenerator: Send + Sync {
    /// Generates a story matching `schema` (a JSON Schema document).
    async fn generate(&self, prompt: &str, schema: &Value) -> anyhow::Result<Value>;
}

/// Produces one binary item (an image or an audio clip) per call.
#[async_trait]
pub trait ItemGenerator: Send + Sync {
    /// Generates an item. The same seed and prompt should give the same item.
    async fn generate_item(&self, seed: u64, prompt: &str) -> anyhow::Result<Vec<u8>>;

    /// MIME type of generated items.
    fn content_type(&self) -> &str;

    /// File extension used for artifact keys.
    fn extension(&self) -> &str;
}

/// Input for an asynchronous generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// URL of the source artifact (for video, the page image).
    pub source_url: String,
    /// Text prompt.
    pub prompt: String,
    /// Deterministic seed.
    pub seed: u64,
}

/// Provider-side state of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not started.
    Pending,
    /// Running.
    Processing,
    /// Output ready to fetch.
    Completed,
    /// The provider gave up.
    Failed {
        /// Provider's reason.
        reason: String,
    },
}

/// A provider whose generations are submitted, polled, then fetched.
#[async_trait]
pub trait JobGenerator: Send + Sync {
    /// Submits a job and returns the provider's job id.
    async fn submit(&self, request: &JobRequest) -> anyhow::Result<String>;

    /// Reports the state of a job.
    async fn check_status(&self, job_id: &str) -> anyhow::Result<JobState>;

    /// Downloads the output of a completed job.
    async fn fetch(&self, job_id: &str) -> anyhow::Result<Vec<u8>>;

    /// MIME type of fetched outputs.
    fn content_type(&self) -> &str {
        "video/mp4"
    }

    /// File extension used for artifact keys.
    fn extension(&self) -> &str {
        "mp4"
    }
}

/// The providers a story pipeline uses.
#[derive(Clone)]
pub struct GenerationProviders {
    /// Stage A.
    pub story: Arc<dyn StoryGenerator>,
    /// Stage B.
    pub images: Arc<dyn ItemGenerator>,
    /// Stage C.
    pub audio: Arc<dyn ItemGenerator>,
    /// Stage D.
    pub video: Arc<dyn JobGenerator>,
}

impl fmt::Debug for GenerationProviders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationProviders")
            .field("images", &self.images.content_type())
            .field("audio", &self.audio.content_type())
            .field("video", &self.video.content_type())
            .finish_non_exhaustive()
    }
}
