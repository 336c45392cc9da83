//! Stage C: one narration clip per page.

use async_trait::async_trait;
use serde_json::Value;

use super::{names, run_item_stage, StageDeps, StoryPage};
use crate::dag::{TaskInput, Work};
use crate::errors::TaskError;

fn narration_text(page: &StoryPage) -> &str {
    &page.text
}

/// Generates page narration as a resumable batch.
#[derive(Debug, Clone)]
pub struct AudioStage {
    deps: StageDeps,
}

impl AudioStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Work for AudioStage {
    async fn run(&self, input: TaskInput) -> Result<Value, TaskError> {
        let generator = self.deps.providers.audio.clone();
        run_item_stage(&self.deps, &input, names::AUDIO, &generator, narration_text, 60).await
    }

    fn holds_permit(&self) -> bool {
        false
    }
}
