//! Stage B: one illustration per page.

use async_trait::async_trait;
use serde_json::Value;

use super::{names, run_item_stage, StageDeps, StoryPage};
use crate::dag::{TaskInput, Work};
use crate::errors::TaskError;

fn illustration_prompt(page: &StoryPage) -> &str {
    &page.image_prompt
}

/// Generates page illustrations as a resumable batch.
#[derive(Debug, Clone)]
pub struct ImageStage {
    deps: StageDeps,
}

impl ImageStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Work for ImageStage {
    async fn run(&self, input: TaskInput) -> Result<Value, TaskError> {
        let generator = self.deps.providers.images.clone();
        run_item_stage(&self.deps, &input, names::IMAGES, &generator, illustration_prompt, 40).await
    }

    fn holds_permit(&self) -> bool {
        false
    }
}
