//! Stage A: generate and validate the story.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::{content_digest, names, StageDeps};
use crate::dag::{TaskInput, Work};
use crate::errors::TaskError;
use crate::pipeline::record::{PipelineStatus, RecordUpdate};
use crate::retry::retry_with_backoff;

/// One page of a story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryPage {
    /// Narration text.
    pub text: String,
    /// Prompt for the page illustration.
    pub image_prompt: String,
}

/// A generated story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    /// Title.
    pub title: String,
    /// Pages, in reading order.
    pub pages: Vec<StoryPage>,
}

/// JSON Schema the story generator is asked to satisfy.
#[must_use]
pub fn story_schema(page_count: usize) -> Value {
    json!({
        "type": "object",
        "required": ["title", "pages"],
        "properties": {
            "title": {"type": "string"},
            "pages": {
                "type": "array",
                "minItems": page_count,
                "maxItems": page_count,
                "items": {
                    "type": "object",
                    "required": ["text", "image_prompt"],
                    "properties": {
                        "text": {"type": "string", "minLength": 1},
                        "image_prompt": {"type": "string", "minLength": 1}
                    }
                }
            }
        }
    })
}

/// Checks the acceptance rules a generated story must meet.
///
/// # Errors
///
/// Returns a description of the first violated rule.
pub fn validate_story(story: &Story, page_count: usize) -> Result<(), String> {
    if story.pages.len() != page_count {
        return Err(format!(
            "expected {page_count} pages, got {}",
            story.pages.len()
        ));
    }
    for (index, page) in story.pages.iter().enumerate() {
        if page.text.trim().is_empty() {
            return Err(format!("page {index} has no text"));
        }
        if page.image_prompt.trim().is_empty() {
            return Err(format!("page {index} has no image prompt"));
        }
    }
    Ok(())
}

/// Generates the story with retries and hands it off to later stages.
///
/// The task result is the story itself plus a `digest` field, so dependants
/// can decode it as a [`Story`] without the handoff store.
#[derive(Debug, Clone)]
pub struct StoryStage {
    deps: StageDeps,
}

impl StoryStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }

    async fn generate(&self) -> Result<Story, TaskError> {
        let deps = &self.deps;
        let page_count = deps.request.page_count;
        let prompt = deps.styled(&deps.request.prompt);
        let schema = story_schema(page_count);
        let policy = deps.ctx.config().retry.clone();

        retry_with_backoff(&policy, "story.generate", |_attempt| {
            let prompt = &prompt;
            let schema = &schema;
            async move {
                let raw = deps.providers.story.generate(prompt, schema).await?;
                let story: Story = serde_json::from_value(raw)?;
                validate_story(&story, page_count).map_err(anyhow::Error::msg)?;
                Ok::<_, anyhow::Error>(story)
            }
        })
        .await
        .map_err(|e| {
            let attempts = e.attempts();
            TaskError::failed(format!(
                "story generation failed after {attempts} attempts: {:#}",
                e.into_last_error()
            ))
        })
    }
}

#[async_trait]
impl Work for StoryStage {
    async fn run(&self, _input: TaskInput) -> Result<Value, TaskError> {
        let deps = &self.deps;
        let present = deps
            .report(
                RecordUpdate::new()
                    .stage(names::STORY)
                    .status(PipelineStatus::Processing)
                    .progress(5),
            )
            .await;
        if !present {
            return Err(TaskError::Cancelled("pipeline record was deleted".to_string()));
        }

        let story = match self.generate().await {
            Ok(story) => story,
            Err(err) => {
                deps.report(RecordUpdate::failed(names::STORY, err.to_string()))
                    .await;
                return Err(err);
            }
        };

        deps.ctx.store().set(&deps.key(names::STORY), &story, None).await;

        let mut result = serde_json::to_value(&story).map_err(TaskError::failed)?;
        let digest = serde_json::to_vec(&story)
            .map(|bytes| content_digest(&bytes))
            .unwrap_or_default();
        let summary = json!({
            "title": story.title,
            "pages": story.pages.len(),
            "digest": digest,
        });
        info!(pipeline_id = %deps.pipeline.pipeline_id, pages = story.pages.len(), "Story generated");
        let present = deps
            .report(
                RecordUpdate::new()
                    .stage(names::STORY)
                    .progress(20)
                    .metadata(names::STORY, summary),
            )
            .await;
        if !present {
            return Err(TaskError::Cancelled("pipeline record was deleted".to_string()));
        }

        if let Value::Object(map) = &mut result {
            map.insert("digest".to_string(), Value::String(digest));
        }
        Ok(result)
    }
}
