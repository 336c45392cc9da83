//! Stage D: animate each illustrated page through an asynchronous job provider.

use async_trait::async_trait;
use serde_json::Value;

use super::{content_digest, finish_batch_stage, item_seed, names, urls_by_page, StageDeps};
use crate::dag::{TaskInput, Work};
use crate::errors::TaskError;
use crate::pipeline::artifacts::artifact_key;
use crate::pipeline::polling::{PollingExecutor, Submission};
use crate::pipeline::providers::JobRequest;

/// Submits one video job per page that has an illustration.
#[derive(Debug, Clone)]
pub struct VideoStage {
    deps: StageDeps,
}

impl VideoStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Work for VideoStage {
    async fn run(&self, input: TaskInput) -> Result<Value, TaskError> {
        let deps = &self.deps;
        let story = deps.load_story(&input).await?;
        let total = story.pages.len();
        let images = deps
            .stage_urls(&input, names::IMAGES)
            .await
            .unwrap_or_default();

        let jobs = deps.providers.video.clone();
        let executor = PollingExecutor::new(deps.batch(names::VIDEO), jobs.clone());
        let pipeline_id = deps.pipeline.pipeline_id.as_str();
        let owner_id = deps.pipeline.owner_id.as_str();

        let outcome = executor
            .run(
                total,
                |index| {
                    let source = images.get(index).cloned().flatten();
                    let prompt = deps.styled(&story.pages[index].text);
                    let jobs = &jobs;
                    async move {
                        let Some(source_url) = source else {
                            return Ok(Submission::Ineligible(format!("page {index} has no image")));
                        };
                        let request = JobRequest {
                            source_url,
                            prompt,
                            seed: item_seed(pipeline_id, names::VIDEO, index),
                        };
                        Ok(Submission::Submitted(jobs.submit(&request).await?))
                    }
                },
                |index, job_id| {
                    let jobs = &jobs;
                    async move {
                        let bytes = jobs.fetch(&job_id).await?;
                        let digest = content_digest(&bytes);
                        let key = artifact_key(owner_id, pipeline_id, names::VIDEO, index, jobs.extension());
                        let url = deps.artifacts.put(&key, bytes, jobs.content_type()).await?;
                        tracing::debug!(index, job_id = %job_id, digest = %digest, "Video stored");
                        Ok(url)
                    }
                },
            )
            .await;

        let urls = urls_by_page(total, &outcome.outputs);
        finish_batch_stage(deps, names::VIDEO, 80, outcome.summary, urls).await
    }

    fn holds_permit(&self) -> bool {
        false
    }
}
