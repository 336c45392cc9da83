//! The five stage units of a story pipeline.
//!
//! ```text
//! story  -> images, audio, video
//! images -> video, assembly
//! audio  -> assembly
//! video  -> assembly
//! ```
//!
//! Stages hand data to each other through the handoff store, and every
//! stage also returns what it wrote as its task result. A downstream stage
//! reads the store first and falls back to its dependency's result when the
//! store misses, so a store outage degrades the handoff without failing the
//! run. Batch stages report a summary even when every item failed, so
//! assembly always runs once the story exists.

mod assembly;
mod audio;
mod images;
mod story;
mod video;

pub use assembly::{final_status, AssemblyStage};
pub use audio::AudioStage;
pub use images::ImageStage;
pub use story::{story_schema, validate_story, Story, StoryPage, StoryStage};
pub use video::VideoStage;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

use super::artifacts::{artifact_key, ArtifactStore};
use super::batch::{BatchExecutor, BatchOutcome};
use super::context::{PipelineContext, PipelineRequest};
use super::providers::{GenerationProviders, ItemGenerator};
use super::batch::summary_key;
use super::record::{RecordStore, RecordUpdate};
use crate::dag::TaskInput;
use crate::errors::TaskError;
use crate::retry::BatchSummary;
use crate::orchestration::OrchestrationContext;
use crate::store::pipeline_key;

/// Stage names, also used as handoff key suffixes.
pub mod names {
    /// Stage A.
    pub const STORY: &str = "story";
    /// Stage B.
    pub const IMAGES: &str = "images";
    /// Stage C.
    pub const AUDIO: &str = "audio";
    /// Stage D.
    pub const VIDEO: &str = "video";
    /// Stage E.
    pub const ASSEMBLY: &str = "assembly";
    /// The batch stages, in assembly order.
    pub const BATCH_STAGES: [&str; 3] = [IMAGES, AUDIO, VIDEO];
}

/// Task result of a batch stage: its summary and the per-page artifact URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Batch summary.
    pub summary: BatchSummary,
    /// Artifact URL per page; `None` where the page produced nothing.
    pub urls: Vec<Option<String>>,
}

/// Collaborators shared by every stage of one pipeline run.
#[derive(Clone)]
pub struct StageDeps {
    /// Orchestration context.
    pub ctx: Arc<OrchestrationContext>,
    /// Run identity.
    pub pipeline: Arc<PipelineContext>,
    /// The original request.
    pub request: Arc<PipelineRequest>,
    /// Generation providers.
    pub providers: GenerationProviders,
    /// Record sink.
    pub records: Arc<dyn RecordStore>,
    /// Final artifact storage.
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl std::fmt::Debug for StageDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDeps")
            .field("pipeline", &self.pipeline)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl StageDeps {
    /// Handoff key scoped to this pipeline.
    pub(crate) fn key(&self, suffix: &str) -> String {
        pipeline_key(&self.pipeline.pipeline_id, suffix)
    }

    /// Applies a record update. Store failures are logged, not propagated.
    ///
    /// Returns false only when the record no longer exists.
    pub(crate) async fn report(&self, update: RecordUpdate) -> bool {
        let pipeline_id = self.pipeline.pipeline_id.as_str();
        match self.records.update(pipeline_id, update).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                warn!(pipeline_id, "Pipeline record no longer exists");
                false
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(pipeline_id, error = %message, "Record update failed");
                true
            }
        }
    }

    /// Loads the story from the handoff store, or from the story unit's
    /// result when the store misses.
    pub(crate) async fn load_story(&self, input: &TaskInput) -> Result<Story, TaskError> {
        if let Some(story) = self.ctx.store().get(&self.key(names::STORY)).await {
            return Ok(story);
        }
        let result = input
            .dependency(names::STORY)
            .ok_or_else(|| TaskError::failed("story not found in handoff store"))?;
        debug!(pipeline_id = %self.pipeline.pipeline_id, "Story read from dependency result");
        serde_json::from_value(result.clone()).map_err(TaskError::failed)
    }

    /// Per-page URLs written by batch stage `stage`.
    pub(crate) async fn stage_urls(
        &self,
        input: &TaskInput,
        stage: &str,
    ) -> Option<Vec<Option<String>>> {
        if let Some(urls) = self.ctx.store().get(&self.key(stage)).await {
            return Some(urls);
        }
        dependency_output(input, stage).map(|output| output.urls)
    }

    /// Summary written by batch stage `stage`.
    pub(crate) async fn stage_summary(
        &self,
        input: &TaskInput,
        stage: &str,
    ) -> Option<BatchSummary> {
        let key = summary_key(&self.pipeline.pipeline_id, stage);
        if let Some(summary) = self.ctx.store().get(&key).await {
            return Some(summary);
        }
        dependency_output(input, stage).map(|output| output.summary)
    }

    /// Appends the request's style hint to a prompt.
    pub(crate) fn styled(&self, prompt: &str) -> String {
        match &self.request.style {
            Some(style) => format!("{prompt}\n\nStyle: {style}"),
            None => prompt.to_string(),
        }
    }

    pub(crate) fn batch(&self, stage: &str) -> BatchExecutor {
        BatchExecutor::new(self.ctx.clone(), self.pipeline.pipeline_id.clone(), stage)
    }
}

fn dependency_output(input: &TaskInput, stage: &str) -> Option<StageOutput> {
    let result = input.dependency(stage)?;
    match serde_json::from_value(result.clone()) {
        Ok(output) => Some(output),
        Err(e) => {
            warn!(stage, error = %e, "Undecodable stage result");
            None
        }
    }
}

/// Deterministic per-item seed derived from the pipeline, stage and index.
#[must_use]
pub fn item_seed(pipeline_id: &str, stage: &str, index: usize) -> u64 {
    let digest = Sha256::new()
        .chain_update(pipeline_id.as_bytes())
        .chain_update(b":")
        .chain_update(stage.as_bytes())
        .chain_update(b":")
        .chain_update(index.to_be_bytes())
        .finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(seed)
}

/// Hex SHA-256 of generated bytes, recorded as artifact provenance.
#[must_use]
pub fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Lays completed payloads out by page; missing pages are `None`.
#[must_use]
pub fn urls_by_page(total: usize, outputs: &[(usize, String)]) -> Vec<Option<String>> {
    let mut urls = vec![None; total];
    for (index, url) in outputs {
        if let Some(slot) = urls.get_mut(*index) {
            *slot = Some(url.clone());
        }
    }
    urls
}

/// Shared body of the image and audio stages: one generated item per page.
pub(crate) async fn run_item_stage(
    deps: &StageDeps,
    input: &TaskInput,
    stage: &str,
    generator: &Arc<dyn ItemGenerator>,
    prompt_for: fn(&StoryPage) -> &str,
    progress: u8,
) -> Result<serde_json::Value, TaskError> {
    let story = deps.load_story(input).await?;
    let total = story.pages.len();
    let pipeline_id = deps.pipeline.pipeline_id.as_str();
    let owner_id = deps.pipeline.owner_id.as_str();

    let outcome: BatchOutcome = deps
        .batch(stage)
        .run(total, |index| {
            let prompt = deps.styled(prompt_for(&story.pages[index]));
            let seed = item_seed(pipeline_id, stage, index);
            async move {
                let bytes = generator.generate_item(seed, &prompt).await?;
                let digest = content_digest(&bytes);
                let key = artifact_key(owner_id, pipeline_id, stage, index, generator.extension());
                let url = deps
                    .artifacts
                    .put(&key, bytes, generator.content_type())
                    .await?;
                tracing::debug!(stage, index, digest = %digest, url = %url, "Item stored");
                Ok(url)
            }
        })
        .await;

    let urls = urls_by_page(total, &outcome.outputs);
    finish_batch_stage(deps, stage, progress, outcome.summary, urls).await
}

/// Hands off a batch stage's URLs, reports its summary and builds its result.
pub(crate) async fn finish_batch_stage(
    deps: &StageDeps,
    stage: &str,
    progress: u8,
    summary: BatchSummary,
    urls: Vec<Option<String>>,
) -> Result<serde_json::Value, TaskError> {
    deps.ctx.store().set(&deps.key(stage), &urls, None).await;

    let metadata = serde_json::to_value(&summary).map_err(TaskError::failed)?;
    deps.report(
        RecordUpdate::new()
            .stage(stage)
            .progress(progress)
            .metadata(stage, metadata),
    )
    .await;
    serde_json::to_value(StageOutput { summary, urls }).map_err(TaskError::failed)
}
