//! Starting a story pipeline as a background job.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use super::artifacts::ArtifactStore;
use super::context::{PipelineContext, PipelineRequest};
use super::providers::GenerationProviders;
use super::record::{PipelineStatus, RecordStore, RecordUpdate};
use super::stages::{
    names, AssemblyStage, AudioStage, ImageStage, StageDeps, StoryStage, VideoStage,
};
use crate::dag::{DagOutcome, TaskId, TaskRunner, Work};
use crate::errors::{GenflowError, Result};
use crate::events::EngineEvent;
use crate::jobs::JobHandle;
use crate::observability::pipeline_span;
use crate::orchestration::OrchestrationContext;

/// Metadata key holding how many times a record has been re-run.
pub const RETRY_COUNT_KEY: &str = "retry_count";

/// Wires the five stages of a story pipeline into a DAG and runs it.
#[derive(Clone)]
pub struct StoryPipeline {
    ctx: Arc<OrchestrationContext>,
    providers: GenerationProviders,
    records: Arc<dyn RecordStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl std::fmt::Debug for StoryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoryPipeline")
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

impl StoryPipeline {
    /// Creates a pipeline launcher over the given collaborators.
    #[must_use]
    pub fn new(
        ctx: Arc<OrchestrationContext>,
        providers: GenerationProviders,
        records: Arc<dyn RecordStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            ctx,
            providers,
            records,
            artifacts,
        }
    }

    /// The orchestration context.
    #[must_use]
    pub fn context(&self) -> &Arc<OrchestrationContext> {
        &self.ctx
    }

    /// Validates the request, registers the stage units and hands the run
    /// to the job registry.
    ///
    /// The record `pipeline_id` must already exist and belong to the
    /// request's owner. Everything after this call is observable only
    /// through the record.
    pub async fn start(&self, pipeline_id: &str, request: PipelineRequest) -> Result<JobHandle> {
        if self.ctx.is_shutting_down() {
            return Err(GenflowError::Cancelled("engine is shutting down".to_string()));
        }
        request.validate()?;

        let record = self
            .records
            .get(pipeline_id)
            .await
            .map_err(|e| GenflowError::Internal(format!("{e:#}")))?
            .ok_or_else(|| {
                GenflowError::Validation(format!("pipeline record '{pipeline_id}' not found"))
            })?;
        if record.owner_id != request.owner_id {
            return Err(GenflowError::Validation(format!(
                "pipeline record '{pipeline_id}' belongs to another owner"
            )));
        }

        let retry_count = record
            .stage_metadata
            .get(RETRY_COUNT_KEY)
            .and_then(Value::as_u64)
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));
        let pipeline = Arc::new(
            PipelineContext::new(pipeline_id, request.owner_id.clone()).with_retry_count(retry_count),
        );

        self.records
            .update(
                pipeline_id,
                RecordUpdate::new()
                    .stage("queued")
                    .status(PipelineStatus::Processing)
                    .metadata("execution_id", json!(pipeline.execution_id)),
            )
            .await
            .map_err(|e| GenflowError::Internal(format!("{e:#}")))?
            .ok_or_else(|| {
                GenflowError::Validation(format!("pipeline record '{pipeline_id}' was deleted"))
            })?;

        let deps = StageDeps {
            ctx: self.ctx.clone(),
            pipeline: pipeline.clone(),
            request: Arc::new(request),
            providers: self.providers.clone(),
            records: self.records.clone(),
            artifacts: self.artifacts.clone(),
        };
        let runner = TaskRunner::new(self.ctx.clone());
        let ids = register_stages(&runner, &deps)?;

        info!(
            pipeline_id,
            execution_id = %pipeline.execution_id,
            retry_count,
            "Pipeline starting"
        );
        let span = pipeline_span(pipeline_id, &pipeline.owner_id);
        let job = run_to_completion(runner, ids, deps).instrument(span);
        Ok(self.ctx.jobs().spawn(pipeline_id, job))
    }
}

/// Registers the stage units in dependency order and returns their ids.
fn register_stages(runner: &TaskRunner, deps: &StageDeps) -> Result<Vec<TaskId>> {
    let args = |stage: &str| json!({"pipeline_id": deps.pipeline.pipeline_id, "stage": stage});
    let unit = |stage: &str, work: Arc<dyn Work>, depends_on: &[TaskId]| {
        runner.register(stage, work, args(stage), depends_on)
    };

    let story = unit(names::STORY, Arc::new(StoryStage::new(deps.clone())), &[])?;
    let images = unit(
        names::IMAGES,
        Arc::new(ImageStage::new(deps.clone())),
        &[story.clone()],
    )?;
    let audio = unit(
        names::AUDIO,
        Arc::new(AudioStage::new(deps.clone())),
        &[story.clone()],
    )?;
    let video = unit(
        names::VIDEO,
        Arc::new(VideoStage::new(deps.clone())),
        &[story.clone(), images.clone()],
    )?;
    let assembly = unit(
        names::ASSEMBLY,
        Arc::new(AssemblyStage::new(deps.clone())),
        &[images.clone(), audio.clone(), video.clone()],
    )?;

    Ok(vec![story, images, audio, video, assembly])
}

async fn run_to_completion(runner: TaskRunner, ids: Vec<TaskId>, deps: StageDeps) -> Result<()> {
    let pipeline_id = deps.pipeline.pipeline_id.clone();
    let events = deps.ctx.events().clone();
    events
        .emit(&EngineEvent::PipelineStarted {
            pipeline_id: pipeline_id.clone(),
            execution_id: deps.pipeline.execution_id.clone(),
        })
        .await;

    let outcome = runner.execute_dag(&ids).await?;
    let status = settle_record(&runner, &ids, &outcome, &deps).await;

    let failed_tasks: Vec<String> = ids
        .iter()
        .filter(|id| outcome.results.get(*id).is_some_and(|r| !r.is_completed()))
        .filter_map(|id| runner.name(id))
        .collect();
    info!(
        pipeline_id = %pipeline_id,
        status = %status,
        duration_ms = outcome.duration_ms,
        "Pipeline finished"
    );
    events
        .emit(&EngineEvent::PipelineFinished {
            pipeline_id,
            status,
            duration_ms: outcome.duration_ms,
            failed_tasks,
        })
        .await;
    Ok(())
}

/// Marks the record failed if no stage left it terminal; returns the final status.
async fn settle_record(
    runner: &TaskRunner,
    ids: &[TaskId],
    outcome: &DagOutcome,
    deps: &StageDeps,
) -> PipelineStatus {
    let pipeline_id = deps.pipeline.pipeline_id.as_str();
    let current = match deps.records.get(pipeline_id).await {
        Ok(Some(record)) => record.status,
        Ok(None) => {
            warn!(pipeline_id, "Pipeline record disappeared during the run");
            return PipelineStatus::Failed;
        }
        Err(e) => {
            let message = format!("{e:#}");
            warn!(pipeline_id, error = %message, "Could not read pipeline record");
            PipelineStatus::Processing
        }
    };
    if current.is_terminal() {
        return current;
    }

    // The first failure in registration order is the root cause.
    let (stage, message) = ids
        .iter()
        .find_map(|id| {
            let result = outcome.results.get(id).filter(|r| !r.is_completed())?;
            let name = runner.name(id)?;
            Some((name, result.error_text().to_string()))
        })
        .unwrap_or_else(|| {
            (
                names::ASSEMBLY.to_string(),
                "pipeline ended without a final status".to_string(),
            )
        });

    error!(pipeline_id, stage = %stage, error = %message, "Pipeline failed");
    match deps
        .records
        .update(pipeline_id, RecordUpdate::failed(&stage, message))
        .await
    {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(pipeline_id, "Pipeline record deleted before it could be marked failed");
        }
        Err(e) => {
            let message = format!("{e:#}");
            warn!(pipeline_id, error = %message, "Could not mark pipeline failed");
        }
    }
    PipelineStatus::Failed
}
