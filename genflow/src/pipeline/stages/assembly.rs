//! Stage E: aggregate the batch summaries into the final record status.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;

use super::{names, StageDeps};
use crate::dag::{TaskInput, Work};
use crate::errors::TaskError;
use crate::events::EngineEvent;
use crate::pipeline::record::{PipelineStatus, RecordUpdate};
use crate::retry::{BatchStatus, BatchSummary};

/// Final record status for a set of batch stage summaries.
///
/// A missing summary counts as a stage that produced nothing.
#[must_use]
pub fn final_status(summaries: &[Option<BatchSummary>]) -> PipelineStatus {
    let all_completed = summaries
        .iter()
        .all(|s| s.as_ref().is_some_and(|s| s.status == BatchStatus::Completed));
    let any_output = summaries
        .iter()
        .any(|s| s.as_ref().is_some_and(BatchSummary::has_output));

    if all_completed {
        PipelineStatus::Completed
    } else if any_output {
        PipelineStatus::PartiallyCompleted
    } else {
        PipelineStatus::Failed
    }
}

/// Reads every batch summary and writes the terminal record update.
///
/// Summaries and URLs come from the handoff store, or from the batch units'
/// results when the store misses.
#[derive(Debug, Clone)]
pub struct AssemblyStage {
    deps: StageDeps,
}

impl AssemblyStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(deps: StageDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl Work for AssemblyStage {
    async fn run(&self, input: TaskInput) -> Result<Value, TaskError> {
        let deps = &self.deps;
        let store = deps.ctx.store();
        let pipeline_id = deps.pipeline.pipeline_id.as_str();

        let mut summaries = Vec::with_capacity(names::BATCH_STAGES.len());
        let mut stage_summaries = Map::new();
        let mut assets = Map::new();
        for stage in names::BATCH_STAGES {
            let summary = deps.stage_summary(&input, stage).await;
            let urls = deps.stage_urls(&input, stage).await;
            stage_summaries.insert(stage.to_string(), json!(summary));
            assets.insert(stage.to_string(), json!(urls.unwrap_or_default()));
            summaries.push(summary);
        }

        let status = final_status(&summaries);
        let mut update = RecordUpdate::new()
            .stage(names::ASSEMBLY)
            .progress(100)
            .status(status)
            .metadata("summaries", Value::Object(stage_summaries))
            .metadata("assets", Value::Object(assets));
        if status == PipelineStatus::Failed {
            update = update.error("no batch stage produced any output");
        }

        if deps
            .records
            .update(pipeline_id, update)
            .await
            .map_err(TaskError::from)?
            .is_none()
        {
            return Err(TaskError::Cancelled("pipeline record was deleted".to_string()));
        }

        for stage in names::BATCH_STAGES {
            store
                .delete(&deps.key(&format!("checkpoint:{stage}")))
                .await;
        }

        info!(pipeline_id, status = %status, "Pipeline assembled");
        deps.ctx.events().try_emit(&EngineEvent::PipelineAssembled {
            pipeline_id: pipeline_id.to_string(),
            status,
        });
        Ok(json!({"status": status}))
    }
}
