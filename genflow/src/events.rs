//! Typed engine events and the sinks that receive them.
//!
//! The runner publishes one event per unit transition, batch executors one per
//! pass, and the launcher brackets each run with `pipeline.started` and
//! `pipeline.finished`. Every event serializes with its dotted name in a
//! `type` field. The sink is owned by the
//! [`OrchestrationContext`](crate::orchestration::OrchestrationContext).

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, Level};

use crate::dag::TaskId;
use crate::errors::TaskError;
use crate::pipeline::PipelineStatus;

/// Something observable that happened inside the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    /// A unit acquired what it needed and began its work.
    #[serde(rename = "task.started")]
    TaskStarted {
        /// Unit id.
        task_id: TaskId,
        /// Unit name.
        task_name: String,
    },
    /// A unit's work returned a value.
    #[serde(rename = "task.completed")]
    TaskCompleted {
        /// Unit id.
        task_id: TaskId,
        /// Unit name.
        task_name: String,
    },
    /// A unit's work returned an error, panicked or was cancelled.
    #[serde(rename = "task.failed")]
    TaskFailed {
        /// Unit id.
        task_id: TaskId,
        /// Unit name.
        task_name: String,
        /// Error text.
        error: String,
    },
    /// A unit never ran because a dependency did not complete.
    #[serde(rename = "task.skipped")]
    TaskSkipped {
        /// Unit id.
        task_id: TaskId,
        /// Unit name.
        task_name: String,
        /// Which dependency failed, and why.
        error: String,
    },
    /// One pass of a batch stage finished.
    #[serde(rename = "stage.batch_pass")]
    BatchPass {
        /// Owning pipeline.
        pipeline_id: String,
        /// Stage name.
        stage: String,
        /// 1-based pass number.
        pass: u32,
        /// Items completed so far.
        completed: usize,
        /// Items still eligible for another pass.
        pending: usize,
        /// Items out of retries.
        failed: usize,
    },
    /// A pipeline job began executing its units.
    #[serde(rename = "pipeline.started")]
    PipelineStarted {
        /// Pipeline id.
        pipeline_id: String,
        /// Id of this execution.
        execution_id: String,
    },
    /// Assembly wrote the terminal record status.
    #[serde(rename = "pipeline.assembled")]
    PipelineAssembled {
        /// Pipeline id.
        pipeline_id: String,
        /// Status written to the record.
        status: PipelineStatus,
    },
    /// A pipeline job finished, whatever the outcome.
    #[serde(rename = "pipeline.finished")]
    PipelineFinished {
        /// Pipeline id.
        pipeline_id: String,
        /// Final record status.
        status: PipelineStatus,
        /// Wall time of the unit graph.
        duration_ms: f64,
        /// Names of units that did not complete, in registration order.
        failed_tasks: Vec<String>,
    },
}

impl EngineEvent {
    /// The terminal event for a unit, chosen from its outcome.
    #[must_use]
    pub fn task_finished(
        task_id: &str,
        task_name: &str,
        outcome: &Result<Value, TaskError>,
    ) -> Self {
        let task_id = task_id.to_string();
        let task_name = task_name.to_string();
        match outcome {
            Ok(_) => Self::TaskCompleted { task_id, task_name },
            Err(err) if err.is_dependency_failure() => Self::TaskSkipped {
                task_id,
                task_name,
                error: err.to_string(),
            },
            Err(err) => Self::TaskFailed {
                task_id,
                task_name,
                error: err.to_string(),
            },
        }
    }

    /// Dotted event name, identical to the serialized `type` field.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskStarted { .. } => "task.started",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskSkipped { .. } => "task.skipped",
            Self::BatchPass { .. } => "stage.batch_pass",
            Self::PipelineStarted { .. } => "pipeline.started",
            Self::PipelineAssembled { .. } => "pipeline.assembled",
            Self::PipelineFinished { .. } => "pipeline.finished",
        }
    }

    /// Pipeline the event belongs to; unit events carry none.
    #[must_use]
    pub fn pipeline_id(&self) -> Option<&str> {
        match self {
            Self::BatchPass { pipeline_id, .. }
            | Self::PipelineStarted { pipeline_id, .. }
            | Self::PipelineAssembled { pipeline_id, .. }
            | Self::PipelineFinished { pipeline_id, .. } => Some(pipeline_id),
            _ => None,
        }
    }
}

/// Receives engine events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Records an event without awaiting. Must never panic.
    fn try_emit(&self, event: &EngineEvent);

    /// Delivers an event, for sinks that forward over I/O.
    async fn emit(&self, event: &EngineEvent) {
        self.try_emit(event);
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: &EngineEvent) {}
}

/// Writes events to the tracing subscriber.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Logs at `level`; anything other than `DEBUG` logs at `INFO`.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// A debug-level sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: &EngineEvent) {
        let name = event.name();
        let pipeline_id = event.pipeline_id().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(event = name, pipeline_id, details = ?event, "Engine event");
        } else {
            info!(event = name, pipeline_id, details = ?event, "Engine event");
        }
    }
}

/// Keeps every event in memory, for assertions.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<EngineEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// Number of events so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose name starts with `prefix`, e.g. `"task."`.
    #[must_use]
    pub fn named(&self, prefix: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.name().starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: &EngineEvent) {
        self.events.write().push(event.clone());
    }
}
