//! Pipeline records: the only state callers observe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Overall status of a pipeline record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Created, not started.
    #[default]
    Pending,
    /// Stages are running.
    Processing,
    /// Every stage produced full output.
    Completed,
    /// Some batch items are missing.
    PartiallyCompleted,
    /// Nothing usable was produced.
    Failed,
}

impl PipelineStatus {
    /// Returns true for statuses no stage will move away from.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyCompleted | Self::Failed)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::PartiallyCompleted => write!(f, "partially_completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Persistent record of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Pipeline id.
    pub id: String,
    /// Requesting user.
    pub owner_id: String,
    /// Name of the stage that last reported.
    pub stage: String,
    /// 0..=100.
    pub progress_percent: u8,
    /// Overall status.
    pub status: PipelineStatus,
    /// Error text when failed.
    pub error_message: Option<String>,
    /// Per-stage metadata, keyed by stage name.
    pub stage_metadata: Map<String, Value>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    /// A fresh pending record.
    #[must_use]
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            stage: "created".to_string(),
            progress_percent: 0,
            status: PipelineStatus::Pending,
            error_message: None,
            stage_metadata: Map::new(),
            updated_at: Utc::now(),
        }
    }

    /// Applies a partial update and bumps `updated_at`.
    pub fn apply(&mut self, update: RecordUpdate) {
        if let Some(stage) = update.stage {
            self.stage = stage;
        }
        if let Some(progress) = update.progress_percent {
            // Parallel stages report out of order; progress never moves back.
            self.progress_percent = self.progress_percent.max(progress.min(100));
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(error) = update.error_message {
            self.error_message = Some(error);
        }
        self.stage_metadata.extend(update.stage_metadata);
        self.updated_at = Utc::now();
    }
}

/// A partial record update. Unset fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordUpdate {
    /// New stage name.
    pub stage: Option<String>,
    /// New progress.
    pub progress_percent: Option<u8>,
    /// New status.
    pub status: Option<PipelineStatus>,
    /// New error text.
    pub error_message: Option<String>,
    /// Metadata entries merged into the record.
    pub stage_metadata: Map<String, Value>,
}

impl RecordUpdate {
    /// An empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the stage name.
    #[must_use]
    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Sets the progress.
    #[must_use]
    pub fn progress(mut self, percent: u8) -> Self {
        self.progress_percent = Some(percent);
        self
    }

    /// Sets the status.
    #[must_use]
    pub fn status(mut self, status: PipelineStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the error text.
    #[must_use]
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.stage_metadata.insert(key.into(), value);
        self
    }

    /// Marks the pipeline failed with `message`.
    #[must_use]
    pub fn failed(stage: &str, message: impl Into<String>) -> Self {
        Self::new()
            .stage(stage)
            .status(PipelineStatus::Failed)
            .error(message)
    }
}

/// Persistent store of pipeline records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Loads a record.
    async fn get(&self, id: &str) -> anyhow::Result<Option<PipelineRecord>>;

    /// Applies a partial update and returns the updated record.
    ///
    /// `Ok(None)` means the record no longer exists, for example because its
    /// owner deleted it mid-run. `Err` is reserved for store failures.
    async fn update(
        &self,
        id: &str,
        update: RecordUpdate,
    ) -> anyhow::Result<Option<PipelineRecord>>;
}

/// Record store held in a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: DashMap<String, PipelineRecord>,
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record.
    pub fn insert(&self, record: PipelineRecord) {
        self.records.insert(record.id.clone(), record);
    }

    /// Deletes a record, returning it if it existed.
    pub fn remove(&self, id: &str) -> Option<PipelineRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    /// Synchronous read, for assertions.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<PipelineRecord> {
        self.records.get(id).map(|r| r.clone())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, id: &str) -> anyhow::Result<Option<PipelineRecord>> {
        Ok(self.snapshot(id))
    }

    async fn update(
        &self,
        id: &str,
        update: RecordUpdate,
    ) -> anyhow::Result<Option<PipelineRecord>> {
        Ok(self.records.get_mut(id).map(|mut record| {
            record.apply(update);
            record.clone()
        }))
    }
}
