//! # Genflow
//!
//! Asynchronous DAG orchestration for multi-stage content-generation
//! pipelines.
//!
//! Genflow provides:
//!
//! - **Dependency-aware execution**: register task units with explicit
//!   dependencies and run them concurrently under one process-wide semaphore
//! - **Durable handoff**: a TTL-scoped key/value store (in-memory or Redis)
//!   carrying stage outputs, task results and batch checkpoints
//! - **Per-item batch retry**: a tracker that retries only the failed items of
//!   a group operation and can resume from a persisted checkpoint
//! - **Story pipelines**: story, image, audio, video and assembly stages wired
//!   into a DAG and run as background jobs
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use genflow::prelude::*;
//!
//! let config = EngineConfig::load(Path::new("genflow.toml")).await?;
//! let ctx = Arc::new(OrchestrationContext::init(config).await?);
//! let pipeline = StoryPipeline::new(ctx.clone(), providers, records, artifacts);
//!
//! let job = pipeline
//!     .start("pipeline-42", PipelineRequest::new("user-7", "a fox who learns to fly", 6))
//!     .await?;
//! job.wait().await;
//!
//! ctx.shutdown("deploy").await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod dag;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod observability;
pub mod orchestration;
pub mod pipeline;
pub mod retry;
pub mod store;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BatchConfig, EngineConfig, PollingConfig, StoreConfig};
    pub use crate::dag::{
        work_fn, DagOutcome, TaskId, TaskInput, TaskResult, TaskRunner, TaskStatus, Work,
    };
    pub use crate::errors::{GenflowError, Result, RetryError, StoreError, TaskError};
    pub use crate::events::{
        CollectingEventSink, EngineEvent, EventSink, LoggingEventSink, NoOpEventSink,
    };
    pub use crate::jobs::{JobHandle, JobRegistry, JobStatus};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::orchestration::OrchestrationContext;
    pub use crate::pipeline::{
        ArtifactStore, GenerationProviders, ItemGenerator, JobGenerator, PipelineRecord,
        PipelineRequest, PipelineStatus, RecordStore, RecordUpdate, StoryGenerator, StoryPipeline,
    };
    pub use crate::retry::{
        retry_with_backoff, BackoffPolicy, BatchRetryTracker, BatchStatus, BatchSummary,
        RetryPolicy,
    };
    pub use crate::store::{HandoffBackend, HandoffStore};
    pub use std::sync::Arc;
}
