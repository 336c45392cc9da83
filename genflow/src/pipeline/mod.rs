//! Story pipeline assembly.
//!
//! This module provides:
//! - Pipeline requests, run context and records
//! - Provider, record store and artifact store interfaces
//! - Batch and polling executors built on the batch retry tracker
//! - The five stage units and the launcher that wires them into a DAG

mod artifacts;
mod batch;
mod context;
mod launcher;
mod polling;
mod providers;
mod record;
mod stages;

pub use artifacts::{artifact_key, ArtifactStore, InMemoryArtifactStore, StoredObject};
pub use batch::{summary_key, BatchExecutor, BatchOutcome};
pub use context::{PipelineContext, PipelineRequest, MAX_PAGE_COUNT};
pub use launcher::{StoryPipeline, RETRY_COUNT_KEY};
pub use polling::{PollingExecutor, Submission};
pub use providers::{
    GenerationProviders, ItemGenerator, JobGenerator, JobRequest, JobState, StoryGenerator,
};
pub use record::{InMemoryRecordStore, PipelineRecord, PipelineStatus, RecordStore, RecordUpdate};
pub use stages::{
    content_digest, final_status, item_seed, names, story_schema, urls_by_page, validate_story,
    AssemblyStage, AudioStage, ImageStage, StageDeps, StageOutput, Story, StoryPage, StoryStage,
    VideoStage,
};
