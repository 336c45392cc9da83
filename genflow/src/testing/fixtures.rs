//! A fully in-memory pipeline harness.

use std::sync::Arc;

use super::mocks::{ScriptedItemGenerator, ScriptedJobGenerator, ScriptedStoryGenerator};
use crate::config::EngineConfig;
use crate::events::CollectingEventSink;
use crate::orchestration::OrchestrationContext;
use crate::pipeline::{
    GenerationProviders, InMemoryArtifactStore, InMemoryRecordStore, PipelineRecord,
    StoryGenerator, StoryPipeline,
};
use crate::store::{HandoffStore, InMemoryBackend};

/// Engine settings with short delays, suitable for tests and benches.
#[must_use]
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.engine.max_concurrency = 4;
    config.engine.shutdown_grace_secs = 1;
    config.retry = config.retry.with_base_delay_ms(10).with_max_delay_ms(100);
    config.batch.max_retries = 3;
    config.batch.pass_delay_ms = 10;
    config.batch.max_pass_delay_ms = 100;
    config.polling.interval_ms = 10;
    config.polling.timeout_secs = 1;
    config
}

/// Every collaborator of a story pipeline, held in memory.
pub struct TestHarness {
    /// Orchestration context.
    pub ctx: Arc<OrchestrationContext>,
    /// Record store.
    pub records: Arc<InMemoryRecordStore>,
    /// Artifact store.
    pub artifacts: Arc<InMemoryArtifactStore>,
    /// Events emitted during the run.
    pub events: Arc<CollectingEventSink>,
    /// Backend of the handoff store, for simulating outages.
    pub backend: Arc<InMemoryBackend>,
    /// Image provider.
    pub images: Arc<ScriptedItemGenerator>,
    /// Audio provider.
    pub audio: Arc<ScriptedItemGenerator>,
    /// Video provider.
    pub video: Arc<ScriptedJobGenerator>,
    story: Arc<dyn StoryGenerator>,
}

impl TestHarness {
    /// A harness whose providers always succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// A harness over `config` with always-succeeding providers.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        let events = Arc::new(CollectingEventSink::new());
        let backend = Arc::new(InMemoryBackend::new());
        let store = HandoffStore::new(backend.clone(), &config.store);
        let ctx = OrchestrationContext::new(config, store).with_events(events.clone());
        Self {
            ctx: Arc::new(ctx),
            records: Arc::new(InMemoryRecordStore::new()),
            artifacts: Arc::new(InMemoryArtifactStore::default()),
            events,
            backend,
            images: Arc::new(ScriptedItemGenerator::images()),
            audio: Arc::new(ScriptedItemGenerator::audio()),
            video: Arc::new(ScriptedJobGenerator::new()),
            story: Arc::new(ScriptedStoryGenerator::new()),
        }
    }

    /// Replaces the story provider.
    #[must_use]
    pub fn with_story(mut self, story: Arc<dyn StoryGenerator>) -> Self {
        self.story = story;
        self
    }

    /// Replaces the image provider.
    #[must_use]
    pub fn with_images(mut self, images: ScriptedItemGenerator) -> Self {
        self.images = Arc::new(images);
        self
    }

    /// Replaces the audio provider.
    #[must_use]
    pub fn with_audio(mut self, audio: ScriptedItemGenerator) -> Self {
        self.audio = Arc::new(audio);
        self
    }

    /// Replaces the video provider.
    #[must_use]
    pub fn with_video(mut self, video: ScriptedJobGenerator) -> Self {
        self.video = Arc::new(video);
        self
    }

    /// The provider bundle.
    #[must_use]
    pub fn providers(&self) -> GenerationProviders {
        GenerationProviders {
            story: self.story.clone(),
            images: self.images.clone(),
            audio: self.audio.clone(),
            video: self.video.clone(),
        }
    }

    /// A launcher over this harness.
    #[must_use]
    pub fn pipeline(&self) -> StoryPipeline {
        StoryPipeline::new(
            self.ctx.clone(),
            self.providers(),
            self.records.clone(),
            self.artifacts.clone(),
        )
    }

    /// Inserts a pending record and returns its id.
    pub fn create_record(&self, pipeline_id: &str, owner_id: &str) -> String {
        self.records.insert(PipelineRecord::new(pipeline_id, owner_id));
        pipeline_id.to_string()
    }

    /// Current state of a record.
    #[must_use]
    pub fn record(&self, pipeline_id: &str) -> Option<PipelineRecord> {
        self.records.snapshot(pipeline_id)
    }
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness")
            .field("ctx", &self.ctx)
            .field("records", &self.records)
            .field("artifacts", &self.artifacts.len())
            .finish_non_exhaustive()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
