//! Process-wide orchestration state.
//!
//! One [`OrchestrationContext`] owns the shared concurrency semaphore, the
//! handoff store, the event sink, the shutdown token and the job registry.
//! It is created once with [`OrchestrationContext::init`], shared as an
//! `Arc`, and torn down with [`OrchestrationContext::shutdown`].

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::errors::{GenflowError, Result};
use crate::events::{EventSink, LoggingEventSink};
use crate::jobs::JobRegistry;
use crate::store::HandoffStore;

/// Shared engine state passed explicitly to runners and pipelines.
pub struct OrchestrationContext {
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    store: HandoffStore,
    events: Arc<dyn EventSink>,
    shutdown: Arc<CancellationToken>,
    jobs: JobRegistry,
}

impl OrchestrationContext {
    /// Validates `config` and connects the configured store.
    ///
    /// # Errors
    ///
    /// Returns a configuration error or a store connection error.
    pub async fn init(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = HandoffStore::from_config(&config.store).await?;
        info!(
            max_concurrency = config.engine.max_concurrency,
            store_url = %config.store.url,
            "Orchestration context initialised"
        );
        Ok(Self::new(config, store))
    }

    /// Builds a context over an already-connected store.
    #[must_use]
    pub fn new(config: EngineConfig, store: HandoffStore) -> Self {
        let permits = config.engine.max_concurrency.max(1);
        let jobs = JobRegistry::with_retention(config.engine.job_retention());
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            store,
            events: Arc::new(LoggingEventSink::default()),
            shutdown: Arc::new(CancellationToken::new()),
            jobs,
        }
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared concurrency semaphore.
    #[must_use]
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.semaphore
    }

    /// The handoff store.
    #[must_use]
    pub fn store(&self) -> &HandoffStore {
        &self.store
    }

    /// The event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// The shutdown token.
    #[must_use]
    pub fn shutdown_token(&self) -> &Arc<CancellationToken> {
        &self.shutdown
    }

    /// Background jobs.
    #[must_use]
    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Acquires one concurrency permit.
    ///
    /// # Errors
    ///
    /// Returns [`GenflowError::Cancelled`] if shutdown starts while waiting.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            reason = self.shutdown.cancelled() => Err(GenflowError::Cancelled(reason)),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| GenflowError::Cancelled("semaphore closed".to_string()))
            }
        }
    }

    /// Cancels in-flight work and waits for background jobs.
    ///
    /// Jobs still running after the configured grace period are aborted.
    pub async fn shutdown(&self, reason: &str) {
        info!(reason, "Orchestration shutdown requested");
        self.shutdown.cancel(reason);
        let aborted = self.jobs.shutdown(self.config.engine.shutdown_grace()).await;
        self.semaphore.close();
        info!(aborted, "Orchestration shutdown complete");
    }
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("max_concurrency", &self.config.engine.max_concurrency)
            .field("available_permits", &self.semaphore.available_permits())
            .field("shutting_down", &self.is_shutting_down())
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}
