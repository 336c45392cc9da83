//! Typed, best-effort wrapper over a [`HandoffBackend`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{pipeline_key, task_result_key, HandoffBackend, InMemoryBackend};
use crate::config::{StoreConfig, MAX_TTL_SECS};
use crate::dag::TaskResult;
use crate::errors::StoreError;

/// Handoff store used by the runner and by pipeline stages.
///
/// Cloning is cheap; all clones share one backend.
#[derive(Debug, Clone)]
pub struct HandoffStore {
    backend: Arc<dyn HandoffBackend>,
    default_ttl: Duration,
    task_result_ttl: Duration,
    scan_batch_size: usize,
}

impl HandoffStore {
    /// Wraps a backend without checking connectivity.
    #[must_use]
    pub fn new(backend: Arc<dyn HandoffBackend>, config: &StoreConfig) -> Self {
        Self {
            backend,
            default_ttl: config.default_ttl(),
            task_result_ttl: config.task_result_ttl(),
            scan_batch_size: config.scan_batch_size.max(1),
        }
    }

    /// Wraps a backend after verifying it is reachable.
    ///
    /// # Errors
    ///
    /// A failed connection is fatal and is returned as-is.
    pub async fn connect(
        backend: Arc<dyn HandoffBackend>,
        config: &StoreConfig,
    ) -> Result<Self, StoreError> {
        backend.ping().await.map_err(|e| match e {
            StoreError::Connection(_) => e,
            other => StoreError::Connection(other.to_string()),
        })?;
        Ok(Self::new(backend, config))
    }

    /// Builds and connects the backend named by `config.url`.
    ///
    /// `memory://` selects [`InMemoryBackend`]; `redis://` and `rediss://`
    /// require the `redis` feature.
    pub async fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config.url.as_str();
        if url.starts_with("memory://") {
            return Self::connect(Arc::new(InMemoryBackend::new()), config).await;
        }
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            return Self::connect_redis(config).await;
        }
        Err(StoreError::Connection(format!("unsupported store url: {url}")))
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut backend = super::RedisBackend::new(&config.url).await?;
        if let Some(prefix) = &config.key_prefix {
            backend = backend.with_prefix(prefix.clone());
        }
        Self::connect(Arc::new(backend), config).await
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(config: &StoreConfig) -> Result<Self, StoreError> {
        Err(StoreError::Connection(format!(
            "{} requires the `redis` feature",
            config.url
        )))
    }

    /// A store over a fresh in-memory backend with default settings.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()), &StoreConfig::default())
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn HandoffBackend> {
        &self.backend
    }

    /// TTL applied when a write does not name one.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Serializes `value` as JSON and stores it, replacing any existing value.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>)
    where
        T: Serialize + ?Sized,
    {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(e) => {
                let err = StoreError::Encode {
                    key: key.to_string(),
                    message: e.to_string(),
                };
                warn!(error = %err, "Handoff write skipped");
                return;
            }
        };

        let ttl = ttl
            .unwrap_or(self.default_ttl)
            .min(Duration::from_secs(MAX_TTL_SECS));
        if let Err(e) = self.backend.set_with_ttl(key, &encoded, ttl).await {
            warn!(key, error = %e, "Handoff write failed");
        }
    }

    /// Reads and decodes a value.
    ///
    /// Missing keys, backend failures and undecodable payloads all return `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Handoff read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Handoff payload could not be decoded");
                None
            }
        }
    }

    /// Deletes a key. Returns false if it did not exist or the delete failed.
    pub async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key, error = %e, "Handoff delete failed");
                false
            }
        }
    }

    /// Deletes every key matching the glob `pattern`, one scan page at a time.
    ///
    /// Returns the number of keys actually removed. A failure mid-scan stops
    /// the iteration and returns the count so far.
    pub async fn delete_pattern(&self, pattern: &str) -> usize {
        let mut cursor = 0;
        let mut removed = 0;
        loop {
            let page = match self.backend.scan(cursor, pattern, self.scan_batch_size).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(pattern, removed, error = %e, "Handoff pattern scan failed");
                    return removed;
                }
            };

            for key in &page.keys {
                if self.delete(key).await {
                    removed += 1;
                }
            }

            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        debug!(pattern, removed, "Deleted handoff keys");
        removed
    }

    /// Mirrors a task's terminal result.
    pub async fn set_task_result(&self, task_id: &str, result: &TaskResult) {
        self.set(&task_result_key(task_id), result, Some(self.task_result_ttl))
            .await;
    }

    /// Reads a mirrored task result.
    pub async fn get_task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.get(&task_result_key(task_id)).await
    }

    /// Removes every key scoped to a pipeline.
    pub async fn clear_pipeline(&self, pipeline_id: &str) -> usize {
        self.delete_pattern(&pipeline_key(pipeline_id, "*")).await
    }
}
