//! Durable handoff store.
//!
//! Stage executions may run in isolated contexts, so anything a downstream
//! stage needs travels through a TTL-scoped key/value store rather than
//! process memory. The store is advisory: after a successful connection,
//! write failures are logged and dropped, and read failures look like misses.
//!
//! # Key schema
//!
//! | Key | Value |
//! |-----|-------|
//! | `task_result:{task_id}` | [`TaskResult`](crate::dag::TaskResult) |
//! | `pipeline:{pipeline_id}:{suffix}` | stage outputs, checkpoints, summaries |

mod handoff;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use handoff::HandoffStore;
pub use memory::{glob_to_regex, InMemoryBackend};
#[cfg(feature = "redis")]
pub use self::redis::RedisBackend;

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

use crate::errors::StoreError;

/// One page of a cursor-based key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call; `0` once iteration is finished.
    pub cursor: u64,
    /// Matching keys found in this page.
    pub keys: Vec<String>,
}

/// Raw key/value operations a handoff backend provides.
///
/// Backends report every failure; the degrade-silently policy lives in
/// [`HandoffStore`].
#[async_trait]
pub trait HandoffBackend: Send + Sync + Debug {
    /// Verifies the backend is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Writes `value` and its expiry in one operation, replacing any existing value.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Reads a value. Expired keys are absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Deletes a key, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Examines up to `count` keys starting at `cursor` (0 starts a new scan)
    /// and returns the ones matching the glob `pattern`.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage, StoreError>;
}

/// Key under which a task's terminal result is mirrored.
#[must_use]
pub fn task_result_key(task_id: &str) -> String {
    format!("task_result:{task_id}")
}

/// Key for pipeline-scoped handoff data.
#[must_use]
pub fn pipeline_key(pipeline_id: &str, suffix: &str) -> String {
    format!("pipeline:{pipeline_id}:{suffix}")
}
