//! Multi-pass batch execution with per-item retry and checkpoints.
//!
//! A pass runs every pending item concurrently, each holding one permit of
//! the shared semaphore for the duration of its external call. After every
//! pass the tracker state is written to `pipeline:{id}:checkpoint:{stage}`,
//! so a restarted run re-invokes only the items that have not completed.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::events::EngineEvent;
use crate::jobs::panic_message;
use crate::orchestration::OrchestrationContext;
use crate::retry::{BatchCheckpoint, BatchRetryTracker, BatchSummary};
use crate::store::pipeline_key;

/// Result of a batch run.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Stage-level summary, also persisted in the handoff store.
    pub summary: BatchSummary,
    /// Payloads of completed items, ordered by index.
    pub outputs: Vec<(usize, String)>,
    /// Passes executed by this run.
    pub passes: u32,
}

/// Runs one stage's items in passes until each completes or spends its budget.
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    ctx: Arc<OrchestrationContext>,
    pipeline_id: String,
    stage: String,
    config: BatchConfig,
}

impl BatchExecutor {
    /// Creates an executor using the context's batch configuration.
    #[must_use]
    pub fn new(ctx: Arc<OrchestrationContext>, pipeline_id: impl Into<String>, stage: impl Into<String>) -> Self {
        let config = ctx.config().batch.clone();
        Self {
            ctx,
            pipeline_id: pipeline_id.into(),
            stage: stage.into(),
            config,
        }
    }

    /// Overrides the batch configuration.
    #[must_use]
    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Batch configuration in effect.
    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub(crate) fn context(&self) -> &Arc<OrchestrationContext> {
        &self.ctx
    }

    /// Handoff key of this stage's checkpoint.
    #[must_use]
    pub fn checkpoint_key(&self) -> String {
        pipeline_key(&self.pipeline_id, &format!("checkpoint:{}", self.stage))
    }

    /// Handoff key of this stage's summary.
    #[must_use]
    pub fn summary_key(&self) -> String {
        summary_key(&self.pipeline_id, &self.stage)
    }

    /// Restores the tracker from the stored checkpoint, or starts fresh.
    pub async fn load_tracker(&self, total: usize) -> BatchRetryTracker<String> {
        let checkpoint: Option<BatchCheckpoint<String>> =
            self.ctx.store().get(&self.checkpoint_key()).await;
        match checkpoint {
            Some(checkpoint) => {
                let tracker =
                    BatchRetryTracker::from_checkpoint(total, self.config.max_retries, checkpoint);
                info!(
                    stage = %self.stage,
                    completed = tracker.completed_count(),
                    pending = tracker.get_pending_indices().len(),
                    "Resuming batch from checkpoint"
                );
                tracker
            }
            None => BatchRetryTracker::new(total, self.config.max_retries),
        }
    }

    pub(crate) async fn save_checkpoint(&self, tracker: &BatchRetryTracker<String>) {
        self.ctx
            .store()
            .set(
                &self.checkpoint_key(),
                &tracker.checkpoint(),
                Some(self.config.checkpoint_ttl()),
            )
            .await;
    }

    pub(crate) async fn finish(&self, tracker: &BatchRetryTracker<String>, passes: u32) -> BatchOutcome {
        let summary = tracker.get_summary();
        self.ctx
            .store()
            .set(&self.summary_key(), &summary, Some(self.config.checkpoint_ttl()))
            .await;
        info!(
            stage = %self.stage,
            status = %summary.status,
            completed = summary.completed_count,
            total = summary.total,
            passes,
            "Batch finished"
        );
        BatchOutcome {
            summary,
            outputs: tracker.completed_payloads(),
            passes,
        }
    }

    /// Sleeps before the next pass. Returns false when nothing is pending.
    pub(crate) async fn pause_between_passes(&self, tracker: &BatchRetryTracker<String>) -> bool {
        let policy = self.config.pass_policy();
        match tracker.next_pass_delay(&policy, self.config.delay_basis) {
            Some(delay) => {
                debug!(
                    stage = %self.stage,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Waiting before next pass"
                );
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }

    pub(crate) fn emit_pass(&self, pass: u32, tracker: &BatchRetryTracker<String>) {
        self.ctx.events().try_emit(&EngineEvent::BatchPass {
            pipeline_id: self.pipeline_id.clone(),
            stage: self.stage.clone(),
            pass,
            completed: tracker.completed_count(),
            pending: tracker.get_pending_indices().len(),
            failed: tracker.get_failed_indices().len(),
        });
    }

    /// Runs `item` for every index in `0..total` that is not yet complete.
    ///
    /// `item` returns the payload to keep for the index (usually an artifact
    /// URL). Errors and panics count against the item's retry budget.
    pub async fn run<F, Fut>(&self, total: usize, item: F) -> BatchOutcome
    where
        F: Fn(usize) -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<String>> + Send,
    {
        let mut tracker = self.load_tracker(total).await;
        let mut passes = 0;

        loop {
            let pending = tracker.get_pending_indices();
            if pending.is_empty() {
                break;
            }
            passes += 1;
            debug!(stage = %self.stage, pass = passes, items = pending.len(), "Starting batch pass");

            let attempts = pending.iter().map(|&index| {
                let item = &item;
                async move { (index, self.attempt(index, item(index)).await) }
            });
            for (index, outcome) in futures::future::join_all(attempts).await {
                match outcome {
                    Ok(payload) => tracker.mark_success(index, payload),
                    Err(e) => {
                        let message = format!("{e:#}");
                        warn!(stage = %self.stage, index, error = %message, "Batch item failed");
                        tracker.mark_failure(index, message);
                    }
                }
            }

            self.save_checkpoint(&tracker).await;
            self.emit_pass(passes, &tracker);

            if !self.pause_between_passes(&tracker).await {
                break;
            }
        }

        self.finish(&tracker, passes).await
    }

    /// Runs one external call under a permit, converting panics to errors.
    pub(crate) async fn attempt<Fut, T>(&self, index: usize, call: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let _permit = self.ctx.acquire().await?;
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow::anyhow!(
                "item {index} panicked: {}",
                panic_message(panic.as_ref())
            )),
        }
    }
}

/// Handoff key of a stage summary.
#[must_use]
pub fn summary_key(pipeline_id: &str, stage: &str) -> String {
    pipeline_key(pipeline_id, &format!("summary:{stage}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::retry::BatchStatus;
    use crate::store::HandoffStore;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn executor(max_retries: u32) -> BatchExecutor {
        let mut config = EngineConfig::default();
        config.batch.max_retries = max_retries;
        config.batch.pass_delay_ms = 100;
        let ctx = Arc::new(OrchestrationContext::new(config, HandoffStore::in_memory()));
        BatchExecutor::new(ctx, "p1", "images")
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_items_complete_in_one_pass() {
        let exec = executor(3);
        let outcome = exec.run(3, |i| async move { Ok(format!("url-{i}")) }).await;

        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.summary.status, BatchStatus::Completed);
        assert_eq!(
            outcome.outputs,
            vec![(0, "url-0".to_string()), (1, "url-1".to_string()), (2, "url-2".to_string())]
        );

        let stored: Option<BatchSummary> = exec.context().store().get(&exec.summary_key()).await;
        assert_eq!(stored, Some(outcome.summary));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_retried_until_budget_spent() {
        let exec = executor(2);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let outcome = {
            let calls = calls.clone();
            exec.run(3, move |i| {
                calls.lock().push(i);
                async move {
                    if i == 0 {
                        Ok("ok".to_string())
                    } else {
                        Err(anyhow::anyhow!("provider error {i}"))
                    }
                }
            })
            .await
        };

        assert_eq!(outcome.passes, 2);
        assert_eq!(*calls.lock(), vec![0, 1, 2, 1, 2]);
        assert_eq!(outcome.summary.status, BatchStatus::PartiallyCompleted);
        assert_eq!(outcome.summary.completed_count, 1);
        let failed: Vec<(usize, u32, Option<String>)> = outcome
            .summary
            .failed_items
            .iter()
            .map(|f| (f.index, f.retry_count, f.last_error.clone()))
            .collect();
        assert_eq!(
            failed,
            vec![
                (1, 2, Some("provider error 1".to_string())),
                (2, 2, Some("provider error 2".to_string())),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_reinvokes_only_incomplete_items() {
        let exec = executor(3);
        let checkpoint = BatchCheckpoint {
            completed: BTreeMap::from([
                (0, "u0".to_string()),
                (2, "u2".to_string()),
                (4, "u4".to_string()),
            ]),
            retry_counts: BTreeMap::from([(1, 1), (3, 1)]),
            last_errors: BTreeMap::from([(1, "timeout".to_string()), (3, "timeout".to_string())]),
        };
        exec.context()
            .store()
            .set(&exec.checkpoint_key(), &checkpoint, None)
            .await;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let outcome = {
            let calls = calls.clone();
            exec.run(5, move |i| {
                calls.lock().push(i);
                async move { Ok(format!("u{i}")) }
            })
            .await
        };

        assert_eq!(*calls.lock(), vec![1, 3]);
        assert_eq!(outcome.summary.status, BatchStatus::Completed);
        assert_eq!(outcome.outputs.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_item_counts_as_failure() {
        let exec = executor(1);
        let outcome = exec
            .run(2, |i| async move {
                if i == 1 {
                    panic!("decoder crashed");
                }
                Ok("fine".to_string())
            })
            .await;

        assert_eq!(outcome.summary.status, BatchStatus::PartiallyCompleted);
        assert_eq!(
            outcome.summary.failed_items[0].last_error.as_deref(),
            Some("item 1 panicked: decoder crashed")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pass_delay_follows_backoff() {
        let exec = executor(3);
        let start = tokio::time::Instant::now();
        let outcome = exec
            .run(1, |_| async { Err::<String, _>(anyhow::anyhow!("always")) })
            .await;

        assert_eq!(outcome.passes, 3);
        assert_eq!(outcome.summary.status, BatchStatus::Failed);
        // 100ms after pass 1, 200ms after pass 2, nothing after the budget is spent
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
