//! Submit/poll/timeout batches for asynchronous job providers.
//!
//! Each pass submits every pending item, then sweeps the provider at the
//! configured interval until all jobs settle or the poll timeout elapses.
//! Jobs still unsettled at the deadline fail for that pass and are
//! resubmitted on the next one if they have budget left.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::batch::{BatchExecutor, BatchOutcome};
use super::providers::{JobGenerator, JobState};
use crate::config::PollingConfig;
use crate::retry::BatchRetryTracker;

/// Outcome of submitting one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The provider accepted a job with this id.
    Submitted(String),
    /// The item cannot be produced; it is failed without retry.
    Ineligible(String),
}

/// Batch executor for providers that work through submitted jobs.
#[derive(Clone)]
pub struct PollingExecutor {
    batch: BatchExecutor,
    polling: PollingConfig,
    jobs: Arc<dyn JobGenerator>,
}

impl std::fmt::Debug for PollingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingExecutor")
            .field("batch", &self.batch)
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

impl PollingExecutor {
    /// Wraps a batch executor; polling settings come from its context.
    #[must_use]
    pub fn new(batch: BatchExecutor, jobs: Arc<dyn JobGenerator>) -> Self {
        let polling = batch.context().config().polling.clone();
        Self {
            batch,
            polling,
            jobs,
        }
    }

    /// Overrides the polling settings.
    #[must_use]
    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    /// The wrapped batch executor.
    #[must_use]
    pub fn batch(&self) -> &BatchExecutor {
        &self.batch
    }

    /// Runs the protocol over `0..total`.
    ///
    /// `submit` starts a job for an index. `collect` turns a completed job
    /// into the payload kept for the index (typically fetch and upload).
    pub async fn run<S, SFut, C, CFut>(&self, total: usize, submit: S, collect: C) -> BatchOutcome
    where
        S: Fn(usize) -> SFut + Send + Sync,
        SFut: Future<Output = anyhow::Result<Submission>> + Send,
        C: Fn(usize, String) -> CFut + Send + Sync,
        CFut: Future<Output = anyhow::Result<String>> + Send,
    {
        let stage = self.batch.stage().to_string();
        let mut tracker = self.batch.load_tracker(total).await;
        let mut passes = 0;

        loop {
            let pending = tracker.get_pending_indices();
            if pending.is_empty() {
                break;
            }
            passes += 1;
            debug!(stage = %stage, pass = passes, items = pending.len(), "Submitting jobs");

            let submissions = pending.iter().map(|&index| {
                let submit = &submit;
                async move { (index, self.batch.attempt(index, submit(index)).await) }
            });
            let mut in_flight = BTreeMap::new();
            for (index, outcome) in futures::future::join_all(submissions).await {
                match outcome {
                    Ok(Submission::Submitted(job_id)) => {
                        in_flight.insert(index, job_id);
                    }
                    Ok(Submission::Ineligible(reason)) => exhaust(&mut tracker, index, &reason),
                    Err(e) => {
                        let message = format!("submit failed: {e:#}");
                        warn!(stage = %stage, index, error = %message, "Job submission failed");
                        tracker.mark_failure(index, message);
                    }
                }
            }

            self.poll_until_settled(&mut tracker, in_flight, &collect).await;

            self.batch.save_checkpoint(&tracker).await;
            self.batch.emit_pass(passes, &tracker);

            if !self.batch.pause_between_passes(&tracker).await {
                break;
            }
        }

        self.batch.finish(&tracker, passes).await
    }

    async fn poll_until_settled<C, CFut>(
        &self,
        tracker: &mut BatchRetryTracker<String>,
        mut in_flight: BTreeMap<usize, String>,
        collect: &C,
    ) where
        C: Fn(usize, String) -> CFut + Send + Sync,
        CFut: Future<Output = anyhow::Result<String>> + Send,
    {
        let deadline = Instant::now() + self.polling.timeout();

        while !in_flight.is_empty() {
            if Instant::now() >= deadline {
                let timeout_secs = self.polling.timeout_secs;
                for (index, job_id) in std::mem::take(&mut in_flight) {
                    warn!(stage = %self.batch.stage(), index, job_id = %job_id, "Job timed out");
                    tracker.mark_failure(index, format!("job {job_id} timed out after {timeout_secs}s"));
                }
                break;
            }

            tokio::time::sleep(self.polling.interval()).await;

            let sweep = in_flight.iter().map(|(&index, job_id)| async move {
                (index, self.jobs.check_status(job_id).await)
            });
            let states = futures::future::join_all(sweep).await;

            let mut settled = Vec::new();
            for (index, state) in states {
                match state {
                    Ok(JobState::Completed) => settled.push((index, None)),
                    Ok(JobState::Failed { reason }) => settled.push((index, Some(reason))),
                    Ok(JobState::Pending | JobState::Processing) => {}
                    Err(e) => {
                        debug!(stage = %self.batch.stage(), index, error = %e, "Status check failed; will poll again");
                    }
                }
            }

            let collections = settled.into_iter().filter_map(|(index, failure)| {
                let job_id = in_flight.remove(&index)?;
                Some(async move {
                    let outcome = match failure {
                        Some(reason) => Err(anyhow::anyhow!("job {job_id} failed: {reason}")),
                        None => self.batch.attempt(index, collect(index, job_id)).await,
                    };
                    (index, outcome)
                })
            });
            let collections: Vec<_> = collections.collect();
            for (index, outcome) in futures::future::join_all(collections).await {
                match outcome {
                    Ok(payload) => tracker.mark_success(index, payload),
                    Err(e) => {
                        let message = format!("{e:#}");
                        warn!(stage = %self.batch.stage(), index, error = %message, "Job item failed");
                        tracker.mark_failure(index, message);
                    }
                }
            }
        }
    }
}

fn exhaust(tracker: &mut BatchRetryTracker<String>, index: usize, reason: &str) {
    while tracker.retry_count(index) < tracker.max_retries() {
        tracker.mark_failure(index, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::orchestration::OrchestrationContext;
    use crate::retry::BatchStatus;
    use crate::store::HandoffStore;
    use crate::pipeline::providers::JobRequest;
    use crate::testing::ScriptedJobGenerator;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn executor(jobs: Arc<ScriptedJobGenerator>, max_retries: u32) -> PollingExecutor {
        let mut config = EngineConfig::default();
        config.batch.max_retries = max_retries;
        config.batch.pass_delay_ms = 100;
        config.polling.interval_ms = 1000;
        config.polling.timeout_secs = 10;
        let ctx = Arc::new(OrchestrationContext::new(config, HandoffStore::in_memory()));
        PollingExecutor::new(BatchExecutor::new(ctx, "p1", "video"), jobs)
    }

    fn request(index: usize) -> JobRequest {
        JobRequest {
            source_url: format!("img-{index}"),
            prompt: format!("page {index}"),
            seed: index as u64,
        }
    }

    async fn run(exec: &PollingExecutor, jobs: &Arc<ScriptedJobGenerator>, total: usize) -> BatchOutcome {
        exec.run(
            total,
            |index| {
                let jobs = jobs.clone();
                async move {
                    if index == 99 {
                        return Ok(Submission::Ineligible("no image".to_string()));
                    }
                    Ok(Submission::Submitted(jobs.submit(&request(index)).await?))
                }
            },
            |index, job_id| {
                let jobs = jobs.clone();
                async move {
                    let bytes = jobs.fetch(&job_id).await?;
                    Ok(format!("video-{index}-{}", bytes.len()))
                }
            },
        )
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_jobs_complete_after_polls() {
        let jobs = Arc::new(ScriptedJobGenerator::new().with_polls_until_done(2));
        let exec = executor(jobs.clone(), 3);

        let outcome = run(&exec, &jobs, 3).await;
        assert_eq!(outcome.summary.status, BatchStatus::Completed);
        assert_eq!(outcome.passes, 1);
        assert_eq!(jobs.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_jobs_are_resubmitted() {
        // source "img-1" never finishes on its first submission
        let jobs = Arc::new(ScriptedJobGenerator::new().with_stuck_first_submission("img-1"));
        let exec = executor(jobs.clone(), 3);

        let outcome = run(&exec, &jobs, 2).await;
        assert_eq!(outcome.summary.status, BatchStatus::Completed);
        assert_eq!(outcome.passes, 2);
        let resubmitted: Vec<_> = jobs
            .submitted()
            .into_iter()
            .filter(|r| r.source_url == "img-1")
            .collect();
        assert_eq!(resubmitted.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_counts_against_budget() {
        let jobs = Arc::new(ScriptedJobGenerator::new().with_failing_source("img-0"));
        let exec = executor(jobs.clone(), 2);

        let outcome = run(&exec, &jobs, 2).await;
        assert_eq!(outcome.summary.status, BatchStatus::PartiallyCompleted);
        let failed = &outcome.summary.failed_items[0];
        assert_eq!(failed.index, 0);
        assert_eq!(failed.retry_count, 2);
        assert!(failed.last_error.as_deref().unwrap().contains("failed: render error"));
    }

    #[test]
    fn test_exhaust_marks_item_failed() {
        let mut tracker: BatchRetryTracker<String> = BatchRetryTracker::new(2, 3);
        exhaust(&mut tracker, 1, "no image");
        assert_eq!(tracker.get_failed_indices(), vec![1]);
        assert_eq!(tracker.get_pending_indices(), vec![0]);
        assert_eq!(tracker.retry_count(1), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_bounds_a_pass() {
        let jobs = Arc::new(ScriptedJobGenerator::new().with_polls_until_done(u32::MAX));
        let exec = executor(jobs.clone(), 1);
        let start = Instant::now();

        let outcome = run(&exec, &jobs, 1).await;
        assert_eq!(outcome.summary.status, BatchStatus::Failed);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(12));
        assert!(outcome.summary.failed_items[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("timed out after 10s"));
    }
}
