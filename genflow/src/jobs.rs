//! Registry of background pipeline jobs.
//!
//! Every spawned job keeps a handle here, so callers can query status, wait
//! for completion, and shut the whole set down with a grace period. Finished
//! jobs stay queryable for the retention window and are pruned on the next
//! spawn after it lapses.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::GenflowError;

/// Identifier of a background job.
pub type JobId = Uuid;

/// State of a background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    /// Still executing.
    Running,
    /// Finished without error.
    Succeeded,
    /// Returned an error or panicked.
    Failed {
        /// Error text.
        error: String,
    },
    /// Aborted before finishing.
    Cancelled,
}

impl JobStatus {
    /// Returns true once the job is no longer running.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Snapshot of a tracked job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    /// Job id.
    pub id: JobId,
    /// Caller-supplied label, usually a pipeline id.
    pub label: String,
    /// When the job was spawned.
    pub started_at: DateTime<Utc>,
    /// Current status.
    pub status: JobStatus,
}

struct JobEntry {
    label: String,
    started_at: DateTime<Utc>,
    status: Arc<watch::Sender<JobStatus>>,
    finished_at: Arc<Mutex<Option<Instant>>>,
    abort: AbortHandle,
}

impl JobEntry {
    fn expired(&self, now: Instant, retention: Duration) -> bool {
        self.finished_at
            .lock()
            .is_some_and(|at| now.duration_since(at) >= retention)
    }
}

/// Moves a job to `status` unless it already finished. The first terminal
/// status wins.
fn finish(
    tx: &watch::Sender<JobStatus>,
    finished_at: &Mutex<Option<Instant>>,
    status: JobStatus,
) -> bool {
    let changed = tx.send_if_modified(|current| {
        if current.is_finished() {
            false
        } else {
            *current = status;
            true
        }
    });
    if changed {
        *finished_at.lock() = Some(Instant::now());
    }
    changed
}

/// Handle to one background job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    label: String,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    /// Job id.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Caller-supplied label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Waits for the job to finish and returns its final status.
    pub async fn wait(mut self) -> JobStatus {
        wait_finished(&mut self.status).await
    }
}

async fn wait_finished(rx: &mut watch::Receiver<JobStatus>) -> JobStatus {
    match rx.wait_for(JobStatus::is_finished).await {
        Ok(status) => status.clone(),
        Err(_) => JobStatus::Cancelled,
    }
}

/// Finished-job retention used by [`JobRegistry::new`].
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(300);

/// Tracks background jobs spawned on the tokio runtime.
pub struct JobRegistry {
    jobs: DashMap<JobId, JobEntry>,
    retention: Duration,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    /// Creates an empty registry with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_JOB_RETENTION)
    }

    /// Creates an empty registry that forgets finished jobs after `retention`.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            retention,
        }
    }

    /// Spawns `job` in the background and tracks it.
    ///
    /// An `Err` or a panic marks the job failed; neither reaches the caller.
    pub fn spawn<F>(&self, label: impl Into<String>, job: F) -> JobHandle
    where
        F: Future<Output = Result<(), GenflowError>> + Send + 'static,
    {
        self.prune_expired();

        let id = Uuid::new_v4();
        let label = label.into();
        let (tx, rx) = watch::channel(JobStatus::Running);
        let tx = Arc::new(tx);
        let finished_at = Arc::new(Mutex::new(None));

        let task_tx = tx.clone();
        let task_finished_at = finished_at.clone();
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            let status = match AssertUnwindSafe(job).catch_unwind().await {
                Ok(Ok(())) => {
                    info!(job_id = %id, label = %task_label, "Job succeeded");
                    JobStatus::Succeeded
                }
                Ok(Err(e)) => {
                    error!(job_id = %id, label = %task_label, error = %e, "Job failed");
                    JobStatus::Failed {
                        error: e.to_string(),
                    }
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(job_id = %id, label = %task_label, panic = %message, "Job panicked");
                    JobStatus::Failed { error: message }
                }
            };
            finish(&task_tx, &task_finished_at, status);
        });

        self.jobs.insert(
            id,
            JobEntry {
                label: label.clone(),
                started_at: Utc::now(),
                status: tx,
                finished_at,
                abort: handle.abort_handle(),
            },
        );

        JobHandle {
            id,
            label,
            status: rx,
        }
    }

    /// Current status of a job.
    #[must_use]
    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.jobs.get(&id).map(|entry| entry.status.borrow().clone())
    }

    /// Snapshots every tracked job.
    #[must_use]
    pub fn list(&self) -> Vec<JobInfo> {
        self.jobs
            .iter()
            .map(|entry| JobInfo {
                id: *entry.key(),
                label: entry.label.clone(),
                started_at: entry.started_at,
                status: entry.status.borrow().clone(),
            })
            .collect()
    }

    /// Number of jobs still running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| !entry.status.borrow().is_finished())
            .count()
    }

    /// Waits for a job to finish.
    pub async fn wait(&self, id: JobId) -> Option<JobStatus> {
        let mut rx = self.jobs.get(&id).map(|entry| entry.status.subscribe())?;
        Some(wait_finished(&mut rx).await)
    }

    /// Drops every finished job, regardless of retention. Returns how many
    /// were removed.
    pub fn prune_finished(&self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| !entry.status.borrow().is_finished());
        before - self.jobs.len()
    }

    /// Drops jobs that finished longer than the retention window ago.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| !entry.expired(now, self.retention));
        before.saturating_sub(self.jobs.len())
    }

    /// Waits up to `grace` for running jobs, then aborts the rest.
    ///
    /// Returns the number of jobs aborted.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        let mut waiters: Vec<watch::Receiver<JobStatus>> =
            self.jobs.iter().map(|entry| entry.status.subscribe()).collect();

        let all_done = futures::future::join_all(waiters.iter_mut().map(wait_finished));
        if tokio::time::timeout(grace, all_done).await.is_ok() {
            return 0;
        }

        let mut aborted = 0;
        for entry in &self.jobs {
            if finish(&entry.status, &entry.finished_at, JobStatus::Cancelled) {
                entry.abort.abort();
                aborted += 1;
            }
        }
        warn!(aborted, grace_secs = grace.as_secs(), "Aborted jobs after shutdown grace period");
        aborted
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.len())
            .field("running", &self.running_count())
            .field("retention", &self.retention)
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_job_success_and_failure() {
        let registry = JobRegistry::new();
        let ok = registry.spawn("p1", async { Ok(()) });
        let bad = registry.spawn("p2", async { Err(GenflowError::Internal("nope".to_string())) });

        assert_eq!(ok.clone().wait().await, JobStatus::Succeeded);
        assert_eq!(
            bad.clone().wait().await,
            JobStatus::Failed {
                error: "Internal error: nope".to_string()
            }
        );
        assert_eq!(registry.status(ok.id()), Some(JobStatus::Succeeded));
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.prune_finished(), 2);
        assert!(registry.list().is_empty());
    }

    fn handle_panics() -> bool {
        true
    }

    #[tokio::test]
    async fn test_panicking_job_is_failed() {
        let registry = JobRegistry::new();
        let handle = registry.spawn("p", async {
            if handle_panics() {
                panic!("kaboom");
            }
            Ok(())
        });
        assert_eq!(
            handle.wait().await,
            JobStatus::Failed {
                error: "kaboom".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_after_grace() {
        let registry = JobRegistry::new();
        let quick = registry.spawn("quick", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });
        let slow = registry.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        assert_eq!(registry.running_count(), 2);
        assert_eq!(registry.shutdown(Duration::from_secs(5)).await, 1);
        assert_eq!(registry.wait(quick.id()).await, Some(JobStatus::Succeeded));
        assert_eq!(slow.wait().await, JobStatus::Cancelled);
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_pruned_after_retention() {
        let registry = JobRegistry::with_retention(Duration::from_secs(60));
        for i in 0..20 {
            let handle = registry.spawn(format!("p{i}"), async { Ok(()) });
            assert_eq!(handle.wait().await, JobStatus::Succeeded);
        }
        assert_eq!(registry.list().len(), 20);

        tokio::time::advance(Duration::from_secs(61)).await;
        let running = registry.spawn("live", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });

        let jobs = registry.list();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].label, "live");
        assert_eq!(registry.status(running.id()), Some(JobStatus::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_keeps_recent_results() {
        let registry = JobRegistry::with_retention(Duration::from_secs(60));
        let done = registry.spawn("done", async { Ok(()) });
        let id = done.id();
        assert_eq!(done.wait().await, JobStatus::Succeeded);

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.spawn("next", async { Ok(()) });
        assert_eq!(registry.status(id), Some(JobStatus::Succeeded));
    }

    #[test]
    fn test_cancel_does_not_overwrite_terminal_status() {
        let (tx, rx) = watch::channel(JobStatus::Running);
        let finished_at = Mutex::new(None);

        assert!(finish(&tx, &finished_at, JobStatus::Succeeded));
        assert!(finished_at.lock().is_some());
        assert!(!finish(&tx, &finished_at, JobStatus::Cancelled));
        assert_eq!(*rx.borrow(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_wait_unknown_job() {
        let registry = JobRegistry::new();
        assert!(registry.wait(Uuid::new_v4()).await.is_none());
    }
}
