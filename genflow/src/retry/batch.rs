//! Per-item retry bookkeeping for batch stages.
//!
//! A batch of `total_items` items is partitioned at all times into three
//! disjoint sets: completed, retryable (`retry_count < max_retries`) and
//! exhausted (`retry_count >= max_retries`). A processing loop runs passes
//! over [`BatchRetryTracker::get_pending_indices`] until that set is empty,
//! persisting a [`BatchCheckpoint`] between passes so the batch can resume.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::RetryPolicy;

/// Outcome of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every item succeeded.
    Completed,
    /// Some, but not all, items succeeded.
    PartiallyCompleted,
    /// No item succeeded.
    Failed,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::PartiallyCompleted => write!(f, "partially_completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Detail of an item that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Item index.
    pub index: usize,
    /// Failures recorded for the item.
    pub retry_count: u32,
    /// Last error text, if any.
    pub last_error: Option<String>,
}

/// Persistable summary of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Overall status.
    pub status: BatchStatus,
    /// Number of items in the batch.
    pub total: usize,
    /// Number of completed items.
    pub completed_count: usize,
    /// Per-item retry budget.
    pub max_retries: u32,
    /// Items that did not complete, ordered by index.
    pub failed_items: Vec<FailedItem>,
}

impl BatchSummary {
    /// Returns true if at least one item completed.
    #[must_use]
    pub fn has_output(&self) -> bool {
        self.completed_count > 0
    }
}

/// Serializable tracker state, persisted between passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
pub struct BatchCheckpoint<T> {
    /// Completed payloads keyed by index.
    pub completed: BTreeMap<usize, T>,
    /// Failure counts keyed by index.
    pub retry_counts: BTreeMap<usize, u32>,
    /// Last error text keyed by index.
    pub last_errors: BTreeMap<usize, String>,
}

/// Which pending item drives the delay before the next pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassDelayBasis {
    /// Highest retry count among pending items.
    #[default]
    MostRetried,
    /// Lowest retry count among pending items.
    LeastRetried,
}

/// Per-item success/failure/retry bookkeeping.
#[derive(Debug, Clone)]
pub struct BatchRetryTracker<T> {
    total_items: usize,
    max_retries: u32,
    completed: BTreeMap<usize, T>,
    retry_counts: BTreeMap<usize, u32>,
    last_errors: BTreeMap<usize, String>,
}

impl<T: Clone> BatchRetryTracker<T> {
    /// Creates a tracker with every item pending and a zero retry count.
    #[must_use]
    pub fn new(total_items: usize, max_retries: u32) -> Self {
        Self {
            total_items,
            max_retries,
            completed: BTreeMap::new(),
            retry_counts: (0..total_items).map(|i| (i, 0)).collect(),
            last_errors: BTreeMap::new(),
        }
    }

    /// Restores a tracker from a persisted checkpoint.
    ///
    /// Entries outside `0..total_items` are dropped.
    #[must_use]
    pub fn from_checkpoint(
        total_items: usize,
        max_retries: u32,
        checkpoint: BatchCheckpoint<T>,
    ) -> Self {
        let mut tracker = Self::new(total_items, max_retries);
        tracker
            .completed
            .extend(checkpoint.completed.into_iter().filter(|(i, _)| *i < total_items));
        tracker
            .retry_counts
            .extend(checkpoint.retry_counts.into_iter().filter(|(i, _)| *i < total_items));
        tracker
            .last_errors
            .extend(checkpoint.last_errors.into_iter().filter(|(i, _)| *i < total_items));
        tracker
    }

    /// Snapshot of the mutable state.
    #[must_use]
    pub fn checkpoint(&self) -> BatchCheckpoint<T> {
        BatchCheckpoint {
            completed: self.completed.clone(),
            retry_counts: self.retry_counts.clone(),
            last_errors: self.last_errors.clone(),
        }
    }

    /// Number of items in the batch.
    #[must_use]
    pub fn total_items(&self) -> usize {
        self.total_items
    }

    /// Per-item retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Records a success. Overwrites any earlier payload for the index.
    pub fn mark_success(&mut self, index: usize, payload: T) {
        if index >= self.total_items {
            tracing::warn!(index, total = self.total_items, "Ignoring success for unknown item");
            return;
        }
        self.completed.insert(index, payload);
    }

    /// Records a failure: bumps the retry count and replaces the last error.
    pub fn mark_failure(&mut self, index: usize, error: impl Into<String>) {
        if index >= self.total_items {
            tracing::warn!(index, total = self.total_items, "Ignoring failure for unknown item");
            return;
        }
        *self.retry_counts.entry(index).or_insert(0) += 1;
        self.last_errors.insert(index, error.into());
    }

    /// Failures recorded for an index.
    #[must_use]
    pub fn retry_count(&self, index: usize) -> u32 {
        self.retry_counts.get(&index).copied().unwrap_or(0)
    }

    /// Payload of a completed index.
    #[must_use]
    pub fn payload(&self, index: usize) -> Option<&T> {
        self.completed.get(&index)
    }

    /// Indices eligible for the next pass.
    #[must_use]
    pub fn get_pending_indices(&self) -> Vec<usize> {
        (0..self.total_items)
            .filter(|i| !self.completed.contains_key(i) && self.retry_count(*i) < self.max_retries)
            .collect()
    }

    /// Indices whose retry budget is spent.
    #[must_use]
    pub fn get_failed_indices(&self) -> Vec<usize> {
        (0..self.total_items)
            .filter(|i| !self.completed.contains_key(i) && self.retry_count(*i) >= self.max_retries)
            .collect()
    }

    /// Number of completed items.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Returns true if every item completed.
    #[must_use]
    pub fn is_all_completed(&self) -> bool {
        self.completed.len() == self.total_items
    }

    /// Returns true if some, but not all, items completed.
    #[must_use]
    pub fn is_partial_failure(&self) -> bool {
        !self.completed.is_empty() && self.completed.len() < self.total_items
    }

    /// Completed payloads ordered by index.
    #[must_use]
    pub fn completed_payloads(&self) -> Vec<(usize, T)> {
        self.completed.iter().map(|(i, p)| (*i, p.clone())).collect()
    }

    /// Builds the persistable summary.
    #[must_use]
    pub fn get_summary(&self) -> BatchSummary {
        let status = if self.is_all_completed() {
            BatchStatus::Completed
        } else if self.completed.is_empty() {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyCompleted
        };

        let failed_items = (0..self.total_items)
            .filter(|i| !self.completed.contains_key(i))
            .map(|index| FailedItem {
                index,
                retry_count: self.retry_count(index),
                last_error: self.last_errors.get(&index).cloned(),
            })
            .collect();

        BatchSummary {
            status,
            total: self.total_items,
            completed_count: self.completed.len(),
            max_retries: self.max_retries,
            failed_items,
        }
    }

    /// Delay to wait before the next pass over the pending items.
    ///
    /// Returns `None` when nothing is pending.
    #[must_use]
    pub fn next_pass_delay(&self, policy: &RetryPolicy, basis: PassDelayBasis) -> Option<Duration> {
        let counts = self.get_pending_indices().into_iter().map(|i| self.retry_count(i));
        let driving = match basis {
            PassDelayBasis::MostRetried => counts.max(),
            PassDelayBasis::LeastRetried => counts.min(),
        }?;
        Some(policy.delay_for(driving))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;
    use pretty_assertions::assert_eq;

    fn assert_partition(tracker: &BatchRetryTracker<String>) {
        let pending = tracker.get_pending_indices();
        let failed = tracker.get_failed_indices();
        assert_eq!(
            tracker.completed_count() + pending.len() + failed.len(),
            tracker.total_items()
        );
        for i in 0..tracker.total_items() {
            let memberships = usize::from(tracker.payload(i).is_some())
                + usize::from(pending.contains(&i))
                + usize::from(failed.contains(&i));
            assert_eq!(memberships, 1, "index {i} must be in exactly one set");
        }
    }

    #[test]
    fn test_new_tracker_all_pending() {
        let tracker: BatchRetryTracker<String> = BatchRetryTracker::new(4, 3);
        assert_eq!(tracker.get_pending_indices(), vec![0, 1, 2, 3]);
        assert!(tracker.get_failed_indices().is_empty());
        assert!(!tracker.is_all_completed());
        assert!(!tracker.is_partial_failure());
        assert_partition(&tracker);
    }

    #[test]
    fn test_partition_holds_through_mixed_updates() {
        let mut tracker = BatchRetryTracker::new(6, 2);
        let script: &[(usize, bool)] = &[
            (0, true),
            (1, false),
            (2, false),
            (2, false),
            (3, true),
            (1, true),
            (4, false),
            (4, false),
            (4, false),
            (5, false),
        ];
        for (index, success) in script {
            if *success {
                tracker.mark_success(*index, format!("payload-{index}"));
            } else {
                tracker.mark_failure(*index, "boom");
            }
            assert_partition(&tracker);
        }
        assert_eq!(tracker.get_failed_indices(), vec![2, 4]);
        assert_eq!(tracker.get_pending_indices(), vec![5]);
    }

    #[test]
    fn test_mark_success_idempotent() {
        let mut tracker = BatchRetryTracker::new(2, 3);
        tracker.mark_failure(0, "first");
        tracker.mark_success(0, "a".to_string());
        tracker.mark_success(0, "b".to_string());

        assert_eq!(tracker.payload(0), Some(&"b".to_string()));
        assert_eq!(tracker.retry_count(0), 1);
        assert_eq!(tracker.completed_count(), 1);
    }

    #[test]
    fn test_mark_failure_overwrites_last_error() {
        let mut tracker: BatchRetryTracker<String> = BatchRetryTracker::new(1, 5);
        tracker.mark_failure(0, "timeout");
        tracker.mark_failure(0, "rate limited");

        let summary = tracker.get_summary();
        assert_eq!(summary.failed_items[0].retry_count, 2);
        assert_eq!(summary.failed_items[0].last_error.as_deref(), Some("rate limited"));
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut tracker = BatchRetryTracker::new(2, 1);
        tracker.mark_success(7, "x".to_string());
        tracker.mark_failure(9, "y");
        assert_eq!(tracker.completed_count(), 0);
        assert_partition(&tracker);
    }

    #[test]
    fn test_two_pass_partial_scenario() {
        // Outcomes per index on every attempt: success, fail, fail.
        let outcomes = [true, false, false];
        let mut tracker = BatchRetryTracker::new(3, 2);

        for _pass in 0..2 {
            for index in tracker.get_pending_indices() {
                if outcomes[index] {
                    tracker.mark_success(index, format!("ok-{index}"));
                } else {
                    tracker.mark_failure(index, format!("item {index} failed"));
                }
            }
        }

        let summary = tracker.get_summary();
        assert_eq!(summary.status, BatchStatus::PartiallyCompleted);
        assert_eq!(summary.completed_count, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.max_retries, 2);
        assert_eq!(
            summary.failed_items,
            vec![
                FailedItem {
                    index: 1,
                    retry_count: 2,
                    last_error: Some("item 1 failed".to_string()),
                },
                FailedItem {
                    index: 2,
                    retry_count: 2,
                    last_error: Some("item 2 failed".to_string()),
                },
            ]
        );
        assert!(tracker.get_pending_indices().is_empty());
        assert!(tracker.is_partial_failure());
    }

    #[test]
    fn test_summary_status_extremes() {
        let mut all = BatchRetryTracker::new(2, 1);
        all.mark_success(0, "a".to_string());
        all.mark_success(1, "b".to_string());
        assert_eq!(all.get_summary().status, BatchStatus::Completed);
        assert!(all.get_summary().failed_items.is_empty());

        let mut none: BatchRetryTracker<String> = BatchRetryTracker::new(2, 1);
        none.mark_failure(0, "x");
        none.mark_failure(1, "y");
        assert_eq!(none.get_summary().status, BatchStatus::Failed);
        assert!(!none.get_summary().has_output());
    }

    #[test]
    fn test_resume_from_checkpoint() {
        let mut tracker = BatchRetryTracker::new(5, 3);
        for i in [0, 2, 4] {
            tracker.mark_success(i, format!("p{i}"));
        }
        tracker.mark_failure(1, "e1");
        tracker.mark_failure(3, "e3");

        let json = serde_json::to_string(&tracker.checkpoint()).unwrap();
        let checkpoint: BatchCheckpoint<String> = serde_json::from_str(&json).unwrap();
        let restored = BatchRetryTracker::from_checkpoint(5, 3, checkpoint);

        assert_eq!(restored.get_pending_indices(), vec![1, 3]);
        assert_eq!(restored.retry_count(3), 1);
        assert_eq!(restored.payload(4), Some(&"p4".to_string()));
    }

    #[test]
    fn test_checkpoint_out_of_range_dropped() {
        let mut checkpoint = BatchCheckpoint {
            completed: BTreeMap::new(),
            retry_counts: BTreeMap::new(),
            last_errors: BTreeMap::new(),
        };
        checkpoint.completed.insert(10, "stale".to_string());
        checkpoint.retry_counts.insert(1, 2);

        let tracker = BatchRetryTracker::from_checkpoint(2, 2, checkpoint);
        assert_eq!(tracker.completed_count(), 0);
        assert_eq!(tracker.get_failed_indices(), vec![1]);
    }

    #[test]
    fn test_next_pass_delay_basis() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(10_000)
            .with_backoff(BackoffPolicy::Exponential);
        let mut tracker: BatchRetryTracker<String> = BatchRetryTracker::new(2, 5);
        tracker.mark_failure(0, "x");
        for _ in 0..3 {
            tracker.mark_failure(1, "y");
        }

        assert_eq!(
            tracker.next_pass_delay(&policy, PassDelayBasis::MostRetried),
            Some(Duration::from_millis(400))
        );
        assert_eq!(
            tracker.next_pass_delay(&policy, PassDelayBasis::LeastRetried),
            Some(Duration::from_millis(100))
        );

        tracker.mark_success(0, "a".to_string());
        tracker.mark_success(1, "b".to_string());
        assert_eq!(tracker.next_pass_delay(&policy, PassDelayBasis::MostRetried), None);
    }
}
