//! Retry primitives.
//!
//! - [`retry_with_backoff`] retries an indivisible operation as a whole.
//! - [`BatchRetryTracker`] spends a retry budget per item of a batch.

mod backoff;
mod batch;

pub use backoff::{calculate_delay, retry_with_backoff, BackoffPolicy, JitterStrategy, RetryPolicy};
pub use batch::{
    BatchCheckpoint, BatchRetryTracker, BatchStatus, BatchSummary, FailedItem, PassDelayBasis,
};
