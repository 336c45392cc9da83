//! DAG task runner.
//!
//! Units are registered with explicit dependencies and executed with
//! [`TaskRunner::execute_dag`]. Each unit produces exactly one
//! [`TaskResult`], kept in process and mirrored to the handoff store.

mod result;
mod runner;
mod status;
mod task;

pub use result::TaskResult;
pub use runner::{DagOutcome, TaskRunner};
pub use status::TaskStatus;
pub use task::{work_fn, FnWork, TaskId, TaskInput, TaskUnit, Work};
