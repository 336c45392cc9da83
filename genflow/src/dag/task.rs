//! Task units and the work they run.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::errors::TaskError;

/// Identifier assigned to a unit at registration.
pub type TaskId = String;

/// Input handed to a unit's work.
#[derive(Debug, Clone, Default)]
pub struct TaskInput {
    /// The unit's id.
    pub task_id: TaskId,
    /// Arguments supplied at registration.
    pub args: Value,
    /// Results of completed dependencies, keyed by dependency name.
    pub dependencies: BTreeMap<String, Value>,
}

impl TaskInput {
    /// Returns a dependency's result by name.
    #[must_use]
    pub fn dependency(&self, name: &str) -> Option<&Value> {
        self.dependencies.get(name)
    }
}

/// The asynchronous work a task unit performs.
#[async_trait]
pub trait Work: Send + Sync {
    /// Runs the work.
    async fn run(&self, input: TaskInput) -> Result<Value, TaskError>;

    /// Whether the runner should hold a concurrency permit while this work runs.
    ///
    /// Work that fans out and acquires permits per item must return false.
    fn holds_permit(&self) -> bool {
        true
    }
}

/// Adapter turning an async closure into [`Work`].
pub struct FnWork<F> {
    f: F,
    holds_permit: bool,
}

impl<F> FnWork<F> {
    /// Wraps `f`; the runner holds a permit while it runs.
    pub fn new(f: F) -> Self {
        Self {
            f,
            holds_permit: true,
        }
    }

    /// Runs `f` without holding a permit.
    #[must_use]
    pub fn without_permit(mut self) -> Self {
        self.holds_permit = false;
        self
    }
}

#[async_trait]
impl<F, Fut> Work for FnWork<F>
where
    F: Fn(TaskInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    async fn run(&self, input: TaskInput) -> Result<Value, TaskError> {
        (self.f)(input).await
    }

    fn holds_permit(&self) -> bool {
        self.holds_permit
    }
}

/// Shorthand for `Arc::new(FnWork::new(f))`.
pub fn work_fn<F, Fut>(f: F) -> Arc<dyn Work>
where
    F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    Arc::new(FnWork::new(f))
}

/// A registered unit. Immutable once registered and consumed by one execution.
#[derive(Clone)]
pub struct TaskUnit {
    /// Unique id.
    pub id: TaskId,
    /// Human-readable name, used in logs and dependency errors.
    pub name: String,
    /// The work to run.
    pub work: Arc<dyn Work>,
    /// Arguments passed to the work.
    pub args: Value,
    /// Ids of units that must finish first.
    pub depends_on: Vec<TaskId>,
}

impl fmt::Debug for TaskUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("args", &self.args)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_work_runs_closure() {
        let work = work_fn(|input: TaskInput| async move {
            Ok(json!({"echo": input.args, "dep": input.dependency("a").cloned()}))
        });
        assert!(work.holds_permit());

        let mut input = TaskInput {
            task_id: "t".to_string(),
            args: json!(5),
            ..TaskInput::default()
        };
        input.dependencies.insert("a".to_string(), json!("x"));

        let out = work.run(input).await.unwrap();
        assert_eq!(out, json!({"echo": 5, "dep": "x"}));
    }

    #[test]
    fn test_without_permit() {
        let work = FnWork::new(|_: TaskInput| async { Ok::<_, TaskError>(Value::Null) }).without_permit();
        assert!(!work.holds_permit());
    }
}
