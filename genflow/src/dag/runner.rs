//! Dependency-aware concurrent DAG execution.
//!
//! Every unit in an [`execute_dag`](TaskRunner::execute_dag) call is spawned
//! immediately. Each one waits on its dependencies' completion signals, so a
//! unit starts as soon as everything it needs has finished, and independent
//! units run in parallel up to the shared semaphore's limit.

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::{TaskId, TaskInput, TaskResult, TaskStatus, TaskUnit, Work};
use crate::errors::{GenflowError, Result, TaskError};
use crate::events::EngineEvent;
use crate::jobs::panic_message;
use crate::observability::task_span;
use crate::orchestration::OrchestrationContext;

type Signals = Arc<HashMap<TaskId, watch::Receiver<Option<TaskResult>>>>;

/// Result of one [`TaskRunner::execute_dag`] call.
#[derive(Debug, Clone)]
pub struct DagOutcome {
    /// Terminal result per executed unit.
    pub results: HashMap<TaskId, TaskResult>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: f64,
}

impl DagOutcome {
    /// Returns true if every unit completed.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.results.values().all(TaskResult::is_completed)
    }

    /// Ids of units that failed.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<TaskId> {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_completed())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

struct RunnerState {
    ctx: Arc<OrchestrationContext>,
    pending: DashMap<TaskId, TaskUnit>,
    names: DashMap<TaskId, String>,
    statuses: DashMap<TaskId, TaskStatus>,
    results: DashMap<TaskId, TaskResult>,
}

/// Registers task units and executes them as a DAG.
///
/// Cloning is cheap; clones share registrations and results.
#[derive(Clone)]
pub struct TaskRunner {
    state: Arc<RunnerState>,
}

impl TaskRunner {
    /// Creates a runner bound to an orchestration context.
    #[must_use]
    pub fn new(ctx: Arc<OrchestrationContext>) -> Self {
        Self {
            state: Arc::new(RunnerState {
                ctx,
                pending: DashMap::new(),
                names: DashMap::new(),
                statuses: DashMap::new(),
                results: DashMap::new(),
            }),
        }
    }

    /// The orchestration context.
    #[must_use]
    pub fn context(&self) -> &Arc<OrchestrationContext> {
        &self.state.ctx
    }

    /// Registers a unit and returns its generated id.
    ///
    /// Every id in `depends_on` must already be registered with this runner,
    /// so a dependency cycle cannot be expressed.
    ///
    /// # Errors
    ///
    /// Returns [`GenflowError::UnknownDependency`] for an unregistered dependency.
    pub fn register(
        &self,
        name: impl Into<String>,
        work: Arc<dyn Work>,
        args: Value,
        depends_on: &[TaskId],
    ) -> Result<TaskId> {
        let name = name.into();
        if let Some(missing) = depends_on
            .iter()
            .find(|dep| !self.state.names.contains_key(*dep))
        {
            return Err(GenflowError::UnknownDependency {
                task: name,
                dependency: missing.clone(),
            });
        }

        let id = Uuid::new_v4().to_string();
        let unit = TaskUnit {
            id: id.clone(),
            name: name.clone(),
            work,
            args,
            depends_on: depends_on.to_vec(),
        };

        self.state.names.insert(id.clone(), name.clone());
        self.state.statuses.insert(id.clone(), TaskStatus::Registered);
        self.state.pending.insert(id.clone(), unit);
        debug!(task_id = %id, task_name = %name, dependencies = depends_on.len(), "Task registered");
        Ok(id)
    }

    /// Executes the given units and waits for all of them to finish.
    ///
    /// Dependencies outside `ids` are honoured if they already have a result
    /// from an earlier call; a dependency that never ran fails its dependent.
    ///
    /// # Errors
    ///
    /// Returns [`GenflowError::UnknownTask`] if an id was never registered,
    /// and [`GenflowError::Validation`] if it was already executed. Unit
    /// failures are reported in the outcome, not as errors.
    pub async fn execute_dag(&self, ids: &[TaskId]) -> Result<DagOutcome> {
        let start = Instant::now();

        let mut seen = HashSet::new();
        let ids: Vec<TaskId> = ids.iter().filter(|id| seen.insert(*id)).cloned().collect();
        for id in &ids {
            if !self.state.names.contains_key(id) {
                return Err(GenflowError::UnknownTask(id.clone()));
            }
            if !self.state.pending.contains_key(id) {
                return Err(GenflowError::Validation(format!(
                    "task '{id}' has already been executed"
                )));
            }
        }

        let units: Vec<TaskUnit> = ids
            .iter()
            .filter_map(|id| self.state.pending.remove(id).map(|(_, unit)| unit))
            .collect();

        let mut senders = HashMap::with_capacity(units.len());
        let mut receivers = HashMap::with_capacity(units.len());
        for unit in &units {
            let (tx, rx) = watch::channel(None);
            senders.insert(unit.id.clone(), tx);
            receivers.insert(unit.id.clone(), rx);
        }
        let signals: Signals = Arc::new(receivers);

        info!(tasks = units.len(), "Executing DAG");

        let mut handles = Vec::with_capacity(units.len());
        for unit in units {
            let Some(tx) = senders.remove(&unit.id) else {
                continue;
            };
            let id = unit.id.clone();
            let span = task_span(&unit.id, &unit.name);
            let state = self.state.clone();
            let signals = signals.clone();
            let handle = tokio::spawn(
                async move { state.run_unit(unit, signals, tx).await }.instrument(span),
            );
            handles.push((id, handle));
        }

        let mut results = HashMap::with_capacity(handles.len());
        for (id, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    error!(task_id = %id, error = %join_error, "Task runner crashed");
                    let result =
                        TaskResult::failed(&TaskError::Panicked(join_error.to_string()));
                    self.state.persist(&id, &result).await;
                    result
                }
            };
            results.insert(id, result);
        }

        let outcome = DagOutcome {
            results,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        info!(
            tasks = outcome.results.len(),
            failed = outcome.failed_ids().len(),
            duration_ms = outcome.duration_ms,
            "DAG finished"
        );
        Ok(outcome)
    }

    /// Result from the in-process map.
    #[must_use]
    pub fn get_result(&self, id: &str) -> Option<TaskResult> {
        self.state.results.get(id).map(|r| r.clone())
    }

    /// Result mirrored in the handoff store.
    pub async fn get_result_from_store(&self, id: &str) -> Option<TaskResult> {
        self.state.ctx.store().get_task_result(id).await
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.state.statuses.get(id).map(|s| *s)
    }

    /// Registered name of a unit.
    #[must_use]
    pub fn name(&self, id: &str) -> Option<String> {
        self.state.names.get(id).map(|n| n.clone())
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("registered", &self.state.names.len())
            .field("pending", &self.state.pending.len())
            .field("finished", &self.state.results.len())
            .finish()
    }
}

impl RunnerState {
    async fn run_unit(
        self: Arc<Self>,
        unit: TaskUnit,
        signals: Signals,
        tx: watch::Sender<Option<TaskResult>>,
    ) -> TaskResult {
        let shutdown = self.ctx.shutdown_token().clone();
        let outcome = tokio::select! {
            biased;
            reason = shutdown.cancelled() => Err(TaskError::Cancelled(reason)),
            outcome = self.execute_unit(&unit, &signals) => outcome,
        };

        self.ctx
            .events()
            .try_emit(&EngineEvent::task_finished(&unit.id, &unit.name, &outcome));
        let result = match outcome {
            Ok(value) => {
                info!("Task completed");
                TaskResult::completed(value)
            }
            Err(err) => {
                if err.is_dependency_failure() {
                    warn!(error = %err, "Task skipped");
                } else {
                    error!(error = %err, "Task failed");
                }
                TaskResult::failed(&err)
            }
        };

        self.persist(&unit.id, &result).await;
        tx.send_replace(Some(result.clone()));
        result
    }

    async fn execute_unit(
        &self,
        unit: &TaskUnit,
        signals: &Signals,
    ) -> std::result::Result<Value, TaskError> {
        let mut dependencies = BTreeMap::new();
        for dep in &unit.depends_on {
            let dep_name = self
                .names
                .get(dep)
                .map_or_else(|| dep.clone(), |n| n.clone());
            match self.await_dependency(dep, signals).await {
                Some(result) if result.is_completed() => {
                    dependencies.insert(dep_name, result.result.unwrap_or(Value::Null));
                }
                Some(result) => {
                    return Err(TaskError::DependencyFailed {
                        dependency: dep_name,
                        reason: result.error_text().to_string(),
                    });
                }
                None => {
                    return Err(TaskError::DependencyFailed {
                        dependency: dep_name,
                        reason: "never executed".to_string(),
                    });
                }
            }
        }

        let _permit = if unit.work.holds_permit() {
            Some(self.ctx.acquire().await.map_err(TaskError::from)?)
        } else {
            None
        };

        self.statuses.insert(unit.id.clone(), TaskStatus::Running);
        info!("Task started");
        self.ctx.events().try_emit(&EngineEvent::TaskStarted {
            task_id: unit.id.clone(),
            task_name: unit.name.clone(),
        });

        let input = TaskInput {
            task_id: unit.id.clone(),
            args: unit.args.clone(),
            dependencies,
        };
        match AssertUnwindSafe(unit.work.run(input)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn await_dependency(&self, dep: &str, signals: &Signals) -> Option<TaskResult> {
        if let Some(rx) = signals.get(dep) {
            let mut rx = rx.clone();
            let signalled = rx.wait_for(Option::is_some).await.map(|r| r.clone());
            return signalled.ok().flatten();
        }
        self.results.get(dep).map(|r| r.clone())
    }

    async fn persist(&self, id: &str, result: &TaskResult) {
        self.ctx.store().set_task_result(id, result).await;
        self.results.insert(id.to_string(), result.clone());
        self.statuses.insert(id.to_string(), result.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::dag::work_fn;
    use crate::events::CollectingEventSink;
    use crate::store::HandoffStore;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn context(max_concurrency: usize, sink: Arc<CollectingEventSink>) -> Arc<OrchestrationContext> {
        let mut config = EngineConfig::default();
        config.engine.max_concurrency = max_concurrency;
        Arc::new(OrchestrationContext::new(config, HandoffStore::in_memory()).with_events(sink))
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, name: &'static str, delay_ms: u64) -> Arc<dyn Work> {
        let log = log.clone();
        work_fn(move |_input: TaskInput| {
            let log = log.clone();
            async move {
                log.lock().push(format!("start:{name}"));
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                log.lock().push(format!("end:{name}"));
                Ok(json!(name))
            }
        })
    }

    fn position(log: &[String], entry: &str) -> usize {
        log.iter().position(|e| e == entry).unwrap()
    }

    #[tokio::test]
    async fn test_diamond_ordering() {
        let sink = Arc::new(CollectingEventSink::new());
        let runner = TaskRunner::new(context(4, sink.clone()));
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = runner.register("a", recording(&log, "a", 5), Value::Null, &[]).unwrap();
        let b = runner.register("b", recording(&log, "b", 20), Value::Null, &[a.clone()]).unwrap();
        let c = runner.register("c", recording(&log, "c", 20), Value::Null, &[a.clone()]).unwrap();
        let d = runner
            .register("d", recording(&log, "d", 1), Value::Null, &[b.clone(), c.clone()])
            .unwrap();

        let outcome = runner
            .execute_dag(&[d.clone(), c.clone(), b.clone(), a.clone()])
            .await
            .unwrap();
        assert!(outcome.all_completed());
        assert_eq!(outcome.results.len(), 4);

        let log = log.lock().clone();
        assert!(position(&log, "end:a") < position(&log, "start:b"));
        assert!(position(&log, "end:a") < position(&log, "start:c"));
        assert!(position(&log, "end:b") < position(&log, "start:d"));
        assert!(position(&log, "end:c") < position(&log, "start:d"));
        // b and c overlap
        assert!(position(&log, "start:c") < position(&log, "end:b"));
        assert!(position(&log, "start:b") < position(&log, "end:c"));

        assert_eq!(sink.named("task.started").len(), 4);
        assert_eq!(sink.named("task.completed").len(), 4);
    }

    #[tokio::test]
    async fn test_dependency_results_passed_by_name() {
        let runner = TaskRunner::new(context(2, Arc::new(CollectingEventSink::new())));
        let story = runner
            .register("story", work_fn(|_| async { Ok(json!({"pages": 2})) }), Value::Null, &[])
            .unwrap();
        let images = runner
            .register(
                "images",
                work_fn(|input: TaskInput| async move {
                    Ok(input.dependency("story").cloned().unwrap_or(Value::Null))
                }),
                json!({"stage": "images"}),
                &[story.clone()],
            )
            .unwrap();

        let outcome = runner.execute_dag(&[story, images.clone()]).await.unwrap();
        assert_eq!(outcome.results[&images].result, Some(json!({"pages": 2})));
    }

    #[tokio::test]
    async fn test_failure_propagates_without_invoking_dependent() {
        let sink = Arc::new(CollectingEventSink::new());
        let runner = TaskRunner::new(context(4, sink.clone()));
        let invoked = Arc::new(AtomicUsize::new(0));

        let a = runner
            .register(
                "a",
                work_fn(|_| async { Err(TaskError::failed("provider down")) }),
                Value::Null,
                &[],
            )
            .unwrap();
        let b = {
            let invoked = invoked.clone();
            runner
                .register(
                    "b",
                    work_fn(move |_| {
                        invoked.fetch_add(1, Ordering::SeqCst);
                        async { Ok(Value::Null) }
                    }),
                    Value::Null,
                    &[a.clone()],
                )
                .unwrap()
        };
        let c = runner
            .register("c", work_fn(|_| async { Ok(json!("ok")) }), Value::Null, &[])
            .unwrap();

        let outcome = runner.execute_dag(&[a.clone(), b.clone(), c.clone()]).await.unwrap();

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.results[&a].status, TaskStatus::Failed);
        assert_eq!(outcome.results[&b].status, TaskStatus::Failed);
        assert!(outcome.results[&b]
            .error_text()
            .starts_with("dependency 'a' failed:"));
        assert_eq!(outcome.results[&c].status, TaskStatus::Completed);
        assert_eq!(runner.status(&b), Some(TaskStatus::Failed));
        assert_eq!(sink.named("task.skipped").len(), 1);
        assert_eq!(sink.named("task.failed").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let runner = TaskRunner::new(context(1, Arc::new(CollectingEventSink::new())));
        let err = runner
            .register("b", work_fn(|_| async { Ok(Value::Null) }), Value::Null, &["ghost".to_string()])
            .unwrap_err();
        assert!(matches!(
            err,
            GenflowError::UnknownDependency { ref task, ref dependency }
                if task == "b" && dependency == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_repeated_execution_rejected() {
        let runner = TaskRunner::new(context(1, Arc::new(CollectingEventSink::new())));
        assert!(matches!(
            runner.execute_dag(&["nope".to_string()]).await,
            Err(GenflowError::UnknownTask(_))
        ));

        let a = runner
            .register("a", work_fn(|_| async { Ok(Value::Null) }), Value::Null, &[])
            .unwrap();
        runner.execute_dag(&[a.clone()]).await.unwrap();
        assert!(matches!(
            runner.execute_dag(&[a]).await,
            Err(GenflowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_panic_becomes_failed_result() {
        let runner = TaskRunner::new(context(1, Arc::new(CollectingEventSink::new())));
        let a = runner
            .register(
                "a",
                work_fn(|input: TaskInput| async move {
                    if input.args.is_null() {
                        panic!("bad input");
                    }
                    Ok(Value::Null)
                }),
                Value::Null,
                &[],
            )
            .unwrap();

        let outcome = runner.execute_dag(&[a.clone()]).await.unwrap();
        assert_eq!(outcome.results[&a].error_text(), "task panicked: bad input");
    }

    #[tokio::test]
    async fn test_result_mirrored_in_store() {
        let runner = TaskRunner::new(context(1, Arc::new(CollectingEventSink::new())));
        let a = runner
            .register("a", work_fn(|_| async { Ok(json!([1, 2])) }), Value::Null, &[])
            .unwrap();
        runner.execute_dag(&[a.clone()]).await.unwrap();

        assert_eq!(runner.get_result(&a), runner.get_result_from_store(&a).await);
        assert_eq!(runner.get_result(&a).unwrap().result, Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_dependency_from_earlier_run_is_honoured() {
        let runner = TaskRunner::new(context(2, Arc::new(CollectingEventSink::new())));
        let a = runner
            .register("a", work_fn(|_| async { Ok(json!(1)) }), Value::Null, &[])
            .unwrap();
        runner.execute_dag(&[a.clone()]).await.unwrap();

        let b = runner
            .register(
                "b",
                work_fn(|input: TaskInput| async move { Ok(input.dependency("a").cloned().unwrap_or_default()) }),
                Value::Null,
                &[a.clone()],
            )
            .unwrap();
        let never = runner
            .register("never", work_fn(|_| async { Ok(Value::Null) }), Value::Null, &[])
            .unwrap();
        let c = runner
            .register("c", work_fn(|_| async { Ok(Value::Null) }), Value::Null, &[never])
            .unwrap();

        let outcome = runner.execute_dag(&[b.clone(), c.clone()]).await.unwrap();
        assert_eq!(outcome.results[&b].result, Some(json!(1)));
        assert_eq!(
            outcome.results[&c].error_text(),
            "dependency 'never' failed: never executed"
        );
    }

    #[tokio::test]
    async fn test_semaphore_caps_concurrency() {
        let runner = TaskRunner::new(context(2, Arc::new(CollectingEventSink::new())));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for i in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            let work = work_fn(move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            });
            ids.push(runner.register(format!("t{i}"), work, Value::Null, &[]).unwrap());
        }

        let outcome = runner.execute_dag(&ids).await.unwrap();
        assert!(outcome.all_completed());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_fails_inflight_and_waiting_units() {
        let ctx = context(1, Arc::new(CollectingEventSink::new()));
        let runner = TaskRunner::new(ctx.clone());
        let slow = runner
            .register(
                "slow",
                work_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }),
                Value::Null,
                &[],
            )
            .unwrap();
        let after = runner
            .register("after", work_fn(|_| async { Ok(Value::Null) }), Value::Null, &[slow.clone()])
            .unwrap();

        let exec = {
            let runner = runner.clone();
            let ids = vec![slow.clone(), after.clone()];
            tokio::spawn(async move { runner.execute_dag(&ids).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.shutdown_token().cancel("stop");

        let outcome = exec.await.unwrap().unwrap();
        assert_eq!(outcome.results[&slow].error_text(), "cancelled: stop");
        assert_eq!(outcome.results[&after].status, TaskStatus::Failed);
        assert_eq!(
            runner.get_result_from_store(&slow).await.map(|r| r.status),
            Some(TaskStatus::Failed)
        );
    }
}
