//! Execution engine: the ready queue, resolver, and a bounded worker pool
//! driving tasks from QUEUED to a terminal state.
//!
//! Grounded on the worker-pool shape of `everruns-everruns`'s durable
//! worker (`Arc<Semaphore>` bounding concurrency, a `watch`-channel
//! shutdown signal, graceful-drain-then-stop) and on the ten-step
//! dispatch loop of the original execution engine component.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use snafu::ResultExt;
use tokio::sync::{watch, Notify, RwLock, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{self, Error, Result, TaskError};
use crate::jsonrpc::{ErrorCode, JsonRpcError, JsonRpcOutcome, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::persistence::PersistenceProvider;
use crate::protocol::ProtocolRegistry;
use crate::provider::ProviderRegistry;
use crate::queue::TaskQueue;
use crate::resolver;
use crate::workflow::{Task, TaskResult, TaskStatus, Workflow, WorkflowStatus};

/// Live, in-memory view of a workflow's progress; the durable copy lives in
/// persistence and is the source of truth across restarts.
struct LiveWorkflow {
    workflow: RwLock<Workflow>,
    cancel: Arc<Notify>,
    cancelled: std::sync::atomic::AtomicBool,
}

pub struct Engine {
    config: EngineConfig,
    pub protocols: ProtocolRegistry,
    pub providers: ProviderRegistry,
    balancer: crate::balancer::LoadBalancer,
    queue: TaskQueue,
    persistence: Arc<dyn PersistenceProvider>,
    semaphore: Arc<Semaphore>,
    workflows: RwLock<HashMap<Uuid, Arc<LiveWorkflow>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Engine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        protocols: ProtocolRegistry,
        providers: ProviderRegistry,
        persistence: Arc<dyn PersistenceProvider>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            protocols,
            providers,
            balancer: crate::balancer::LoadBalancer::new(),
            queue: TaskQueue::new(),
            persistence,
            workflows: RwLock::new(HashMap::new()),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Validates readiness, persists, and enqueues a workflow's tasks.
    /// `dependency_ids` maps each task id to the resolved ids of its
    /// declared dependencies within the same workflow (DAG validation
    /// happens before this is called).
    #[instrument(skip(self, workflow, dependency_ids), fields(workflow_id = %workflow.id))]
    pub async fn submit_workflow(
        self: &Arc<Self>,
        mut workflow: Workflow,
        dependency_ids: HashMap<Uuid, Vec<Uuid>>,
    ) -> Result<Uuid> {
        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(chrono::Utc::now());

        self.persistence
            .upsert_workflow(&workflow)
            .await
            .context(error::PersistenceSnafu)?;

        let id = workflow.id;
        let error_strategy = workflow.error_strategy;
        let tasks = workflow.tasks.clone();

        self.workflows.write().await.insert(
            id,
            Arc::new(LiveWorkflow {
                workflow: RwLock::new(workflow),
                cancel: Arc::new(Notify::new()),
                cancelled: std::sync::atomic::AtomicBool::new(false),
            }),
        );

        self.queue
            .enqueue_batch(tasks, &dependency_ids, error_strategy);

        info!(workflow_id = %id, "workflow submitted");
        Ok(id)
    }

    pub async fn cancel_workflow(&self, id: Uuid) -> Result<()> {
        let workflows = self.workflows.read().await;
        let live = workflows
            .get(&id)
            .ok_or_else(|| Error::WorkflowNotFound { id: id.to_string() })?;
        live.cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        live.cancel.notify_waiters();

        let task_ids: Vec<Uuid> = {
            let wf = live.workflow.read().await;
            wf.tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id)
                .collect()
        };
        for task_id in task_ids {
            self.queue.cancel(task_id);
        }

        self.persistence
            .set_workflow_status(&id.to_string(), WorkflowStatus::Cancelled)
            .await
            .context(error::PersistenceSnafu)?;
        Ok(())
    }

    pub async fn workflow_status(&self, id: Uuid) -> Result<Workflow> {
        let workflows = self.workflows.read().await;
        if let Some(live) = workflows.get(&id) {
            return Ok(live.workflow.read().await.clone());
        }
        self.persistence
            .get_workflow(&id.to_string())
            .await
            .context(error::PersistenceSnafu)?
            .ok_or_else(|| Error::WorkflowNotFound { id: id.to_string() })
    }

    /// Startup recovery sweep: any workflow persisted as RUNNING has
    /// its RUNNING tasks marked FAILED with `CrashRecovered`. Readiness is
    /// re-resolved from persisted completion state, the crash failure is
    /// cascaded through the queue exactly as a live failure would be, and
    /// the workflow is finalized if that cascade leaves it complete.
    pub async fn recover(self: &Arc<Self>) -> Result<()> {
        let running = self
            .persistence
            .list_running_workflows()
            .await
            .context(error::PersistenceSnafu)?;

        for workflow in running {
            let mut workflow = workflow;
            let mut dependency_ids = HashMap::new();
            let name_to_id: HashMap<String, Uuid> =
                workflow.tasks.iter().map(|t| (t.name.clone(), t.id)).collect();
            let mut crash_failed = Vec::new();

            for task in &mut workflow.tasks {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Failed;
                    task.error = Some(serde_json::to_value(&TaskError::new(
                        error::ErrorKind::CrashRecovered,
                        "task was RUNNING when the engine restarted",
                    ))
                    .unwrap_or(Value::Null));
                    task.completed_at = Some(chrono::Utc::now());
                    self.persistence
                        .upsert_task(&crate::persistence::TaskRecord::from(&*task))
                        .await
                        .context(error::PersistenceSnafu)?;
                    crash_failed.push(task.id);
                }
                if let Some(ids) = resolver::resolve_dependency_ids(&task.dependencies, &name_to_id) {
                    dependency_ids.insert(task.id, ids);
                }
            }

            let not_yet_done: Vec<Task> = workflow
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Queued)
                .cloned()
                .collect();
            let dependents_params: Vec<(Uuid, String, Value)> = workflow
                .tasks
                .iter()
                .map(|t| (t.id, t.name.clone(), t.params.clone()))
                .collect();

            let strategy = workflow.error_strategy;
            let workflow_id = workflow.id;
            self.workflows.write().await.insert(
                workflow_id,
                Arc::new(LiveWorkflow {
                    workflow: RwLock::new(workflow.clone()),
                    cancel: Arc::new(Notify::new()),
                    cancelled: std::sync::atomic::AtomicBool::new(false),
                }),
            );
            self.queue.enqueue_batch(not_yet_done, &dependency_ids, strategy);

            for failed_id in &crash_failed {
                let failed_name = dependents_params
                    .iter()
                    .find(|(id, _, _)| id == failed_id)
                    .map(|(_, name, _)| name.clone())
                    .unwrap_or_default();
                let (_, cascaded) = self.queue.mark_failed(*failed_id, |dependent_id| {
                    dependents_params
                        .iter()
                        .find(|(id, _, _)| *id == dependent_id)
                        .is_some_and(|(_, _, params)| {
                            references_key(params, &failed_name)
                                || references_key(params, &failed_id.to_string())
                        })
                });
                for dep_id in &cascaded {
                    self.persistence
                        .set_task_status(&dep_id.to_string(), TaskStatus::Failed, None, Some(chrono::Utc::now()))
                        .await
                        .ok();
                }
                self.update_workflow_failure(workflow_id, *failed_id, cascaded).await;
            }

            self.maybe_finalize_workflow(workflow_id).await;
            warn!(workflow_id = %workflow_id, "recovered workflow after restart");
        }
        Ok(())
    }

    /// Runs the worker pool until `shutdown()` is called. Each iteration
    /// pulls one ready task whose protocol/method has at least one
    /// candidate instance, acquires a semaphore permit, and spawns its
    /// execution; otherwise it waits briefly and polls again.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };

            let task = self.queue.dequeue(|_| true);
            let Some(task) = task else {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                    _ = shutdown_rx.changed() => {}
                }
                continue;
            };

            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                engine.process_task(task).await;
                drop(permit);
            });
        }
        debug!("engine run loop exited");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One-shot convenience: runs a single task directly, bypassing the
    /// queue and any workflow bookkeeping. `task.dependencies` must be empty
    /// since there is no sibling workflow to resolve results against.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn execute_task(&self, mut task: Task) -> TaskResult {
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        let start = Instant::now();

        match self.execute_with_retry(&mut task).await {
            Ok(result) => TaskResult {
                task_id: task.id,
                workflow_id: task.workflow_id,
                status: TaskStatus::Completed,
                result: Some(result),
                error: None,
                duration_seconds: start.elapsed().as_secs_f64(),
                completed_at: chrono::Utc::now(),
                attempts: task.attempt,
            },
            Err(task_error) => TaskResult {
                task_id: task.id,
                workflow_id: task.workflow_id,
                status: TaskStatus::Failed,
                result: None,
                error: serde_json::to_value(&task_error).ok(),
                duration_seconds: start.elapsed().as_secs_f64(),
                completed_at: chrono::Utc::now(),
                attempts: task.attempt,
            },
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, workflow_id = %task.workflow_id))]
    async fn process_task(self: Arc<Self>, mut task: Task) {
        let workflow_id = task.workflow_id;
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
        task.attempt = 1;

        if let Err(e) = self
            .persistence
            .upsert_task(&crate::persistence::TaskRecord::from(&task))
            .await
        {
            error!(error = %e, "failed to persist RUNNING status");
        }

        match self.execute_with_retry(&mut task).await {
            Ok(result) => self.on_task_success(workflow_id, task, result).await,
            Err(task_error) => self.on_task_failure(workflow_id, task, task_error).await,
        }
    }

    /// Steps 4-7 of the main loop: substitution, validation, provider
    /// selection, dispatch with retry.
    async fn execute_with_retry(&self, task: &mut Task) -> std::result::Result<Value, TaskError> {
        let results = self.collect_dependency_results(task.workflow_id).await;
        let declared_refs: Vec<String> = task.dependencies.clone();

        let params = resolver::substitute(&task.params, &results, &declared_refs).map_err(|e| {
            TaskError::new(error::ErrorKind::SubstitutionError, e.to_string())
        })?;

        self.protocols
            .validate_call(&task.protocol, &task.method, &params)
            .await
            .map_err(|e| TaskError::new(error::ErrorKind::ValidationError, e.to_string()))?;

        let retry_policy = task.retry.clone();
        let wait_deadline = Instant::now() + self.config.provider_wait_timeout;

        loop {
            let instance = loop {
                let candidates = self
                    .providers
                    .candidates(&task.protocol, &task.method, &[])
                    .await;
                if !candidates.is_empty() {
                    match self
                        .balancer
                        .select(
                            self.config.load_balancer_strategy,
                            &task.protocol,
                            &task.method,
                            &candidates,
                        )
                        .await
                    {
                        Ok(instance) => break instance,
                        Err(_) => {}
                    }
                }
                if Instant::now() >= wait_deadline {
                    return Err(TaskError::new(
                        error::ErrorKind::ProviderUnavailable,
                        format!("no provider instance for {}/{}", task.protocol, task.method),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            };

            let permit = match instance.breaker.allow().await {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            // Every provider call is framed as a JSON-RPC 2.0 request/response pair:
            // the request carries method/params/id, and whatever the provider
            // returns is folded into a {result} or {error{code,message,data.kind}}
            // envelope before the engine ever looks at it.
            let request = JsonRpcRequest::new(RequestId::from(task.id), task.method.clone(), params.clone());

            let call_start = Instant::now();
            let call_result = tokio::time::timeout(
                self.config.task_timeout,
                instance
                    .provider
                    .handle(&request.method, request.params.clone().unwrap_or(Value::Null)),
            )
            .await;
            let duration_ms = call_start.elapsed().as_secs_f64() * 1000.0;

            let response = match call_result {
                Ok(Ok(value)) => JsonRpcResponse::success(request.id.clone(), value),
                Ok(Err(e)) => JsonRpcResponse::failure(
                    request.id.clone(),
                    JsonRpcError::new(ErrorCode::SERVER_ERROR, e.to_string())
                        .with_kind(error::ErrorKind::ProviderError.code()),
                ),
                Err(_) => JsonRpcResponse::failure(
                    request.id.clone(),
                    JsonRpcError::new(ErrorCode::SERVER_ERROR, "provider call timed out")
                        .with_kind(error::ErrorKind::ProviderTimeout.code()),
                ),
            };

            let success = matches!(response.outcome, JsonRpcOutcome::Result { .. });
            if success {
                permit.success().await;
            } else {
                permit.failure().await;
            }
            instance.metrics.write().await.record(duration_ms, success);

            let outcome = response.into_result().map_err(TaskError::from);

            match outcome {
                Ok(value) => return Ok(value),
                Err(task_error) => {
                    let retryable = task_error.retryable()
                        && retry_policy.should_retry(Some(task_error.kind_code.as_str()));
                    if retryable && retry_policy.has_attempts_remaining(task.attempt) {
                        task.attempt += 1;
                        let delay = retry_policy.delay_for_attempt(task.attempt);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(task_error);
                }
            }
        }
    }

    async fn collect_dependency_results(&self, workflow_id: Uuid) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        if let Some(live) = self.workflows.read().await.get(&workflow_id) {
            let workflow = live.workflow.read().await;
            for task in &workflow.tasks {
                if let Some(result) = workflow.task_results.get(&task.id) {
                    out.insert(task.name.clone(), result.clone());
                    out.insert(task.id.to_string(), result.clone());
                }
            }
        }
        out
    }

    async fn on_task_success(&self, workflow_id: Uuid, mut task: Task, result: Value) {
        task.status = TaskStatus::Completed;
        task.result = Some(result.clone());
        task.completed_at = Some(chrono::Utc::now());

        if let Err(e) = self
            .persistence
            .set_task_result(&task.id.to_string(), Some(result.clone()), None)
            .await
        {
            error!(error = %e, "failed to persist task result");
        }
        if let Err(e) = self
            .persistence
            .set_task_status(
                &task.id.to_string(),
                TaskStatus::Completed,
                task.started_at,
                task.completed_at,
            )
            .await
        {
            error!(error = %e, "failed to persist task status");
        }

        let newly_ready = self.queue.mark_completed(task.id, Some(result.clone()));
        self.update_workflow_progress(workflow_id, task.id, true, task.name.clone(), result.clone())
            .await;

        let mut results = HashMap::new();
        results.insert(task.id.to_string(), result);
        if let Err(e) = self
            .persistence
            .update_workflow_progress(&workflow_id.to_string(), &[task.id.to_string()], &[], &results)
            .await
        {
            error!(error = %e, "failed to persist workflow progress");
        }

        debug!(count = newly_ready.len(), "tasks newly ready after completion");
        self.maybe_finalize_workflow(workflow_id).await;
    }

    async fn on_task_failure(&self, workflow_id: Uuid, mut task: Task, task_error: TaskError) {
        task.status = TaskStatus::Failed;
        task.error = Some(serde_json::to_value(&task_error).unwrap_or(Value::Null));
        task.completed_at = Some(chrono::Utc::now());

        if let Err(e) = self
            .persistence
            .set_task_result(&task.id.to_string(), None, task.error.clone())
            .await
        {
            error!(error = %e, "failed to persist task error");
        }
        if let Err(e) = self
            .persistence
            .set_task_status(&task.id.to_string(), TaskStatus::Failed, task.started_at, task.completed_at)
            .await
        {
            error!(error = %e, "failed to persist task status");
        }

        let failed_name = task.name.clone();
        let failed_id = task.id;

        let dependents_params: Vec<(Uuid, Value)> = {
            if let Some(live) = self.workflows.read().await.get(&workflow_id) {
                let workflow = live.workflow.read().await;
                workflow
                    .tasks
                    .iter()
                    .map(|t| (t.id, t.params.clone()))
                    .collect()
            } else {
                Vec::new()
            }
        };

        let (newly_ready, cascaded) = self.queue.mark_failed(failed_id, |dependent_id| {
            dependents_params
                .iter()
                .find(|(id, _)| *id == dependent_id)
                .is_some_and(|(_, params)| references_key(params, &failed_name) || references_key(params, &failed_id.to_string()))
        });

        for dep_id in &cascaded {
            self.persistence
                .set_task_status(&dep_id.to_string(), TaskStatus::Failed, None, Some(chrono::Utc::now()))
                .await
                .ok();
        }

        let mut failed_ids: Vec<String> = cascaded.iter().map(Uuid::to_string).collect();
        failed_ids.push(failed_id.to_string());
        if let Err(e) = self
            .persistence
            .update_workflow_progress(&workflow_id.to_string(), &[], &failed_ids, &HashMap::new())
            .await
        {
            error!(error = %e, "failed to persist workflow progress");
        }

        self.update_workflow_failure(workflow_id, failed_id, cascaded).await;
        debug!(count = newly_ready.len(), "ordering-only dependents released");
        self.maybe_finalize_workflow(workflow_id).await;
    }

    async fn update_workflow_progress(
        &self,
        workflow_id: Uuid,
        task_id: Uuid,
        success: bool,
        _task_name: String,
        result: Value,
    ) {
        if let Some(live) = self.workflows.read().await.get(&workflow_id) {
            let mut workflow = live.workflow.write().await;
            if success {
                workflow.completed_tasks.insert(task_id);
            }
            workflow.task_results.insert(task_id, result);
            if let Some(t) = workflow.tasks.iter_mut().find(|t| t.id == task_id) {
                t.status = TaskStatus::Completed;
            }
        }
    }

    async fn update_workflow_failure(&self, workflow_id: Uuid, task_id: Uuid, cascaded: Vec<Uuid>) {
        if let Some(live) = self.workflows.read().await.get(&workflow_id) {
            let mut workflow = live.workflow.write().await;
            workflow.failed_tasks.insert(task_id);
            for id in &cascaded {
                workflow.failed_tasks.insert(*id);
                if let Some(t) = workflow.tasks.iter_mut().find(|t| t.id == *id) {
                    t.status = TaskStatus::Failed;
                }
            }
            if let Some(t) = workflow.tasks.iter_mut().find(|t| t.id == task_id) {
                t.status = TaskStatus::Failed;
            }
        }
    }

    /// A workflow is terminal once every task is terminal. Final
    /// status: COMPLETED if no failures, FAILED if any failure, unless the
    /// workflow was explicitly cancelled (handled by `cancel_workflow`).
    async fn maybe_finalize_workflow(&self, workflow_id: Uuid) {
        let Some(live) = self.workflows.read().await.get(&workflow_id).cloned() else {
            return;
        };
        if live.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        let (is_complete, has_failures) = {
            let workflow = live.workflow.read().await;
            (workflow.is_complete(), !workflow.failed_tasks.is_empty())
        };

        if !is_complete {
            return;
        }

        let final_status = if has_failures {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        {
            let mut workflow = live.workflow.write().await;
            workflow.status = final_status;
            workflow.completed_at = Some(chrono::Utc::now());
        }

        if let Err(e) = self
            .persistence
            .set_workflow_status(&workflow_id.to_string(), final_status)
            .await
        {
            error!(error = %e, "failed to persist final workflow status");
        }
        info!(workflow_id = %workflow_id, status = %format!("{final_status:?}"), "workflow finished");
    }
}

/// True if any string leaf of `params` contains a `${key...}` or `${key}`
/// substitution token, used to decide whether a dependent requires a failed
/// task's result (vs. only its ordering) under `ErrorStrategy::Continue`.
fn references_key(params: &Value, key: &str) -> bool {
    match params {
        Value::String(s) => {
            let dotted = format!("${{{key}.");
            let bare = format!("${{{key}}}");
            s.contains(&dotted) || s.contains(&bare)
        }
        Value::Object(map) => map.values().any(|v| references_key(v, key)),
        Value::Array(items) => items.iter().any(|v| references_key(v, key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::protocol::{MethodSpec, ParamType, ParameterSpec, ProtocolSpec};
    use crate::provider::{HealthCheckResult, Provider, ProviderInstance, ProviderStatus};
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn initialize(&self) -> crate::provider::Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> crate::provider::Result<()> {
            Ok(())
        }
        fn supported_methods(&self) -> Vec<String> {
            vec!["echo/echo".to_string()]
        }
        async fn health_check(&self) -> HealthCheckResult {
            HealthCheckResult {
                status: ProviderStatus::Healthy,
                details: None,
            }
        }
        async fn handle(&self, _method: &str, params: Value) -> crate::provider::Result<Value> {
            Ok(params)
        }
    }

    async fn echo_engine() -> Arc<Engine> {
        let protocols = ProtocolRegistry::new();
        let mut params_schema = Map::new();
        params_schema.insert(
            "text".to_string(),
            ParameterSpec {
                param_type: Some(ParamType::String),
                ..Default::default()
            },
        );
        let mut methods = Map::new();
        methods.insert(
            "echo/echo".to_string(),
            MethodSpec {
                params_schema,
                returns_schema: None,
            },
        );
        protocols
            .register(ProtocolSpec {
                name: "echo".to_string(),
                version: "v1".to_string(),
                description: String::new(),
                methods,
                additional_properties: true,
            })
            .await
            .unwrap();

        let providers = ProviderRegistry::new();
        providers
            .register(ProviderInstance::new("p1", "echo/v1", Arc::new(EchoProvider)))
            .await
            .unwrap();

        Engine::new(
            EngineConfig::default(),
            protocols,
            providers,
            Arc::new(InMemoryPersistence::new()),
        )
    }

    #[tokio::test]
    async fn single_task_workflow_completes() {
        let engine = echo_engine().await;
        let wf_id = Uuid::new_v4();
        let task = Task::new(
            wf_id,
            "only",
            "echo/v1",
            "echo/echo",
            serde_json::json!({"text": "hi"}),
        );
        let mut workflow = Workflow::new("w", vec![task]);
        workflow.id = wf_id;
        let id = engine.submit_workflow(workflow, HashMap::new()).await.unwrap();

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move { runner.run().await });

        let mut status = engine.workflow_status(id).await.unwrap();
        for _ in 0..200 {
            if status.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = engine.workflow_status(id).await.unwrap();
        }
        engine.shutdown();
        let _ = handle.await;

        assert_eq!(status.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn execute_task_runs_without_a_workflow() {
        let engine = echo_engine().await;
        let task = Task::new(
            Uuid::new_v4(),
            "standalone",
            "echo/v1",
            "echo/echo",
            serde_json::json!({"text": "hi"}),
        );
        let result = engine.execute_task(task).await;
        assert_eq!(result.status, TaskStatus::Completed);
        assert_eq!(result.result, Some(serde_json::json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn recover_fails_running_task_and_finalizes_workflow() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let wf_id = Uuid::new_v4();
        let mut a = Task::new(wf_id, "A", "echo/v1", "echo/echo", serde_json::json!({}));
        let a_id = a.id;
        a.status = TaskStatus::Completed;
        a.result = Some(serde_json::json!({"n": 7}));

        let mut b = Task::new(wf_id, "B", "echo/v1", "echo/echo", serde_json::json!({}));
        let b_id = b.id;
        b.status = TaskStatus::Running;

        let mut workflow = Workflow::new("crashed", vec![a, b]);
        workflow.id = wf_id;
        workflow.status = WorkflowStatus::Running;
        workflow.completed_tasks.insert(a_id);
        workflow.task_results.insert(a_id, serde_json::json!({"n": 7}));

        persistence.upsert_workflow(&workflow).await.unwrap();

        let engine = Engine::new(
            EngineConfig::default(),
            ProtocolRegistry::new(),
            crate::provider::ProviderRegistry::new(),
            persistence,
        );
        engine.recover().await.unwrap();

        let recovered = engine.workflow_status(wf_id).await.unwrap();
        let b_task = recovered.task_by_id(b_id).unwrap();
        assert_eq!(b_task.status, TaskStatus::Failed);
        let kind = b_task
            .error
            .as_ref()
            .and_then(|e| e.get("kind_code"))
            .and_then(|v| v.as_str());
        assert_eq!(kind, Some("CRASH_RECOVERED"));
        assert_eq!(recovered.status, WorkflowStatus::Failed);
    }

    #[test]
    fn references_key_finds_dotted_token() {
        let params = serde_json::json!({"prompt": "use ${A.text} here"});
        assert!(references_key(&params, "A"));
        assert!(!references_key(&params, "B"));
    }
}
