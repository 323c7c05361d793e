//! The scheduler proper: dispatch, result handling, retries, timeouts,
//! cancellation, and completion
//!
//! Three cooperating background loops drive the engine: the dispatch tick
//! admits queued workflows and hands ready steps to idle workers, the
//! health tick detects stale workers and overrunning steps, and the metrics
//! tick samples per-role utilization. All engine state lives behind one
//! coarse lock so a step transition and the matching worker transition are
//! observed together.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::metrics::{EngineMetrics, SystemMetricsSnapshot, WorkerCounts, WorkflowCounts};
use super::registry::{WorkerAvailability, WorkerRegistry, WorkerState};
use super::workflow::{
    build_extraction_workflow, CustomWorkflowSpec, ExecutionStatus, ExtractionConfig, WorkerRole,
    Workflow,
};
use super::EngineError;
use crate::domain_types::{MaxConcurrentWorkflows, QueueName, StepId, WorkerId, WorkflowId};
use crate::messaging::{BusError, Message, MessageBus, MessageHandler, MessageKind, QueueRouter};

/// Engine timing and concurrency configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_workflows: MaxConcurrentWorkflows,
    pub dispatch_interval: StdDuration,
    pub health_check_interval: StdDuration,
    pub metrics_interval: StdDuration,
    pub step_timeout: StdDuration,
    pub heartbeat_timeout: StdDuration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: MaxConcurrentWorkflows::default(),
            dispatch_interval: StdDuration::from_secs(5),
            health_check_interval: StdDuration::from_secs(60),
            metrics_interval: StdDuration::from_secs(30),
            step_timeout: StdDuration::from_secs(30 * 60),
            heartbeat_timeout: StdDuration::from_secs(5 * 60),
        }
    }
}

impl EngineConfig {
    /// Short intervals for tests driving ticks explicitly
    #[must_use]
    pub fn testing() -> Self {
        Self {
            dispatch_interval: StdDuration::from_millis(50),
            health_check_interval: StdDuration::from_millis(200),
            metrics_interval: StdDuration::from_millis(200),
            ..Self::default()
        }
    }
}

/// Per-step view in a status report
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step_id: String,
    pub role: WorkerRole,
    pub description: String,
    pub status: ExecutionStatus,
    pub prerequisites: Vec<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub execution_secs: Option<f64>,
}

/// Caller-facing workflow status
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusReport {
    pub workflow_id: String,
    pub name: String,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub steps: Vec<StepReport>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Caller-facing worker status
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusSummary {
    pub total_registered: usize,
    pub online: usize,
    pub busy: usize,
    pub workers: Vec<WorkerState>,
}

struct EngineState {
    workflows: HashMap<WorkflowId, Workflow>,
    queue: VecDeque<WorkflowId>,
    workers: WorkerRegistry,
}

/// A step dispatch prepared under the state lock and published after it
struct PendingDispatch {
    workflow_id: WorkflowId,
    step_id: StepId,
    worker_id: WorkerId,
    message: Message,
}

/// The workflow engine
pub struct WorkflowEngine {
    engine_id: String,
    config: EngineConfig,
    bus: Arc<MessageBus>,
    router: Arc<QueueRouter>,
    state: RwLock<EngineState>,
    metrics: EngineMetrics,
    running: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(config: EngineConfig, bus: Arc<MessageBus>, router: Arc<QueueRouter>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            engine_id: format!("engine_{}", &suffix[..8]),
            config,
            bus,
            router,
            state: RwLock::new(EngineState {
                workflows: HashMap::new(),
                queue: VecDeque::new(),
                workers: WorkerRegistry::new(),
            }),
            metrics: EngineMetrics::new(),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribes to worker result channels and starts the dispatch,
    /// health, and metrics loops
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!(engine_id = %self.engine_id, "engine is already running");
            return;
        }
        info!(engine_id = %self.engine_id, "starting workflow engine");

        let subscriber: Arc<dyn MessageHandler> = Arc::new(EngineSubscriber {
            engine: Arc::downgrade(self),
        });
        for kind in [
            MessageKind::ContentExtracted,
            MessageKind::JobFailed,
            MessageKind::AgentHealthCheck,
            MessageKind::WorkflowRequest,
        ] {
            self.bus.subscribe_channel(kind, Arc::clone(&subscriber)).await;
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_loop(self.config.dispatch_interval, |engine| async move {
            engine.dispatch_tick().await;
        }));
        tasks.push(self.spawn_loop(self.config.health_check_interval, |engine| async move {
            engine.health_tick().await;
        }));
        tasks.push(self.spawn_loop(self.config.metrics_interval, |engine| async move {
            engine.metrics_tick().await;
        }));
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, interval: StdDuration, tick: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while engine.running.load(Ordering::Acquire) {
                tick(Arc::clone(&engine)).await;
                tokio::time::sleep(interval).await;
            }
        })
    }

    /// Cancels everything in flight and stops the background loops
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let active: Vec<WorkflowId> = {
            let state = self.state.read().await;
            state
                .workflows
                .values()
                .filter(|w| !w.status.is_terminal())
                .map(|w| w.workflow_id.clone())
                .collect()
        };
        for workflow_id in active {
            self.cancel(&workflow_id, "engine shutdown").await;
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(engine_id = %self.engine_id, "workflow engine stopped");
    }

    /// Registers a worker instance. Re-registering the same id replaces the
    /// record.
    pub async fn register_worker(
        &self,
        worker_id: WorkerId,
        role: WorkerRole,
        capabilities: Vec<String>,
    ) {
        info!(worker_id = %worker_id, role = %role, "registered worker");
        self.state
            .write()
            .await
            .workers
            .register(worker_id, role, capabilities);
    }

    /// Removes a worker's registration
    pub async fn deregister_worker(&self, worker_id: &WorkerId) -> bool {
        self.state.write().await.workers.deregister(worker_id).is_some()
    }

    /// Submits a default extraction workflow for a URL
    pub async fn submit_extraction(&self, url: &str, config: &ExtractionConfig) -> WorkflowId {
        let workflow = build_extraction_workflow(url, config);
        let workflow_id = workflow.workflow_id.clone();
        let mut state = self.state.write().await;
        state.queue.push_back(workflow_id.clone());
        state.workflows.insert(workflow_id.clone(), workflow);
        info!(workflow_id = %workflow_id, url, "submitted extraction workflow");
        workflow_id
    }

    /// Submits a custom workflow. Configuration errors (unknown role,
    /// unresolved prerequisite, cycle) reject the workflow before any step
    /// is dispatched; the rejected workflow is recorded as failed.
    pub async fn submit_custom(&self, spec: CustomWorkflowSpec) -> Result<WorkflowId, EngineError> {
        match spec.into_workflow() {
            Ok(workflow) => {
                let workflow_id = workflow.workflow_id.clone();
                let mut state = self.state.write().await;
                state.queue.push_back(workflow_id.clone());
                state.workflows.insert(workflow_id.clone(), workflow);
                info!(workflow_id = %workflow_id, "submitted custom workflow");
                Ok(workflow_id)
            }
            Err(reason) => {
                let workflow_id = WorkflowId::generate("custom");
                let mut workflow = Workflow::new(
                    workflow_id.clone(),
                    "Rejected custom workflow".to_string(),
                    reason.clone(),
                );
                workflow.status = ExecutionStatus::Failed;
                workflow.completed_at = Some(Utc::now());
                self.state
                    .write()
                    .await
                    .workflows
                    .insert(workflow_id.clone(), workflow);
                self.metrics.record_completion(ExecutionStatus::Failed, None);
                error!(workflow_id = %workflow_id, reason = %reason, "rejected custom workflow");
                Err(EngineError::InvalidWorkflow {
                    workflow_id,
                    reason,
                })
            }
        }
    }

    /// One pass of the dispatch loop: admit queued workflows under the
    /// concurrency limit, dispatch ready steps to idle workers, and
    /// finalize workflows whose steps have all terminated.
    ///
    /// Normally driven by the background loop; public so tests can step the
    /// scheduler deterministically.
    pub async fn dispatch_tick(&self) {
        let mut dispatches: Vec<PendingDispatch> = Vec::new();
        let mut completions: Vec<Message> = Vec::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            self.admit_queued(state);
            self.collect_dispatches(state, &mut dispatches);
            self.collect_completions(state, &mut completions);
        }

        for dispatch in dispatches {
            if !self.router.route(dispatch.message.clone()).await {
                warn!(
                    step_id = %dispatch.step_id,
                    worker_id = %dispatch.worker_id,
                    "dispatch publish failed, reverting step"
                );
                self.revert_dispatch(&dispatch).await;
            }
        }
        for message in completions {
            self.bus.publish(message).await;
        }
    }

    fn admit_queued(&self, state: &mut EngineState) {
        let max = self.config.max_concurrent_workflows.as_usize();
        loop {
            let running = state
                .workflows
                .values()
                .filter(|w| w.status == ExecutionStatus::Running)
                .count();
            if running >= max {
                break;
            }
            let Some(workflow_id) = state.queue.pop_front() else {
                break;
            };
            if let Some(workflow) = state.workflows.get_mut(&workflow_id) {
                if workflow.status == ExecutionStatus::Pending {
                    workflow.status = ExecutionStatus::Running;
                    workflow.started_at = Some(Utc::now());
                    info!(workflow_id = %workflow_id, "workflow started");
                }
            }
        }
    }

    fn collect_dispatches(&self, state: &mut EngineState, dispatches: &mut Vec<PendingDispatch>) {
        let running_ids: Vec<WorkflowId> = state
            .workflows
            .values()
            .filter(|w| w.status == ExecutionStatus::Running)
            .map(|w| w.workflow_id.clone())
            .collect();

        for workflow_id in running_ids {
            let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
                continue;
            };
            let correlation_id = workflow.correlation_id;
            for step_id in workflow.ready_steps() {
                let Some(step) = workflow.step_mut(&step_id) else {
                    continue;
                };
                if step.status != ExecutionStatus::Pending {
                    continue;
                }
                let Some(worker_id) = state.workers.select_idle(step.role) else {
                    debug!(step_id = %step_id, role = %step.role, "no idle worker, step waiting");
                    continue;
                };

                // The step transition and worker transition happen together
                // under the state lock.
                state.workers.assign(&worker_id, step_id.clone());
                step.status = ExecutionStatus::Running;
                step.started_at = Some(Utc::now());

                let message = Message::new(
                    MessageKind::JobCreated,
                    self.engine_id.clone(),
                    QueueRouter::queue_for_role(step.role.as_str()),
                    json!({
                        "step_id": &step.step_id,
                        "workflow_id": &workflow_id,
                        "worker_id": &worker_id,
                        "description": &step.description,
                        "input": &step.input,
                        "priority": step.priority,
                        "timeout_secs": self.config.step_timeout.as_secs(),
                    }),
                )
                .with_correlation(correlation_id);

                info!(step_id = %step_id, worker_id = %worker_id, "dispatched step");
                dispatches.push(PendingDispatch {
                    workflow_id: workflow_id.clone(),
                    step_id,
                    worker_id,
                    message,
                });
            }
        }
    }

    fn collect_completions(&self, state: &mut EngineState, completions: &mut Vec<Message>) {
        let finished: Vec<WorkflowId> = state
            .workflows
            .values()
            .filter(|w| w.status == ExecutionStatus::Running && w.all_steps_terminal())
            .map(|w| w.workflow_id.clone())
            .collect();
        for workflow_id in finished {
            if let Some(workflow) = state.workflows.get_mut(&workflow_id) {
                completions.push(self.finalize_workflow(workflow));
            }
        }
    }

    async fn revert_dispatch(&self, dispatch: &PendingDispatch) {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if let Some(workflow) = state.workflows.get_mut(&dispatch.workflow_id) {
            if let Some(step) = workflow.step_mut(&dispatch.step_id) {
                if step.status == ExecutionStatus::Running && step.result.is_none() {
                    step.status = ExecutionStatus::Pending;
                    step.started_at = None;
                }
            }
        }
        state.workers.clear_assignment(&dispatch.worker_id);
    }

    /// Finalizes a workflow whose steps are all terminal, returning the
    /// completion message for the caller. Status precedence: cancelled over
    /// failed over completed.
    fn finalize_workflow(&self, workflow: &mut Workflow) -> Message {
        let status = workflow.final_status();
        workflow.status = status;
        workflow.completed_at = Some(Utc::now());

        let duration_secs = match (workflow.started_at, workflow.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds() as f64 / 1000.0)
            }
            _ => None,
        };
        self.metrics.record_completion(status, duration_secs);

        let successful_steps = workflow
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .count();
        info!(
            workflow_id = %workflow.workflow_id,
            status = ?status,
            successful_steps,
            "workflow finished"
        );

        // The completion goes straight to the caller-facing queue; it is
        // not part of the routed worker topology.
        Message::new(
            MessageKind::WorkflowCompleted,
            self.engine_id.clone(),
            QueueName::from_static("system"),
            json!({
                "workflow_id": &workflow.workflow_id,
                "status": status,
                "completion_secs": duration_secs,
                "total_steps": workflow.steps.len(),
                "successful_steps": successful_steps,
            }),
        )
        .with_correlation(workflow.correlation_id)
    }

    /// One pass of the health loop: stale workers go offline, their
    /// released steps fail with a timeout error, and running steps that
    /// exceeded the step timeout with no worker heartbeat are failed.
    pub async fn health_tick(&self) {
        let heartbeat_timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let step_timeout = chrono::Duration::from_std(self.config.step_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        let now = Utc::now();

        let mut completions: Vec<Message> = Vec::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;

            for (worker_id, released_step) in state.workers.mark_stale_offline(heartbeat_timeout) {
                warn!(worker_id = %worker_id, "worker heartbeat stale, marking offline");
                if let Some(step_id) = released_step {
                    self.fail_step(state, &step_id, "worker heartbeat timeout", &mut completions);
                }
            }

            // Steps that overran their execution budget while the assigned
            // worker also went quiet.
            let mut overdue: Vec<(WorkerId, StepId)> = Vec::new();
            for workflow in state.workflows.values() {
                if workflow.status != ExecutionStatus::Running {
                    continue;
                }
                for step in &workflow.steps {
                    if step.status != ExecutionStatus::Running {
                        continue;
                    }
                    let Some(started) = step.started_at else {
                        continue;
                    };
                    if now - started <= step_timeout {
                        continue;
                    }
                    if let Some(worker_id) = state.workers.assignee(&step.step_id) {
                        let stale = state
                            .workers
                            .get(&worker_id)
                            .is_some_and(|w| now - w.last_heartbeat > heartbeat_timeout);
                        if stale {
                            overdue.push((worker_id, step.step_id.clone()));
                        }
                    }
                }
            }
            for (worker_id, step_id) in overdue {
                warn!(worker_id = %worker_id, step_id = %step_id, "step execution timeout");
                state.workers.set_offline(&worker_id);
                self.fail_step(state, &step_id, "step execution timeout", &mut completions);
            }
        }
        for message in completions {
            self.bus.publish(message).await;
        }
    }

    /// One pass of the metrics loop: samples per-role utilization
    pub async fn metrics_tick(&self) {
        let interval_secs = self.config.metrics_interval.as_secs_f64();
        let state = self.state.read().await;
        for worker in state.workers.iter() {
            self.metrics.record_utilization_interval(
                worker.role,
                worker.availability == WorkerAvailability::Busy,
                interval_secs,
            );
        }
    }

    /// Cancels a workflow: running steps are marked cancelled with the
    /// reason, the workflow leaves the queue, and the terminal state is
    /// `cancelled`. Cancellation is cooperative; in-progress worker calls
    /// are not interrupted, their late results are simply not observed.
    pub async fn cancel(&self, workflow_id: &WorkflowId, reason: &str) -> bool {
        let completion = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(workflow) = state.workflows.get_mut(workflow_id) else {
                return false;
            };
            if workflow.status.is_terminal() {
                return false;
            }

            for step in &mut workflow.steps {
                if step.status == ExecutionStatus::Running {
                    step.status = ExecutionStatus::Cancelled;
                    step.error = Some(format!("cancelled: {reason}"));
                    step.finished_at = Some(Utc::now());
                    if let Some(worker_id) = state.workers.assignee(&step.step_id) {
                        state.workers.clear_assignment(&worker_id);
                    }
                }
            }
            workflow.status = ExecutionStatus::Cancelled;
            workflow.completed_at = Some(Utc::now());
            state.queue.retain(|id| id != workflow_id);
            self.metrics.record_completion(ExecutionStatus::Cancelled, None);
            info!(workflow_id = %workflow_id, reason, "cancelled workflow");

            let successful_steps = workflow
                .steps
                .iter()
                .filter(|s| s.status == ExecutionStatus::Completed)
                .count();
            Message::new(
                MessageKind::WorkflowCompleted,
                self.engine_id.clone(),
                QueueName::from_static("system"),
                json!({
                    "workflow_id": &workflow.workflow_id,
                    "status": ExecutionStatus::Cancelled,
                    "reason": reason,
                    "total_steps": workflow.steps.len(),
                    "successful_steps": successful_steps,
                }),
            )
            .with_correlation(workflow.correlation_id)
        };
        self.bus.publish(completion).await;
        true
    }

    /// Caller-facing status: `{status, progress, steps[]}`
    pub async fn workflow_status(&self, workflow_id: &WorkflowId) -> Option<WorkflowStatusReport> {
        let state = self.state.read().await;
        let workflow = state.workflows.get(workflow_id)?;

        let steps = workflow
            .steps
            .iter()
            .map(|step| StepReport {
                step_id: step.step_id.to_string(),
                role: step.role,
                description: step.description.clone(),
                status: step.status,
                prerequisites: step.prerequisites.iter().map(ToString::to_string).collect(),
                retry_count: step.retry_count,
                max_retries: step.max_retries,
                error: step.error.clone(),
                started_at: step.started_at,
                finished_at: step.finished_at,
                execution_secs: match (step.started_at, step.finished_at) {
                    (Some(start), Some(end)) => {
                        Some((end - start).num_milliseconds() as f64 / 1000.0)
                    }
                    _ => None,
                },
            })
            .collect();

        let completed_steps = workflow
            .steps
            .iter()
            .filter(|s| s.status == ExecutionStatus::Completed)
            .count();
        Some(WorkflowStatusReport {
            workflow_id: workflow.workflow_id.to_string(),
            name: workflow.name.clone(),
            status: workflow.status,
            progress: workflow.progress(),
            total_steps: workflow.steps.len(),
            completed_steps,
            steps,
            created_at: workflow.created_at,
            started_at: workflow.started_at,
            completed_at: workflow.completed_at,
        })
    }

    /// Status of every registered worker
    pub async fn worker_status(&self) -> WorkerStatusSummary {
        let state = self.state.read().await;
        let workers: Vec<WorkerState> = state.workers.iter().cloned().collect();
        WorkerStatusSummary {
            total_registered: workers.len(),
            online: workers
                .iter()
                .filter(|w| w.availability != WorkerAvailability::Offline)
                .count(),
            busy: workers
                .iter()
                .filter(|w| w.availability == WorkerAvailability::Busy)
                .count(),
            workers,
        }
    }

    /// Point-in-time system metrics
    pub async fn system_metrics(&self) -> SystemMetricsSnapshot {
        let state = self.state.read().await;
        let running = state
            .workflows
            .values()
            .filter(|w| w.status == ExecutionStatus::Running)
            .count();
        let max = self.config.max_concurrent_workflows.as_usize();

        SystemMetricsSnapshot {
            workflows: WorkflowCounts {
                total: state.workflows.len(),
                running,
                completed: self.metrics.completed(),
                failed: self.metrics.failed(),
                cancelled: self.metrics.cancelled(),
                queued: state.queue.len(),
            },
            workers: WorkerCounts {
                total_registered: state.workers.len(),
                online: state
                    .workers
                    .iter()
                    .filter(|w| w.availability != WorkerAvailability::Offline)
                    .count(),
                busy: state
                    .workers
                    .iter()
                    .filter(|w| w.availability == WorkerAvailability::Busy)
                    .count(),
            },
            average_completion_secs: self.metrics.average_completion_secs(),
            system_load: running as f64 / max as f64,
            utilization: self.metrics.utilization_by_role(),
        }
    }

    // Message handling

    async fn on_message(&self, message: Message) {
        match message.kind {
            MessageKind::ContentExtracted => self.handle_step_completed(message).await,
            MessageKind::JobFailed => self.handle_step_failed(message).await,
            MessageKind::AgentHealthCheck => self.handle_heartbeat(message).await,
            MessageKind::WorkflowRequest => self.handle_workflow_request(message).await,
            _ => {}
        }
    }

    async fn handle_step_completed(&self, message: Message) {
        let Some(step_id) = step_id_from(&message.payload) else {
            warn!(message_id = %message.id, "completion without step id");
            return;
        };

        let mut ack_role: Option<WorkerRole> = None;
        let mut completion: Option<Message> = None;
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(workflow_id) = owning_workflow(state, &step_id) else {
                warn!(step_id = %step_id, "completion for unknown step");
                return;
            };
            let assignee = state.workers.assignee(&step_id);
            let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
                return;
            };

            if workflow.status.is_terminal() {
                // Cooperative cancellation: the late result is not observed.
                debug!(step_id = %step_id, "ignoring late result for terminal workflow");
                if let Some(worker_id) = assignee {
                    state.workers.clear_assignment(&worker_id);
                }
                return;
            }

            let Some(step) = workflow.step_mut(&step_id) else {
                return;
            };
            if step.status != ExecutionStatus::Running {
                debug!(step_id = %step_id, status = ?step.status, "duplicate or stale completion ignored");
                return;
            }

            step.status = ExecutionStatus::Completed;
            step.result = Some(message.payload.clone());
            step.finished_at = Some(Utc::now());
            ack_role = Some(step.role);
            info!(step_id = %step_id, "step completed");

            if let Some(worker_id) = assignee {
                state.workers.release(&worker_id, true);
            }
            if workflow.all_steps_terminal() {
                completion = Some(self.finalize_workflow(workflow));
            }
        }

        if let Some(role) = ack_role {
            self.router
                .record_ack(&QueueRouter::queue_for_role(role.as_str()), true);
        }
        if let Some(message) = completion {
            self.bus.publish(message).await;
        }
    }

    async fn handle_step_failed(&self, message: Message) {
        let Some(step_id) = step_id_from(&message.payload) else {
            // Dead-letter envelopes also use job-failed; they carry no step id.
            return;
        };
        let error = message
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();

        let mut completions: Vec<Message> = Vec::new();
        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            if owning_workflow(state, &step_id).is_none() {
                warn!(step_id = %step_id, "failure for unknown step");
                return;
            }
            self.fail_step(state, &step_id, &error, &mut completions);
        }
        for message in completions {
            self.bus.publish(message).await;
        }
    }

    /// Applies a worker execution failure to a step: the retry count
    /// increases and the step re-queues until retries are exhausted, then
    /// fails. The assigned worker returns to idle with its error counter
    /// incremented.
    fn fail_step(
        &self,
        state: &mut EngineState,
        step_id: &StepId,
        error: &str,
        completions: &mut Vec<Message>,
    ) {
        let Some(workflow_id) = owning_workflow(state, step_id) else {
            return;
        };
        let assignee = state.workers.assignee(step_id);
        let Some(workflow) = state.workflows.get_mut(&workflow_id) else {
            return;
        };

        if workflow.status.is_terminal() {
            if let Some(worker_id) = assignee {
                state.workers.clear_assignment(&worker_id);
            }
            return;
        }

        let Some(step) = workflow.step_mut(step_id) else {
            return;
        };
        if step.status.is_terminal() {
            debug!(step_id = %step_id, "failure for terminal step ignored");
            return;
        }

        step.retry_count += 1;
        step.error = Some(error.to_string());
        let ack_role = step.role;
        if step.retry_count < step.max_retries {
            step.status = ExecutionStatus::Pending;
            step.started_at = None;
            warn!(
                step_id = %step_id,
                attempt = step.retry_count,
                max_retries = step.max_retries,
                error,
                "step failed, requeueing"
            );
        } else {
            step.status = ExecutionStatus::Failed;
            step.finished_at = Some(Utc::now());
            error!(
                step_id = %step_id,
                retries = step.retry_count,
                error,
                "step failed permanently"
            );
        }

        if let Some(worker_id) = assignee {
            state.workers.release(&worker_id, false);
        }
        self.router
            .record_ack(&QueueRouter::queue_for_role(ack_role.as_str()), false);

        if workflow.all_steps_terminal() {
            completions.push(self.finalize_workflow(workflow));
        }
    }

    async fn handle_heartbeat(&self, message: Message) {
        let Some(worker_id) = message
            .payload
            .get("worker_id")
            .and_then(Value::as_str)
            .map(|s| WorkerId::new(s.to_string()))
        else {
            return;
        };
        let reported = message.payload.get("status").and_then(Value::as_str);
        let metrics = message.payload.get("metrics");
        self.state
            .write()
            .await
            .workers
            .heartbeat(&worker_id, reported, metrics);
    }

    async fn handle_workflow_request(&self, message: Message) {
        let payload = &message.payload;
        let request_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("extraction");
        if request_type != "extraction" {
            warn!(request_type, "unknown workflow request type");
            return;
        }
        let Some(url) = payload.get("url").and_then(Value::as_str) else {
            error!("workflow request missing required url");
            return;
        };
        let config: ExtractionConfig = payload
            .get("config")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let workflow_id = self.submit_extraction(url, &config).await;
        let reply = message.reply(
            MessageKind::WorkflowCreated,
            self.engine_id.clone(),
            QueueName::from_static(&message.sender),
            json!({ "workflow_id": workflow_id, "status": "created" }),
        );
        self.bus.publish(reply).await;
    }
}

fn step_id_from(payload: &Value) -> Option<StepId> {
    payload
        .get("step_id")
        .and_then(Value::as_str)
        .map(|s| StepId::new(s.to_string()))
}

fn owning_workflow(state: &EngineState, step_id: &StepId) -> Option<WorkflowId> {
    state
        .workflows
        .values()
        .find(|w| w.step(step_id).is_some())
        .map(|w| w.workflow_id.clone())
}

/// Bus-channel subscriber feeding engine message handlers
struct EngineSubscriber {
    engine: Weak<WorkflowEngine>,
}

#[async_trait]
impl MessageHandler for EngineSubscriber {
    async fn handle(&self, message: Message) -> Result<(), BusError> {
        if let Some(engine) = self.engine.upgrade() {
            engine.on_message(message).await;
        }
        Ok(())
    }
}
