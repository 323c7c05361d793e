//! The worker harness: queue consumption, heartbeats, and result reporting
//!
//! A harness binds one [`StepExecutor`] instance to its role queue. It
//! parses assignments, enforces the per-step timeout locally, and publishes
//! `content-extracted` or `job-failed` carrying the step id, always under
//! the correlation id of the triggering message. Workers never write engine
//! state directly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::sessions::SessionStore;
use super::{StepAssignment, WorkerError};
use crate::domain_types::{QueueName, WorkerId};
use crate::engine::{WorkerRole, WorkflowEngine};
use crate::messaging::{BusError, Message, MessageBus, MessageHandler, MessageKind, QueueRouter};

/// Default heartbeat cadence
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Executes one kind of step. Implementations wrap the external services
/// behind the optimizer; the kernel sees only this seam.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The role this executor fills
    fn role(&self) -> WorkerRole;

    /// Capability tags advertised at registration
    fn capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    /// Performs the step, returning the result payload
    async fn execute(&self, assignment: &StepAssignment) -> Result<Value, WorkerError>;
}

/// Long-lived runtime for one worker instance
pub struct WorkerHarness {
    worker_id: WorkerId,
    executor: Arc<dyn StepExecutor>,
    bus: Arc<MessageBus>,
    sessions: Arc<SessionStore>,
    busy: AtomicBool,
    jobs_processed: AtomicU64,
    errors: AtomicU64,
    running: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WorkerHarness {
    #[must_use]
    pub fn new(
        worker_id: WorkerId,
        executor: Arc<dyn StepExecutor>,
        bus: Arc<MessageBus>,
        sessions: Arc<SessionStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_id,
            executor,
            bus,
            sessions,
            busy: AtomicBool::new(false),
            jobs_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Registers with the engine, subscribes to the role queue, and starts
    /// the heartbeat loop
    pub async fn start(self: &Arc<Self>, engine: &Arc<WorkflowEngine>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let role = self.executor.role();
        engine
            .register_worker(self.worker_id.clone(), role, self.executor.capabilities())
            .await;

        let handler: Arc<dyn MessageHandler> = Arc::new(HarnessHandler {
            harness: Arc::clone(self),
        });
        self.bus
            .subscribe_queue(QueueRouter::queue_for_role(role.as_str()), handler)
            .await;

        let harness = Arc::clone(self);
        let heartbeat = tokio::spawn(async move {
            while harness.running.load(Ordering::Acquire) {
                harness.send_heartbeat().await;
                tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            }
        });
        self.tasks.lock().await.push(heartbeat);
        info!(worker_id = %self.worker_id, role = %role, "worker started");
    }

    /// Stops the heartbeat loop; queued messages stay on the bus
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
    }

    async fn send_heartbeat(&self) {
        let status = if self.busy.load(Ordering::Acquire) {
            "busy"
        } else {
            "idle"
        };
        let message = Message::new(
            MessageKind::AgentHealthCheck,
            self.worker_id.to_string(),
            QueueName::from_static("orchestrator"),
            json!({
                "worker_id": self.worker_id,
                "status": status,
                "metrics": {
                    "jobs_processed": self.jobs_processed.load(Ordering::Relaxed),
                    "errors": self.errors.load(Ordering::Relaxed),
                    "queue_length": 0,
                },
            }),
        );
        self.bus.publish(message).await;
    }

    async fn handle_job(&self, message: Message) {
        let mut assignment: StepAssignment =
            match serde_json::from_value(message.payload.clone()) {
                Ok(assignment) => assignment,
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "malformed job assignment");
                    return;
                }
            };
        // The role queue fans out to every registered instance; only the
        // assigned one runs the job.
        if assignment.worker_id != self.worker_id.to_string() {
            debug!(step_id = %assignment.step_id, "assignment targets another instance");
            return;
        }

        assignment.session = self.sessions.get_or_create(message.correlation_id);
        self.busy.store(true, Ordering::Release);
        let started = Message::new(
            MessageKind::JobStarted,
            self.worker_id.to_string(),
            QueueName::from_static("orchestrator"),
            json!({ "step_id": assignment.step_id, "worker_id": self.worker_id }),
        )
        .with_correlation(message.correlation_id);
        self.bus.publish(started).await;

        let budget = Duration::from_secs(assignment.timeout_secs);
        let outcome = match tokio::time::timeout(budget, self.executor.execute(&assignment)).await
        {
            Ok(result) => result,
            Err(_) => Err(WorkerError::ExecutionFailed {
                reason: format!("timed out after {}s", assignment.timeout_secs),
            }),
        };
        self.busy.store(false, Ordering::Release);

        let reply = match outcome {
            Ok(result) => {
                self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                info!(step_id = %assignment.step_id, "step executed");
                message.reply(
                    MessageKind::ContentExtracted,
                    self.worker_id.to_string(),
                    QueueName::from_static("orchestrator"),
                    json!({
                        "step_id": assignment.step_id,
                        "worker_id": self.worker_id,
                        "data": result,
                    }),
                )
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(step_id = %assignment.step_id, error = %e, "step execution failed");
                message.reply(
                    MessageKind::JobFailed,
                    self.worker_id.to_string(),
                    QueueName::from_static("orchestrator"),
                    json!({
                        "step_id": assignment.step_id,
                        "worker_id": self.worker_id,
                        "error": e.to_string(),
                    }),
                )
            }
        };
        self.bus.publish(reply).await;
    }
}

struct HarnessHandler {
    harness: Arc<WorkerHarness>,
}

#[async_trait]
impl MessageHandler for HarnessHandler {
    async fn handle(&self, message: Message) -> Result<(), BusError> {
        if message.kind == MessageKind::JobCreated {
            self.harness.handle_job(message).await;
        }
        Ok(())
    }
}
