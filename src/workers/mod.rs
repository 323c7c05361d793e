//! Worker runtime: the contract between the engine and the specialists
//!
//! Workers are process-local actors that consume `job-created` messages
//! from their role queue, execute through a [`StepExecutor`], and report
//! back over the bus with `content-extracted` or `job-failed`. The kernel
//! treats their internals as opaque; only the message schema is fixed.

pub mod executors;
pub mod harness;
pub mod sessions;
pub mod tools;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::engine::TaskPriority;
use crate::optimizer::OptimizerError;
use crate::services::ServiceError;

pub use harness::{StepExecutor, WorkerHarness};
pub use sessions::SessionStore;
pub use tools::{ToolDefinition, ToolHandler, ToolRegistry};

/// Errors a worker can hit while executing a step
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("step execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("malformed assignment: {reason}")]
    MalformedAssignment { reason: String },

    #[error("unknown tool: {name}")]
    UnknownTool { name: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

/// The payload of a `job-created` message, as the worker sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAssignment {
    pub step_id: String,
    pub workflow_id: String,
    /// The worker instance the engine assigned; other instances of the
    /// same role ignore the message
    pub worker_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Opaque continuity token managed by the harness, keyed by
    /// correlation id
    #[serde(default)]
    pub session: Value,
}

fn default_timeout_secs() -> u64 {
    30 * 60
}
