//! The workflow engine: DAG execution over heterogeneous worker pools
//!
//! The engine owns all job, step, and worker state. Workers communicate
//! exclusively through the bus; the engine reacts to their result messages
//! and advances each workflow's DAG from a periodic dispatch tick.

pub mod engine;
pub mod metrics;
pub mod registry;
pub mod workflow;

use thiserror::Error;

use crate::domain_types::WorkflowId;

pub use engine::{
    EngineConfig, StepReport, WorkflowEngine, WorkflowStatusReport, WorkerStatusSummary,
};
pub use metrics::{EngineMetrics, RoleUtilization, SystemMetricsSnapshot};
pub use registry::{WorkerAvailability, WorkerRegistry, WorkerState};
pub use workflow::{
    build_extraction_workflow, validate_dag, AnalysisDepth, CustomStepSpec, CustomWorkflowSpec,
    ExecutionStatus, ExtractionConfig, ImageAnalysisDepth, TaskPriority, ValidationLevel,
    WorkerRole, Workflow, WorkflowStep,
};

/// Errors surfaced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {workflow_id}")]
    WorkflowNotFound { workflow_id: WorkflowId },

    /// Configuration errors (unknown role, unresolved prerequisite, cyclic
    /// DAG) are fatal before execution: the workflow is rejected and
    /// recorded as failed immediately.
    #[error("invalid workflow {workflow_id}: {reason}")]
    InvalidWorkflow {
        workflow_id: WorkflowId,
        reason: String,
    },
}
