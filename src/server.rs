//! Caller-facing HTTP surface
//!
//! Submission, status, and cancel endpoints over the engine, plus health
//! and metrics snapshots covering the bus, cache, optimizer, and queues.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower::limit::ConcurrencyLimitLayer;
use tracing::info;

use crate::cache::CacheStore;
use crate::domain_types::WorkflowId;
use crate::engine::{CustomWorkflowSpec, EngineError, ExtractionConfig, WorkflowEngine};
use crate::messaging::{MessageBus, QueueRouter};
use crate::optimizer::RequestOptimizer;

/// Maximum concurrently served HTTP requests
const MAX_INFLIGHT_REQUESTS: usize = 256;

/// Shared handles the HTTP surface exposes
#[derive(Clone)]
pub struct KernelHandles {
    pub engine: Arc<WorkflowEngine>,
    pub bus: Arc<MessageBus>,
    pub router: Arc<QueueRouter>,
    pub cache: Arc<CacheStore>,
    pub optimizer: Arc<RequestOptimizer>,
}

/// Builds the axum application
pub fn create_app(handles: KernelHandles) -> Router {
    Router::new()
        .route("/workflows", post(submit_workflow))
        .route("/workflows/custom", post(submit_custom_workflow))
        .route("/workflows/{id}", get(workflow_status))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workers", get(worker_status))
        .route("/queues", get(queue_status))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(ConcurrencyLimitLayer::new(MAX_INFLIGHT_REQUESTS))
        .with_state(handles)
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    url: String,
    #[serde(default)]
    config: ExtractionConfig,
}

async fn submit_workflow(
    State(handles): State<KernelHandles>,
    Json(request): Json<SubmitRequest>,
) -> (StatusCode, Json<Value>) {
    let workflow_id = handles
        .engine
        .submit_extraction(&request.url, &request.config)
        .await;
    info!(workflow_id = %workflow_id, "workflow submitted over http");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "workflow_id": workflow_id, "status": "created" })),
    )
}

async fn submit_custom_workflow(
    State(handles): State<KernelHandles>,
    Json(spec): Json<CustomWorkflowSpec>,
) -> (StatusCode, Json<Value>) {
    match handles.engine.submit_custom(spec).await {
        Ok(workflow_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "workflow_id": workflow_id, "status": "created" })),
        ),
        Err(EngineError::InvalidWorkflow { workflow_id, reason }) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "workflow_id": workflow_id, "error": reason })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn workflow_status(
    State(handles): State<KernelHandles>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let workflow_id = WorkflowId::new(id);
    match handles.engine.workflow_status(&workflow_id).await {
        Some(report) => (
            StatusCode::OK,
            Json(serde_json::to_value(report).unwrap_or_else(|_| json!({}))),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("workflow not found: {workflow_id}") })),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    #[serde(default = "default_cancel_reason")]
    reason: String,
}

fn default_cancel_reason() -> String {
    "user requested".to_string()
}

async fn cancel_workflow(
    State(handles): State<KernelHandles>,
    Path(id): Path<String>,
    Json(request): Json<CancelRequest>,
) -> (StatusCode, Json<Value>) {
    let workflow_id = WorkflowId::new(id);
    if handles.engine.cancel(&workflow_id, &request.reason).await {
        (
            StatusCode::OK,
            Json(json!({ "workflow_id": workflow_id, "status": "cancelled" })),
        )
    } else {
        (
            StatusCode::CONFLICT,
            Json(json!({ "error": "workflow not found or already terminal" })),
        )
    }
}

async fn worker_status(State(handles): State<KernelHandles>) -> Json<Value> {
    let summary = handles.engine.worker_status().await;
    Json(serde_json::to_value(summary).unwrap_or_else(|_| json!({})))
}

async fn queue_status(State(handles): State<KernelHandles>) -> Json<Value> {
    let queues = handles.router.all_queue_status().await;
    Json(serde_json::to_value(queues).unwrap_or_else(|_| json!([])))
}

async fn health(State(handles): State<KernelHandles>) -> (StatusCode, Json<Value>) {
    let bus = handles.bus.health_check().await;
    let healthy = bus.reachable && handles.engine.is_running();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "engine_running": handles.engine.is_running(),
            "bus": bus,
        })),
    )
}

async fn metrics(State(handles): State<KernelHandles>) -> Json<Value> {
    let system = handles.engine.system_metrics().await;
    let cache = handles.cache.stats().await;
    let optimizer = handles.optimizer.metrics();
    Json(json!({
        "system": system,
        "cache": cache,
        "optimizer": optimizer,
    }))
}
