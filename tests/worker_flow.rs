//! End-to-end kernel flow: submitted workflow runs through real harnessed
//! workers (with scripted external services) to completion

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::Mutex;

use regula::cache::{CacheConfig, CacheStore};
use regula::domain_types::{QueueName, WorkerId};
use regula::engine::{EngineConfig, ExecutionStatus, ExtractionConfig, WorkflowEngine};
use regula::messaging::{
    BusError, Message, MessageBus, MessageHandler, MessageKind, QueueRouter,
};
use regula::optimizer::{OptimizerConfig, RequestOptimizer};
use regula::services::{
    ContentFetcher, FetchedPage, ImageAnalysis, ImageProcessor, LanguageModelService, LlmRequest,
    LlmResponse, PdfExtraction, PdfProcessor, ServiceError, TextRegion,
};
use regula::workers::executors::{
    AnalysisExecutor, HtmlExtractionExecutor, OrchestrationExecutor, PdfAnalysisExecutor,
    ValidationExecutor, VisionProcessingExecutor,
};
use regula::workers::{SessionStore, StepExecutor, WorkerHarness};

struct ScriptedLlm;

#[async_trait]
impl LanguageModelService for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ServiceError> {
        Ok(LlmResponse {
            text: format!("scripted response from {}", request.model),
            tool_calls: vec![],
        })
    }
}

struct StaticFetcher;

#[async_trait]
impl ContentFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ServiceError> {
        Ok(FetchedPage {
            bytes: Bytes::from_static(b"<html><h1>Act No. 12 of 2026</h1></html>"),
            final_url: url.to_string(),
            headers: HashMap::new(),
        })
    }

    async fn render(&self, url: &str) -> Result<FetchedPage, ServiceError> {
        self.fetch(url).await
    }
}

struct StaticPdf;

#[async_trait]
impl PdfProcessor for StaticPdf {
    async fn extract(&self, _bytes: Bytes, _ocr: bool) -> Result<PdfExtraction, ServiceError> {
        Ok(PdfExtraction {
            text: "Article 1. Scope.".to_string(),
            token_confidences: vec![0.98],
        })
    }
}

struct StaticVision;

#[async_trait]
impl ImageProcessor for StaticVision {
    async fn analyze(&self, _bytes: Bytes) -> Result<ImageAnalysis, ServiceError> {
        Ok(ImageAnalysis {
            description: "scanned gazette page".to_string(),
            text_regions: vec![TextRegion {
                text: "Official Gazette".to_string(),
                bounds: (0, 0, 100, 20),
                confidence: 0.9,
            }],
            confidence: 0.9,
        })
    }
}

struct CompletionCollector {
    seen: Arc<Mutex<Vec<Message>>>,
}

#[async_trait]
impl MessageHandler for CompletionCollector {
    async fn handle(&self, message: Message) -> Result<(), BusError> {
        self.seen.lock().await.push(message);
        Ok(())
    }
}

#[test_log::test(tokio::test)]
async fn extraction_workflow_runs_to_completion_through_real_workers() {
    let bus = Arc::new(MessageBus::new());
    let router = Arc::new(QueueRouter::new(Arc::clone(&bus)));
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheStore::new(CacheConfig {
        file_dir: dir.path().to_path_buf(),
        ..CacheConfig::default()
    }));
    let optimizer = Arc::new(RequestOptimizer::new(
        OptimizerConfig::default(),
        Arc::clone(&cache),
    ));
    let engine = Arc::new(WorkflowEngine::new(
        EngineConfig::testing(),
        Arc::clone(&bus),
        Arc::clone(&router),
    ));
    engine.start().await;

    let llm: Arc<dyn LanguageModelService> = Arc::new(ScriptedLlm);
    let fetcher: Arc<dyn ContentFetcher> = Arc::new(StaticFetcher);
    let sessions = Arc::new(SessionStore::new(Duration::from_secs(3600)));

    let executors: Vec<Arc<dyn StepExecutor>> = vec![
        Arc::new(AnalysisExecutor::new(
            Arc::clone(&llm),
            Arc::clone(&fetcher),
            Arc::clone(&optimizer),
        )),
        Arc::new(OrchestrationExecutor),
        Arc::new(HtmlExtractionExecutor::new(
            Arc::clone(&fetcher),
            Arc::clone(&llm),
            Arc::clone(&optimizer),
        )),
        Arc::new(PdfAnalysisExecutor::new(
            Arc::clone(&fetcher),
            Arc::new(StaticPdf),
            Arc::clone(&optimizer),
        )),
        Arc::new(VisionProcessingExecutor::new(
            Arc::clone(&fetcher),
            Arc::new(StaticVision),
            Arc::clone(&optimizer),
        )),
        Arc::new(ValidationExecutor::new(
            Arc::clone(&llm),
            Arc::clone(&optimizer),
        )),
    ];

    let mut harnesses = Vec::new();
    for executor in executors {
        let worker_id = WorkerId::generate(executor.role().as_str());
        let harness = WorkerHarness::new(
            worker_id,
            executor,
            Arc::clone(&bus),
            Arc::clone(&sessions),
        );
        harness.start(&engine).await;
        harnesses.push(harness);
    }

    // Observe the caller-facing completion message.
    let completions = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_channel(
        MessageKind::WorkflowCompleted,
        Arc::new(CompletionCollector {
            seen: Arc::clone(&completions),
        }),
    )
    .await;

    let config = ExtractionConfig {
        include_pdfs: true,
        include_images: true,
        ..ExtractionConfig::default()
    };
    let workflow_id = engine
        .submit_extraction("https://legislation.example.gov/acts", &config)
        .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let report = engine.workflow_status(&workflow_id).await.unwrap();
        if report.status.is_terminal() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow did not finish: {report:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let report = engine.workflow_status(&workflow_id).await.unwrap();
    assert_eq!(report.status, ExecutionStatus::Completed);
    assert_eq!(report.total_steps, 6);
    assert_eq!(report.completed_steps, 6);
    assert!((report.progress - 1.0).abs() < f64::EPSILON);
    for step in &report.steps {
        assert_eq!(step.status, ExecutionStatus::Completed, "step {}", step.step_id);
        assert!(step.execution_secs.is_some());
    }

    // The completion message reached the caller-facing queue with the
    // workflow id and aggregate outcome.
    let seen = completions.lock().await;
    let completion = seen
        .iter()
        .find(|m| m.payload["workflow_id"] == json!(workflow_id.to_string()))
        .expect("workflow-completed message not observed");
    assert_eq!(completion.payload["status"], json!("completed"));
    assert_eq!(completion.payload["total_steps"], json!(6));
    assert_eq!(completion.recipient, QueueName::from_static("system"));

    // The optimizer actually carried the external traffic.
    let metrics = optimizer.metrics();
    assert!(metrics.total_requests > 0);

    for harness in &harnesses {
        harness.stop().await;
    }
    engine.stop().await;
    bus.shutdown().await;
}
