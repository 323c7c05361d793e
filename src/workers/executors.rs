//! Built-in step executors for the extraction roles
//!
//! Each executor wraps the external services behind the optimizer: model
//! calls go through `execute_llm` (cache + coalescing + retry), per-URL
//! work goes through `execute_extraction`. The engine never sees any of
//! this; it only consumes the result payloads.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::debug;

use super::tools::{ToolDefinition, ToolHandler, ToolRegistry};
use super::{StepAssignment, StepExecutor, WorkerError};
use crate::engine::WorkerRole;
use crate::optimizer::{LlmCallSpec, RequestOptimizer};
use crate::services::{
    ChatMessage, ContentFetcher, ImageProcessor, LanguageModelService, LlmRequest, LlmResponse,
    PdfProcessor,
};

const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TEMPERATURE: f32 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 4000;
const CONTENT_PREVIEW_BYTES: usize = 8 * 1024;

fn llm_request(system: &str, user: String, tools: Option<Value>) -> LlmRequest {
    LlmRequest {
        model: DEFAULT_MODEL.to_string(),
        messages: vec![
            ChatMessage::new("system", system),
            ChatMessage::new("user", user),
        ],
        tools,
        temperature: DEFAULT_TEMPERATURE,
        max_tokens: DEFAULT_MAX_TOKENS,
    }
}

fn call_spec(request: &LlmRequest) -> Result<LlmCallSpec, WorkerError> {
    let messages = request
        .messages
        .iter()
        .map(|m| serde_json::to_value(m))
        .collect::<Result<Vec<Value>, _>>()
        .map_err(|e| WorkerError::ExecutionFailed {
            reason: format!("unserializable request: {e}"),
        })?;
    Ok(LlmCallSpec {
        model: request.model.clone(),
        messages,
        tools: request.tools.clone(),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    })
}

/// Runs a model request through the optimizer, returning the decoded
/// response
async fn complete(
    optimizer: &RequestOptimizer,
    llm: &Arc<dyn LanguageModelService>,
    request: &LlmRequest,
) -> Result<LlmResponse, WorkerError> {
    let spec = call_spec(request)?;
    let value = optimizer
        .execute_llm(&spec, || async move {
            let response = llm
                .complete(request)
                .await
                .map_err(Into::<crate::optimizer::OptimizerError>::into)?;
            serde_json::to_value(&response)
                .map_err(|e| crate::optimizer::OptimizerError::Internal {
                    reason: format!("unserializable response: {e}"),
                })
        })
        .await?;
    serde_json::from_value(value).map_err(|e| WorkerError::ExecutionFailed {
        reason: format!("undecodable model response: {e}"),
    })
}

/// Runs a tool-enabled model conversation: tool calls requested by the
/// model are invoked through the registry and fed back for one final turn.
async fn complete_with_tools(
    optimizer: &RequestOptimizer,
    llm: &Arc<dyn LanguageModelService>,
    tools: &ToolRegistry,
    mut request: LlmRequest,
) -> Result<LlmResponse, WorkerError> {
    if !tools.is_empty() {
        request.tools = Some(tools.schema());
    }
    let response = complete(optimizer, llm, &request).await?;
    if response.tool_calls.is_empty() {
        return Ok(response);
    }

    for call in &response.tool_calls {
        debug!(tool = %call.name, "invoking requested tool");
        let result = tools.invoke(&call.name, call.arguments.clone()).await?;
        request.messages.push(ChatMessage::new(
            "tool",
            json!({ "tool": call.name, "result": result }).to_string(),
        ));
    }
    request.tools = None;
    complete(optimizer, llm, &request).await
}

fn string_field<'a>(input: &'a Value, key: &str) -> Result<&'a str, WorkerError> {
    input
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| WorkerError::MalformedAssignment {
            reason: format!("missing field: {key}"),
        })
}

fn preview(bytes: &Bytes) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.chars().take(CONTENT_PREVIEW_BYTES).collect()
}

/// Tool exposing the fetcher to the model
struct FetchPageTool {
    fetcher: Arc<dyn ContentFetcher>,
}

#[async_trait]
impl ToolHandler for FetchPageTool {
    async fn invoke(&self, arguments: Value) -> Result<Value, WorkerError> {
        let url = string_field(&arguments, "url")?;
        let page = self.fetcher.fetch(url).await?;
        Ok(json!({
            "final_url": page.final_url,
            "content": preview(&page.bytes),
        }))
    }
}

/// Analyzes a site and proposes an extraction strategy
pub struct AnalysisExecutor {
    llm: Arc<dyn LanguageModelService>,
    optimizer: Arc<RequestOptimizer>,
    tools: ToolRegistry,
}

impl AnalysisExecutor {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LanguageModelService>,
        fetcher: Arc<dyn ContentFetcher>,
        optimizer: Arc<RequestOptimizer>,
    ) -> Self {
        let mut tools = ToolRegistry::new();
        tools.register(
            ToolDefinition {
                name: "fetch_page".to_string(),
                description: "Fetch a URL and return its content".to_string(),
                schema: json!({
                    "type": "object",
                    "properties": { "url": { "type": "string" } },
                    "required": ["url"],
                }),
            },
            Arc::new(FetchPageTool { fetcher }),
        );
        Self {
            llm,
            optimizer,
            tools,
        }
    }
}

#[async_trait]
impl StepExecutor for AnalysisExecutor {
    fn role(&self) -> WorkerRole {
        WorkerRole::Analysis
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["site_analysis".to_string(), "strategy_planning".to_string()]
    }

    async fn execute(&self, assignment: &StepAssignment) -> Result<Value, WorkerError> {
        let url = string_field(&assignment.input, "url")?;
        let depth = assignment.input["analysis_depth"]
            .as_str()
            .unwrap_or("standard");

        let request = llm_request(
            "You analyze government and legal websites and propose a \
             document extraction strategy. Answer with JSON.",
            format!("Analyze {url} at {depth} depth. Identify document listings, PDF links, and pagination."),
            None,
        );
        let response = complete_with_tools(&self.optimizer, &self.llm, &self.tools, request).await?;
        Ok(json!({
            "url": url,
            "analysis_depth": depth,
            "analysis": response.text,
        }))
    }
}

/// Plans the extraction stages from the analysis and job config
pub struct OrchestrationExecutor;

#[async_trait]
impl StepExecutor for OrchestrationExecutor {
    fn role(&self) -> WorkerRole {
        WorkerRole::Orchestrator
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["workflow_planning".to_string()]
    }

    async fn execute(&self, assignment: &StepAssignment) -> Result<Value, WorkerError> {
        let url = string_field(&assignment.input, "url")?;
        let config = assignment.input.get("config").cloned().unwrap_or(json!({}));

        let mut stages = vec!["html_extraction"];
        if config["include_pdfs"].as_bool().unwrap_or(true) {
            stages.push("pdf_analysis");
        }
        if config["include_images"].as_bool().unwrap_or(false) {
            stages.push("vision_processing");
        }
        stages.push("validation");

        Ok(json!({
            "url": url,
            "plan": { "stages": stages, "strategy": "adaptive" },
        }))
    }
}

/// Extracts document content from rendered HTML
pub struct HtmlExtractionExecutor {
    fetcher: Arc<dyn ContentFetcher>,
    llm: Arc<dyn LanguageModelService>,
    optimizer: Arc<RequestOptimizer>,
}

impl HtmlExtractionExecutor {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        llm: Arc<dyn LanguageModelService>,
        optimizer: Arc<RequestOptimizer>,
    ) -> Self {
        Self {
            fetcher,
            llm,
            optimizer,
        }
    }
}

#[async_trait]
impl StepExecutor for HtmlExtractionExecutor {
    fn role(&self) -> WorkerRole {
        WorkerRole::HtmlExtractor
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["html_extraction".to_string(), "dom_rendering".to_string()]
    }

    async fn execute(&self, assignment: &StepAssignment) -> Result<Value, WorkerError> {
        let url = string_field(&assignment.input, "url")?.to_string();
        let strategy = assignment.input["extraction_strategy"]
            .as_str()
            .unwrap_or("adaptive")
            .to_string();

        let results = self
            .optimizer
            .execute_extraction(&[url.clone()], &strategy, |target| {
                let strategy = strategy.clone();
                async move {
                    let page = self
                        .fetcher
                        .render(&target)
                        .await
                        .map_err(crate::optimizer::OptimizerError::call_failed)?;
                    let request = llm_request(
                        "You extract regulatory documents (acts, bills, directives) \
                         from HTML. Return the documents as JSON.",
                        format!(
                            "Extraction strategy: {strategy}. Page {target} content:\n{}",
                            preview(&page.bytes)
                        ),
                        None,
                    );
                    let response = complete(&self.optimizer, &self.llm, &request)
                        .await
                        .map_err(crate::optimizer::OptimizerError::call_failed)?;
                    Ok(json!({
                        "url": target,
                        "final_url": page.final_url,
                        "documents": response.text,
                    }))
                }
            })
            .await?;

        Ok(json!({ "url": url, "extraction": results.first().cloned() }))
    }
}

/// Extracts text from linked PDF documents
pub struct PdfAnalysisExecutor {
    fetcher: Arc<dyn ContentFetcher>,
    pdf: Arc<dyn PdfProcessor>,
    optimizer: Arc<RequestOptimizer>,
}

impl PdfAnalysisExecutor {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        pdf: Arc<dyn PdfProcessor>,
        optimizer: Arc<RequestOptimizer>,
    ) -> Self {
        Self {
            fetcher,
            pdf,
            optimizer,
        }
    }
}

#[async_trait]
impl StepExecutor for PdfAnalysisExecutor {
    fn role(&self) -> WorkerRole {
        WorkerRole::PdfAnalyzer
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["pdf_extraction".to_string(), "ocr".to_string()]
    }

    async fn execute(&self, assignment: &StepAssignment) -> Result<Value, WorkerError> {
        let url = string_field(&assignment.input, "url")?.to_string();
        let ocr_enabled = assignment.input["ocr_enabled"].as_bool().unwrap_or(true);

        let results = self
            .optimizer
            .execute_extraction(&[url.clone()], "pdf", |target| async move {
                let page = self
                    .fetcher
                    .fetch(&target)
                    .await
                    .map_err(crate::optimizer::OptimizerError::call_failed)?;
                let extraction = self
                    .pdf
                    .extract(page.bytes, ocr_enabled)
                    .await
                    .map_err(crate::optimizer::OptimizerError::call_failed)?;
                let mean_confidence = if extraction.token_confidences.is_empty() {
                    1.0
                } else {
                    extraction.token_confidences.iter().sum::<f32>()
                        / extraction.token_confidences.len() as f32
                };
                Ok(json!({
                    "url": target,
                    "text": extraction.text,
                    "mean_confidence": mean_confidence,
                    "ocr_enabled": ocr_enabled,
                }))
            })
            .await?;

        Ok(json!({ "url": url, "pdf_content": results.first().cloned() }))
    }
}

/// Analyzes images and scanned figures on a page
pub struct VisionProcessingExecutor {
    fetcher: Arc<dyn ContentFetcher>,
    images: Arc<dyn ImageProcessor>,
    optimizer: Arc<RequestOptimizer>,
}

impl VisionProcessingExecutor {
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        images: Arc<dyn ImageProcessor>,
        optimizer: Arc<RequestOptimizer>,
    ) -> Self {
        Self {
            fetcher,
            images,
            optimizer,
        }
    }
}

#[async_trait]
impl StepExecutor for VisionProcessingExecutor {
    fn role(&self) -> WorkerRole {
        WorkerRole::VisionProcessor
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["image_analysis".to_string()]
    }

    async fn execute(&self, assignment: &StepAssignment) -> Result<Value, WorkerError> {
        let url = string_field(&assignment.input, "url")?.to_string();
        let depth = assignment.input["image_analysis_depth"]
            .as_str()
            .unwrap_or("basic")
            .to_string();

        let results = self
            .optimizer
            .execute_extraction(&[url.clone()], "vision", |target| {
                let depth = depth.clone();
                async move {
                    let page = self
                        .fetcher
                        .fetch(&target)
                        .await
                        .map_err(crate::optimizer::OptimizerError::call_failed)?;
                    let analysis = self
                        .images
                        .analyze(page.bytes)
                        .await
                        .map_err(crate::optimizer::OptimizerError::call_failed)?;
                    Ok(json!({
                        "url": target,
                        "description": analysis.description,
                        "text_regions": analysis.text_regions.len(),
                        "confidence": analysis.confidence,
                        "depth": depth,
                    }))
                }
            })
            .await?;

        Ok(json!({ "url": url, "image_analysis": results.first().cloned() }))
    }
}

/// Scores extracted content quality
pub struct ValidationExecutor {
    llm: Arc<dyn LanguageModelService>,
    optimizer: Arc<RequestOptimizer>,
}

impl ValidationExecutor {
    #[must_use]
    pub fn new(llm: Arc<dyn LanguageModelService>, optimizer: Arc<RequestOptimizer>) -> Self {
        Self { llm, optimizer }
    }
}

#[async_trait]
impl StepExecutor for ValidationExecutor {
    fn role(&self) -> WorkerRole {
        WorkerRole::Validator
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["quality_validation".to_string()]
    }

    async fn execute(&self, assignment: &StepAssignment) -> Result<Value, WorkerError> {
        let level = assignment.input["validation_level"]
            .as_str()
            .unwrap_or("standard");

        let request = llm_request(
            "You validate extracted regulatory content for completeness and \
             structural integrity. Reply with a JSON verdict.",
            format!("Validation level: {level}. Assess the workflow's extracted content."),
            None,
        );
        let response = complete(&self.optimizer, &self.llm, &request).await?;
        Ok(json!({
            "validation_level": level,
            "verdict": response.text,
            "passed": !response.text.is_empty(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheStore};
    use crate::optimizer::OptimizerConfig;
    use crate::services::{FetchedPage, PdfExtraction, ServiceError};
    use crate::engine::TaskPriority;
    use std::collections::HashMap;

    struct ScriptedLlm;

    #[async_trait]
    impl LanguageModelService for ScriptedLlm {
        async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ServiceError> {
            Ok(LlmResponse {
                text: format!("analyzed with {}", request.model),
                tool_calls: vec![],
            })
        }
    }

    struct StaticFetcher;

    #[async_trait]
    impl ContentFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, ServiceError> {
            Ok(FetchedPage {
                bytes: Bytes::from_static(b"<html>Act No. 7 of 2025</html>"),
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
        async fn extract(
            &self,
            _bytes: Bytes,
            _ocr_enabled: bool,
        ) -> Result<PdfExtraction, ServiceError> {
            Ok(PdfExtraction {
                text: "Section 1. Definitions".to_string(),
                token_confidences: vec![0.9, 0.95],
            })
        }
    }

    fn optimizer(dir: &std::path::Path) -> Arc<RequestOptimizer> {
        let cache = Arc::new(CacheStore::new(CacheConfig {
            file_dir: dir.to_path_buf(),
            ..CacheConfig::default()
        }));
        Arc::new(RequestOptimizer::new(OptimizerConfig::default(), cache))
    }

    fn assignment(input: Value) -> StepAssignment {
        StepAssignment {
            step_id: "wf_x".to_string(),
            workflow_id: "wf".to_string(),
            worker_id: "w1".to_string(),
            description: String::new(),
            input,
            priority: TaskPriority::Normal,
            timeout_secs: 60,
            session: json!({}),
        }
    }

    #[tokio::test]
    async fn analysis_executor_returns_an_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let executor = AnalysisExecutor::new(
            Arc::new(ScriptedLlm),
            Arc::new(StaticFetcher),
            optimizer(dir.path()),
        );
        let result = executor
            .execute(&assignment(json!({
                "url": "https://example.gov/acts",
                "analysis_depth": "deep",
            })))
            .await
            .unwrap();
        assert_eq!(result["analysis_depth"], json!("deep"));
        assert!(result["analysis"].as_str().unwrap().contains("gpt-4o"));
    }

    #[tokio::test]
    async fn orchestration_plans_stages_from_config() {
        let executor = OrchestrationExecutor;
        let result = executor
            .execute(&assignment(json!({
                "url": "https://example.gov",
                "config": { "include_pdfs": true, "include_images": false },
            })))
            .await
            .unwrap();
        let stages = result["plan"]["stages"].as_array().unwrap();
        assert!(stages.contains(&json!("pdf_analysis")));
        assert!(!stages.contains(&json!("vision_processing")));
    }

    #[tokio::test]
    async fn pdf_executor_reports_mean_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let executor = PdfAnalysisExecutor::new(
            Arc::new(StaticFetcher),
            Arc::new(StaticPdf),
            optimizer(dir.path()),
        );
        let result = executor
            .execute(&assignment(json!({
                "url": "https://example.gov/act7.pdf",
                "ocr_enabled": true,
            })))
            .await
            .unwrap();
        let confidence = result["pdf_content"]["mean_confidence"].as_f64().unwrap();
        assert!((confidence - 0.925).abs() < 1e-3);
    }

    #[tokio::test]
    async fn missing_url_is_a_malformed_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let executor = HtmlExtractionExecutor::new(
            Arc::new(StaticFetcher),
            Arc::new(ScriptedLlm),
            optimizer(dir.path()),
        );
        let err = executor.execute(&assignment(json!({}))).await.unwrap_err();
        assert!(matches!(err, WorkerError::MalformedAssignment { .. }));
    }
}
