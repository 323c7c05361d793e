//! Contracts for external collaborators
//!
//! The kernel never talks to the outside world directly: language models,
//! HTTP fetching, PDF/OCR, and image analysis are reached through these
//! traits, injected at composition time. Implementations live outside this
//! crate.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::optimizer::OptimizerError;

/// Errors reported by external services
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("request rejected: {reason}")]
    Rejected { reason: String },

    #[error("service timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("malformed service response: {reason}")]
    MalformedResponse { reason: String },
}

impl From<ServiceError> for OptimizerError {
    fn from(err: ServiceError) -> Self {
        OptimizerError::call_failed(err)
    }
}

/// One turn of a model conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// A language-model request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Tool schema offered to the model, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// A language-model response: final text plus any tool-call records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// The remote language-model service
#[async_trait]
pub trait LanguageModelService: Send + Sync {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, ServiceError>;
}

/// A fetched page: bytes plus the final URL after redirects and response
/// headers
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub bytes: Bytes,
    pub final_url: String,
    pub headers: HashMap<String, String>,
}

/// HTTP fetcher and browser automation
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetches a URL without executing scripts
    async fn fetch(&self, url: &str) -> Result<FetchedPage, ServiceError>;

    /// Fetches a URL, executes JavaScript, and returns the post-render DOM
    async fn render(&self, url: &str) -> Result<FetchedPage, ServiceError>;
}

/// Text extracted from a PDF with per-token confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfExtraction {
    pub text: String,
    pub token_confidences: Vec<f32>,
}

/// PDF and OCR processing
#[async_trait]
pub trait PdfProcessor: Send + Sync {
    async fn extract(&self, bytes: Bytes, ocr_enabled: bool) -> Result<PdfExtraction, ServiceError>;
}

/// A region of recognized text within an image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRegion {
    pub text: String,
    /// Pixel bounding box as (x, y, width, height)
    pub bounds: (u32, u32, u32, u32),
    pub confidence: f32,
}

/// Result of analyzing one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub description: String,
    pub text_regions: Vec<TextRegion>,
    pub confidence: f32,
}

/// Image analysis service
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    async fn analyze(&self, bytes: Bytes) -> Result<ImageAnalysis, ServiceError>;
}
