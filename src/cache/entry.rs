//! Cache entries and their on-disk encoding

use std::io::{Read, Write};

use chrono::{DateTime, Duration, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CacheError;

/// Marker prefix distinguishing compressed entry bytes
const COMPRESSED_MARKER: &[u8] = b"COMPRESSED:";

/// Payloads below this size are never compressed
const COMPRESSION_FLOOR_BYTES: usize = 1024;

/// The kinds of cached content, each with its own key namespace and TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    LlmResponse,
    ExtractedContent,
    WebsiteAnalysis,
    PdfContent,
    ImageAnalysis,
    ValidationResult,
    WorkflowState,
}

impl CacheKind {
    /// Namespace prefix used in cache keys
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlmResponse => "llm_response",
            Self::ExtractedContent => "extracted_content",
            Self::WebsiteAnalysis => "website_analysis",
            Self::PdfContent => "pdf_content",
            Self::ImageAnalysis => "image_analysis",
            Self::ValidationResult => "validation_result",
            Self::WorkflowState => "workflow_state",
        }
    }

    /// Default time-to-live for entries of this kind
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::LlmResponse => Duration::hours(6),
            Self::ExtractedContent => Duration::days(3),
            Self::WebsiteAnalysis => Duration::days(1),
            Self::PdfContent => Duration::days(30),
            Self::ImageAnalysis => Duration::days(7),
            Self::ValidationResult => Duration::hours(12),
            Self::WorkflowState => Duration::hours(1),
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cached value with its bookkeeping metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub kind: CacheKind,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub size_bytes: usize,
    pub dependencies: Vec<String>,
    pub compressed: bool,
}

impl CacheEntry {
    /// Builds an entry expiring `ttl` from now; `None` falls back to the
    /// kind's default TTL
    #[must_use]
    pub fn new(
        key: String,
        kind: CacheKind,
        value: Value,
        ttl: Option<Duration>,
        dependencies: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        let ttl = ttl.unwrap_or_else(|| kind.default_ttl());
        Self {
            key,
            kind,
            value,
            created_at: now,
            expires_at: Some(now + ttl),
            access_count: 0,
            last_accessed: None,
            size_bytes: 0,
            dependencies,
            compressed: false,
        }
    }

    /// Whether the entry's TTL has elapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| now > expires)
    }

    /// Records an access for LRU and statistics purposes
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Some(Utc::now());
    }

    /// Serializes the entry, compressing when enabled, the payload is over
    /// 1 KiB, and compression saves at least 10%
    pub fn encode(&mut self, compression_enabled: bool) -> Result<Vec<u8>, CacheError> {
        self.compressed = false;
        let plain = serde_json::to_vec(self)?;

        if compression_enabled && plain.len() > COMPRESSION_FLOOR_BYTES {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&plain)?;
            let packed = encoder.finish()?;
            if packed.len() * 10 < plain.len() * 9 {
                self.compressed = true;
                let mut out = Vec::with_capacity(COMPRESSED_MARKER.len() + packed.len());
                out.extend_from_slice(COMPRESSED_MARKER);
                out.extend_from_slice(&packed);
                return Ok(out);
            }
        }
        Ok(plain)
    }

    /// Deserializes an entry, transparently inflating the compressed form
    pub fn decode(data: &[u8]) -> Result<Self, CacheError> {
        if let Some(packed) = data.strip_prefix(COMPRESSED_MARKER) {
            let mut decoder = GzDecoder::new(packed);
            let mut plain = Vec::new();
            decoder.read_to_end(&mut plain)?;
            let mut entry: Self = serde_json::from_slice(&plain)?;
            entry.compressed = true;
            return Ok(entry);
        }
        Ok(serde_json::from_slice(data)?)
    }
}
