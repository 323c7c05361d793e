//! Three-level cache: bytes-bounded local LRU, shared KV, and a file layer
//! for large payloads
//!
//! Reads consult the layers in that order; the serialized size of a payload
//! selects the write layer. Keys are namespaced by entry kind, entries carry
//! TTLs and dependency tags, and payloads over 1 KiB are gzip-compressed
//! when that saves at least 10%.

pub mod entry;
pub mod keys;
pub mod store;

use thiserror::Error;

pub use entry::{CacheEntry, CacheKind};
pub use keys::{content_cache_key, llm_cache_key};
pub use store::{CacheConfig, CacheStatsSnapshot, CacheStore};

/// Errors internal to the cache. Callers of `get` never see these; cache
/// errors degrade to a miss.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("invalid cache pattern: {pattern}")]
    InvalidPattern { pattern: String },
}
