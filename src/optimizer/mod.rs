//! Request optimization for expensive external calls
//!
//! Wraps language-model and extraction calls with four composable
//! strategies: cache lookaside, in-flight coalescing, bounded concurrency,
//! and smart retry with exponential backoff. URL batches additionally get
//! per-URL cache lookup, a separate parallel permit pool, and
//! order-preserving reassembly.

pub mod coalescer;
pub mod metrics;
pub mod optimizer;

use thiserror::Error;

pub use coalescer::{request_signature, CoalescedResult, RequestCoalescer};
pub use metrics::{OptimizerMetrics, OptimizerMetricsSnapshot};
pub use optimizer::{LlmCallSpec, OptimizerConfig, RequestOptimizer, Strategy};

/// Errors surfaced by optimized calls. Cloneable so a single coalesced
/// outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptimizerError {
    #[error("external call failed: {reason}")]
    CallFailed { reason: String },

    #[error("coalesced execution aborted before completing")]
    CoalescingAborted,

    #[error("optimizer internal error: {reason}")]
    Internal { reason: String },
}

impl OptimizerError {
    /// Wraps an arbitrary error as a failed external call
    pub fn call_failed(err: impl std::fmt::Display) -> Self {
        Self::CallFailed {
            reason: err.to_string(),
        }
    }
}
