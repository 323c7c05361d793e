//! # Regula - Regulatory Document Extraction Kernel
//!
//! Regula orchestrates the extraction of structured regulatory documents
//! (acts, bills, directives) from government and legal websites. Specialist
//! workers analyze sites, extract HTML, process PDFs and images, and
//! validate quality under a central engine that plans, dispatches,
//! monitors, retries, and merges results.
//!
//! The kernel is composed of five parts, leaves first:
//!
//! - [`messaging`]: typed messages with correlation ids over per-recipient
//!   FIFO queues and per-kind broadcast channels, plus the queue router
//!   with capacity caps and dead-letter fallback
//! - [`cache`]: a three-level cache (local LRU, shared KV, file) with TTL,
//!   tagged invalidation, and compression
//! - [`optimizer`]: cache lookaside, in-flight coalescing, bounded
//!   parallelism, and smart retry around expensive external calls
//! - [`engine`]: the DAG scheduler over heterogeneous worker pools
//! - [`workers`]: the worker contract and the built-in executor set
//!
//! External collaborators (language models, HTTP fetching, PDF/OCR, image
//! analysis) are reached only through the [`services`] traits.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use regula::config::KernelConfig;
//! use regula::engine::{ExtractionConfig, WorkflowEngine};
//! use regula::messaging::{MessageBus, QueueRouter};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = KernelConfig::development();
//! let bus = Arc::new(MessageBus::new());
//! let router = Arc::new(QueueRouter::new(Arc::clone(&bus)));
//! let engine = Arc::new(WorkflowEngine::new(config.engine, bus, router));
//! engine.start().await;
//!
//! let workflow_id = engine
//!     .submit_extraction("https://legislation.example.gov", &ExtractionConfig::default())
//!     .await;
//! println!("submitted {workflow_id}");
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod domain_types;
pub mod engine;
pub mod error;
pub mod messaging;
pub mod observability;
pub mod optimizer;
pub mod server;
pub mod services;
pub mod workers;

pub use crate::config::KernelConfig;
pub use crate::error::KernelError;
