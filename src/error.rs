//! Crate-level error type
//!
//! Components carry their own error enums; this wrapper exists for the
//! binary and HTTP boundaries where the concrete component no longer
//! matters.

use thiserror::Error;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::messaging::{BusError, RoutingError};
use crate::optimizer::OptimizerError;
use crate::services::ServiceError;
use crate::workers::WorkerError;

/// Any error the kernel can surface to its caller
#[derive(Debug, Error)]
pub enum KernelError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}
