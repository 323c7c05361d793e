//! Kernel configuration with environment presets and a validating builder

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheConfig;
use crate::domain_types::{CacheByteBudget, MaxConcurrentWorkflows, PermitCount};
use crate::engine::EngineConfig;
use crate::optimizer::OptimizerConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} - {reason}")]
    Validation { field: String, reason: String },
}

/// HTTP facade configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Complete kernel configuration
#[derive(Debug, Clone, Default)]
pub struct KernelConfig {
    pub cache: CacheConfig,
    pub optimizer: OptimizerConfig,
    pub engine: EngineConfig,
    pub server: ServerConfig,
    pub log_json: bool,
}

impl KernelConfig {
    /// Development: small budgets, fast ticks, readable logs
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();
        config.cache.local_budget = CacheByteBudget::try_new(16 * 1024 * 1024)
            .unwrap_or_default();
        config.cache.file_dir = PathBuf::from("cache-dev");
        config.engine.dispatch_interval = Duration::from_secs(1);
        config.engine.health_check_interval = Duration::from_secs(10);
        config
    }

    /// Production: documented defaults throughout
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();
        config.log_json = true;
        config
    }

    /// Testing: millisecond ticks so tests can drive the scheduler quickly
    #[must_use]
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.engine = EngineConfig::testing();
        config.cache.sweep_interval = Duration::from_millis(100);
        config
    }

    #[must_use]
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::default()
    }

    /// Checks cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.file_threshold_bytes == 0 {
            return Err(ConfigError::Validation {
                field: "cache.file_threshold_bytes".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.engine.heartbeat_timeout >= self.engine.step_timeout {
            return Err(ConfigError::Validation {
                field: "engine.heartbeat_timeout".to_string(),
                reason: "must be shorter than the step timeout".to_string(),
            });
        }
        if self.server.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Validation {
                field: "server.listen".to_string(),
                reason: format!("not a socket address: {}", self.server.listen),
            });
        }
        Ok(())
    }
}

/// Builder over [`KernelConfig`]
#[derive(Debug, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    #[must_use]
    pub fn cache_dir(mut self, dir: PathBuf) -> Self {
        self.config.cache.file_dir = dir;
        self
    }

    #[must_use]
    pub fn cache_budget(mut self, budget: CacheByteBudget) -> Self {
        self.config.cache.local_budget = budget;
        self
    }

    #[must_use]
    pub fn max_concurrent_workflows(mut self, max: MaxConcurrentWorkflows) -> Self {
        self.config.engine.max_concurrent_workflows = max;
        self
    }

    #[must_use]
    pub fn max_concurrent_requests(mut self, permits: PermitCount) -> Self {
        self.config.optimizer.max_concurrent_requests = permits;
        self
    }

    #[must_use]
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.config.server.listen = addr.into();
        self
    }

    #[must_use]
    pub fn log_json(mut self, enabled: bool) -> Self {
        self.config.log_json = enabled;
        self
    }

    pub fn build(self) -> Result<KernelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
