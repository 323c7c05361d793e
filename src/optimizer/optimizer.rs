//! The request optimizer proper
//!
//! Strategies compose in a fixed order: cache lookaside short-circuits
//! first, coalescing folds concurrent duplicates into one execution,
//! a semaphore bounds concurrent outbound calls, and smart retry re-runs
//! failed calls with exponential backoff. Each strategy can be disabled
//! independently; disabled strategies degrade to plain execution.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::coalescer::{request_signature, RequestCoalescer};
use super::metrics::{OptimizerMetrics, OptimizerMetricsSnapshot};
use super::OptimizerError;
use crate::cache::{content_cache_key, llm_cache_key, CacheKind, CacheStore};
use crate::domain_types::{MaxRetries, PermitCount, RetryBaseDelayMs};

/// The individually toggleable optimization strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    CacheLookaside,
    Coalescing,
    BoundedParallelism,
    SmartRetry,
    Batching,
}

/// Optimizer configuration
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub max_concurrent_requests: PermitCount,
    pub max_parallel_extractions: PermitCount,
    pub retry_max_attempts: MaxRetries,
    pub retry_base_delay: RetryBaseDelayMs,
    /// Batch sizes by batch kind for `batch_process`
    pub batch_size_limits: HashMap<String, usize>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: PermitCount::try_new((num_cpus::get() * 2).clamp(4, 64))
                .unwrap_or_default(),
            max_parallel_extractions: PermitCount::try_new(5).unwrap_or_default(),
            retry_max_attempts: MaxRetries::default(),
            retry_base_delay: RetryBaseDelayMs::default(),
            batch_size_limits: HashMap::from([
                ("llm_requests".to_string(), 5),
                ("content_extraction".to_string(), 3),
                ("validation".to_string(), 10),
            ]),
        }
    }
}

/// The salient inputs of a language-model call, used for cache keys and
/// coalescing signatures
#[derive(Debug, Clone, Serialize)]
pub struct LlmCallSpec {
    pub model: String,
    pub messages: Vec<Value>,
    pub tools: Option<Value>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl LlmCallSpec {
    fn cache_key(&self) -> String {
        llm_cache_key(
            &self.model,
            &self.messages,
            self.tools.as_ref(),
            self.temperature,
        )
    }

    fn signature(&self) -> String {
        request_signature(&json!({
            "model": self.model,
            "messages": self.messages,
            "temperature": format!("{:.3}", self.temperature),
            "max_tokens": self.max_tokens,
        }))
    }
}

/// Wraps expensive external calls with caching, coalescing, bounded
/// concurrency, and retry
pub struct RequestOptimizer {
    config: OptimizerConfig,
    cache: Arc<CacheStore>,
    coalescer: RequestCoalescer,
    request_permits: Arc<Semaphore>,
    extraction_permits: Arc<Semaphore>,
    strategies: RwLock<HashSet<Strategy>>,
    metrics: OptimizerMetrics,
}

impl RequestOptimizer {
    #[must_use]
    pub fn new(config: OptimizerConfig, cache: Arc<CacheStore>) -> Self {
        let request_permits = Arc::new(Semaphore::new(config.max_concurrent_requests.as_usize()));
        let extraction_permits =
            Arc::new(Semaphore::new(config.max_parallel_extractions.as_usize()));
        Self {
            config,
            cache,
            coalescer: RequestCoalescer::new(),
            request_permits,
            extraction_permits,
            strategies: RwLock::new(HashSet::from([
                Strategy::CacheLookaside,
                Strategy::Coalescing,
                Strategy::BoundedParallelism,
                Strategy::SmartRetry,
                Strategy::Batching,
            ])),
            metrics: OptimizerMetrics::new(),
        }
    }

    /// Enables a strategy
    pub fn enable_strategy(&self, strategy: Strategy) {
        if let Ok(mut set) = self.strategies.write() {
            set.insert(strategy);
        }
    }

    /// Disables a strategy; calls degrade to plain execution of the
    /// remaining strategies
    pub fn disable_strategy(&self, strategy: Strategy) {
        if let Ok(mut set) = self.strategies.write() {
            set.remove(&strategy);
        }
    }

    fn enabled(&self, strategy: Strategy) -> bool {
        self.strategies
            .read()
            .map(|set| set.contains(&strategy))
            .unwrap_or(false)
    }

    /// Point-in-time metrics snapshot
    #[must_use]
    pub fn metrics(&self) -> OptimizerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Optimizes a language-model call.
    ///
    /// `op` performs the real call; it may run zero times (cache hit or
    /// coalesced join), once, or several times (retries).
    pub async fn execute_llm<F, Fut>(
        &self,
        spec: &LlmCallSpec,
        op: F,
    ) -> Result<Value, OptimizerError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, OptimizerError>> + Send,
    {
        let started = Instant::now();
        let _permit = if self.enabled(Strategy::BoundedParallelism) {
            Some(self.acquire(&self.request_permits).await?)
        } else {
            None
        };
        self.metrics.enter();
        let result = self.execute_llm_inner(spec, &op).await;
        self.metrics.exit();
        self.metrics
            .record_response_time(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_llm_inner<F, Fut>(
        &self,
        spec: &LlmCallSpec,
        op: &F,
    ) -> Result<Value, OptimizerError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, OptimizerError>> + Send,
    {
        use std::sync::atomic::Ordering;

        let cache_key = spec.cache_key();
        if self.enabled(Strategy::CacheLookaside) {
            if let Some(cached) = self.cache.get(&cache_key, CacheKind::LlmResponse).await {
                self.metrics.cached_responses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %cache_key, "llm cache hit");
                return Ok(cached);
            }
        }

        let run = || async move {
            self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
            op().await
        };

        let outcome = if self.enabled(Strategy::Coalescing) {
            let coalesced = self.coalescer.execute(&spec.signature(), &run).await;
            if coalesced.joined {
                self.metrics
                    .coalesced_requests
                    .fetch_add(1, Ordering::Relaxed);
            }
            coalesced.outcome
        } else {
            run().await
        };

        let outcome = match outcome {
            Ok(value) => Ok(value),
            Err(first_error) => {
                self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
                if self.enabled(Strategy::SmartRetry) {
                    self.retry(first_error, &run).await
                } else {
                    Err(first_error)
                }
            }
        };

        if let Ok(value) = &outcome {
            if self.enabled(Strategy::CacheLookaside) {
                if let Err(e) = self
                    .cache
                    .set(&cache_key, value.clone(), CacheKind::LlmResponse, None, vec![])
                    .await
                {
                    warn!(key = %cache_key, error = %e, "llm write-through failed");
                }
            }
        }
        outcome
    }

    /// Retries a failed call up to the configured attempt count with
    /// exponential backoff, surfacing the last error.
    async fn retry<F, Fut>(
        &self,
        mut last_error: OptimizerError,
        op: &F,
    ) -> Result<Value, OptimizerError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, OptimizerError>> + Send,
    {
        use std::sync::atomic::Ordering;

        let attempts = self.config.retry_max_attempts.as_u32();
        for attempt in 0..attempts {
            self.metrics.retry_attempts.fetch_add(1, Ordering::Relaxed);
            let delay = self.config.retry_base_delay.as_duration() * 2_u32.pow(attempt);
            warn!(
                attempt = attempt + 1,
                max_attempts = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "retrying failed request"
            );
            tokio::time::sleep(delay).await;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    /// Optimizes a URL batch extraction: per-URL cache lookup, parallel
    /// execution of the miss subset under a separate permit pool, and
    /// order-preserving reassembly with write-through.
    ///
    /// The first error (in input order) propagates; partial results are
    /// never silently dropped.
    pub async fn execute_extraction<F, Fut>(
        &self,
        urls: &[String],
        method: &str,
        op: F,
    ) -> Result<Vec<Value>, OptimizerError>
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Value, OptimizerError>> + Send,
    {
        use std::sync::atomic::Ordering;

        if urls.is_empty() {
            return Ok(Vec::new());
        }

        let mut slots: Vec<Option<Result<Value, OptimizerError>>> = vec![None; urls.len()];
        let mut misses: Vec<(usize, String)> = Vec::new();

        if self.enabled(Strategy::CacheLookaside) {
            for (i, url) in urls.iter().enumerate() {
                let key = content_cache_key(url, method);
                if let Some(cached) = self.cache.get(&key, CacheKind::ExtractedContent).await {
                    self.metrics.cached_responses.fetch_add(1, Ordering::Relaxed);
                    slots[i] = Some(Ok(cached));
                } else {
                    misses.push((i, url.clone()));
                }
            }
        } else {
            misses = urls.iter().cloned().enumerate().collect();
        }

        if !misses.is_empty() {
            let results = if self.enabled(Strategy::BoundedParallelism) {
                self.metrics
                    .parallel_executions
                    .fetch_add(misses.len() as u64, Ordering::Relaxed);
                let futures = misses.iter().map(|(_, url)| {
                    let url = url.clone();
                    let op = &op;
                    async move {
                        let _permit = self.acquire(&self.extraction_permits).await?;
                        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
                        op(url).await
                    }
                });
                join_all(futures).await
            } else {
                let mut sequential = Vec::with_capacity(misses.len());
                for (_, url) in &misses {
                    self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
                    sequential.push(op(url.clone()).await);
                }
                sequential
            };

            for ((i, url), result) in misses.into_iter().zip(results) {
                if let Ok(value) = &result {
                    if self.enabled(Strategy::CacheLookaside) {
                        let key = content_cache_key(&url, method);
                        if let Err(e) = self
                            .cache
                            .set(&key, value.clone(), CacheKind::ExtractedContent, None, vec![])
                            .await
                        {
                            warn!(url = %url, error = %e, "extraction write-through failed");
                        }
                    }
                } else {
                    self.metrics.failed_requests.fetch_add(1, Ordering::Relaxed);
                }
                slots[i] = Some(result);
            }
        }

        let mut values = Vec::with_capacity(urls.len());
        for slot in slots {
            match slot {
                Some(Ok(value)) => values.push(value),
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(OptimizerError::Internal {
                        reason: "extraction slot left unfilled".to_string(),
                    })
                }
            }
        }
        Ok(values)
    }

    /// Splits `items` into batches sized for `batch_kind` and processes
    /// them, flattening the results. Batches run in parallel when bounded
    /// parallelism is enabled.
    pub async fn batch_process<T, F, Fut>(
        &self,
        batch_kind: &str,
        items: Vec<T>,
        op: F,
    ) -> Result<Vec<Value>, OptimizerError>
    where
        T: Clone + Send + Sync,
        F: Fn(Vec<T>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Vec<Value>, OptimizerError>> + Send,
    {
        use std::sync::atomic::Ordering;

        if items.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = if self.enabled(Strategy::Batching) {
            self.config
                .batch_size_limits
                .get(batch_kind)
                .copied()
                .unwrap_or(5)
        } else {
            items.len()
        };
        let batches: Vec<Vec<T>> = items.chunks(batch_size.max(1)).map(<[T]>::to_vec).collect();
        self.metrics
            .batched_requests
            .fetch_add(batches.len() as u64, Ordering::Relaxed);

        let results = if self.enabled(Strategy::BoundedParallelism) {
            join_all(batches.into_iter().map(|batch| op(batch))).await
        } else {
            let mut sequential = Vec::new();
            for batch in batches {
                sequential.push(op(batch).await);
            }
            sequential
        };

        let mut flattened = Vec::new();
        for result in results {
            flattened.extend(result?);
        }
        Ok(flattened)
    }

    async fn acquire<'a>(
        &self,
        semaphore: &'a Semaphore,
    ) -> Result<tokio::sync::SemaphorePermit<'a>, OptimizerError> {
        semaphore
            .acquire()
            .await
            .map_err(|_| OptimizerError::Internal {
                reason: "permit pool closed".to_string(),
            })
    }
}
