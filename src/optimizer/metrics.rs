//! Optimizer metrics: counters plus a rolling window of response times

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Number of recent response-time samples kept for percentile estimates
const RECENT_SAMPLES: usize = 100;

#[derive(Default)]
struct Timings {
    recent: VecDeque<f64>,
    count: u64,
    mean: f64,
    min: f64,
    max: f64,
}

/// Live counters for the optimizer
#[derive(Default)]
pub struct OptimizerMetrics {
    pub total_requests: AtomicU64,
    pub cached_responses: AtomicU64,
    pub coalesced_requests: AtomicU64,
    pub batched_requests: AtomicU64,
    pub parallel_executions: AtomicU64,
    pub failed_requests: AtomicU64,
    pub retry_attempts: AtomicU64,
    concurrent: AtomicUsize,
    peak_concurrent: AtomicUsize,
    timings: Mutex<Timings>,
}

/// Point-in-time snapshot of optimizer metrics
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerMetricsSnapshot {
    pub total_requests: u64,
    pub cached_responses: u64,
    pub coalesced_requests: u64,
    pub batched_requests: u64,
    pub parallel_executions: u64,
    pub failed_requests: u64,
    pub retry_attempts: u64,
    pub cache_hit_rate: f64,
    pub coalesce_rate: f64,
    pub error_rate: f64,
    pub concurrent_requests: usize,
    pub peak_concurrent_requests: usize,
    pub mean_response_secs: f64,
    pub min_response_secs: f64,
    pub max_response_secs: f64,
    pub p95_response_secs: f64,
}

impl OptimizerMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a request entering execution, tracking peak concurrency
    pub fn enter(&self) {
        let now = self.concurrent.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::AcqRel);
    }

    /// Marks a request leaving execution
    pub fn exit(&self) {
        self.concurrent.fetch_sub(1, Ordering::AcqRel);
    }

    /// Records one response time sample in seconds
    pub fn record_response_time(&self, secs: f64) {
        let Ok(mut t) = self.timings.lock() else {
            return;
        };
        if t.recent.len() == RECENT_SAMPLES {
            t.recent.pop_front();
        }
        t.recent.push_back(secs);

        t.count += 1;
        if t.count == 1 {
            t.mean = secs;
            t.min = secs;
            t.max = secs;
        } else {
            t.mean += (secs - t.mean) / t.count as f64;
            t.min = t.min.min(secs);
            t.max = t.max.max(secs);
        }
    }

    /// Builds a consistent-enough snapshot; counters are read with relaxed
    /// ordering
    #[must_use]
    pub fn snapshot(&self) -> OptimizerMetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let cached = self.cached_responses.load(Ordering::Relaxed);
        let coalesced = self.coalesced_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let denominator = (total + cached + coalesced).max(1) as f64;

        let (mean, min, max, p95) = match self.timings.lock() {
            Ok(t) => {
                let p95 = percentile_95(&t.recent);
                (t.mean, if t.count > 0 { t.min } else { 0.0 }, t.max, p95)
            }
            Err(_) => (0.0, 0.0, 0.0, 0.0),
        };

        OptimizerMetricsSnapshot {
            total_requests: total,
            cached_responses: cached,
            coalesced_requests: coalesced,
            batched_requests: self.batched_requests.load(Ordering::Relaxed),
            parallel_executions: self.parallel_executions.load(Ordering::Relaxed),
            failed_requests: failed,
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
            cache_hit_rate: cached as f64 / denominator,
            coalesce_rate: coalesced as f64 / denominator,
            error_rate: failed as f64 / total.max(1) as f64,
            concurrent_requests: self.concurrent.load(Ordering::Relaxed),
            peak_concurrent_requests: self.peak_concurrent.load(Ordering::Relaxed),
            mean_response_secs: mean,
            min_response_secs: min,
            max_response_secs: max,
            p95_response_secs: p95,
        }
    }
}

fn percentile_95(recent: &VecDeque<f64>) -> f64 {
    if recent.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = recent.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
