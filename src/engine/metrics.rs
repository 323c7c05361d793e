//! Engine metrics: workflow counters, rolling completion time, and
//! per-role worker utilization
//!
//! Counters are updated with relaxed consistency; an exact snapshot
//! mid-update is not guaranteed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use super::workflow::{ExecutionStatus, WorkerRole};

/// Busy-time over total-time for one role
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RoleUtilization {
    pub total_secs: f64,
    pub busy_secs: f64,
    pub utilization: f64,
}

/// Live engine counters
#[derive(Default)]
pub struct EngineMetrics {
    completed_workflows: AtomicU64,
    failed_workflows: AtomicU64,
    cancelled_workflows: AtomicU64,
    average_completion_secs: Mutex<f64>,
    utilization: Mutex<HashMap<WorkerRole, RoleUtilization>>,
}

/// Workflow counts in a metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowCounts {
    pub total: usize,
    pub running: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub queued: usize,
}

/// Worker counts in a metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct WorkerCounts {
    pub total_registered: usize,
    pub online: usize,
    pub busy: usize,
}

/// Point-in-time system metrics
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetricsSnapshot {
    pub workflows: WorkflowCounts,
    pub workers: WorkerCounts,
    pub average_completion_secs: f64,
    /// Running workflows over the concurrency limit
    pub system_load: f64,
    pub utilization: HashMap<String, RoleUtilization>,
}

impl EngineMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished workflow. Only completed workflows contribute to
    /// the rolling average duration.
    pub fn record_completion(&self, status: ExecutionStatus, duration_secs: Option<f64>) {
        match status {
            ExecutionStatus::Completed => {
                let completed = self.completed_workflows.fetch_add(1, Ordering::Relaxed) + 1;
                if let (Some(duration), Ok(mut avg)) =
                    (duration_secs, self.average_completion_secs.lock())
                {
                    *avg += (duration - *avg) / completed as f64;
                }
            }
            ExecutionStatus::Failed => {
                self.failed_workflows.fetch_add(1, Ordering::Relaxed);
            }
            ExecutionStatus::Cancelled => {
                self.cancelled_workflows.fetch_add(1, Ordering::Relaxed);
            }
            ExecutionStatus::Pending | ExecutionStatus::Running => {}
        }
    }

    /// Adds one utilization sampling interval for a role
    pub fn record_utilization_interval(&self, role: WorkerRole, busy: bool, interval_secs: f64) {
        let Ok(mut map) = self.utilization.lock() else {
            return;
        };
        let entry = map.entry(role).or_default();
        entry.total_secs += interval_secs;
        if busy {
            entry.busy_secs += interval_secs;
        }
        entry.utilization = if entry.total_secs > 0.0 {
            entry.busy_secs / entry.total_secs
        } else {
            0.0
        };
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed_workflows.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed_workflows.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cancelled(&self) -> u64 {
        self.cancelled_workflows.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn average_completion_secs(&self) -> f64 {
        self.average_completion_secs.lock().map(|g| *g).unwrap_or(0.0)
    }

    #[must_use]
    pub fn utilization_by_role(&self) -> HashMap<String, RoleUtilization> {
        self.utilization
            .lock()
            .map(|map| {
                map.iter()
                    .map(|(role, u)| (role.to_string(), *u))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_completed_workflows_move_the_average() {
        let metrics = EngineMetrics::new();
        metrics.record_completion(ExecutionStatus::Completed, Some(10.0));
        metrics.record_completion(ExecutionStatus::Completed, Some(20.0));
        metrics.record_completion(ExecutionStatus::Failed, Some(1000.0));
        assert!((metrics.average_completion_secs() - 15.0).abs() < 1e-9);
        assert_eq!(metrics.completed(), 2);
        assert_eq!(metrics.failed(), 1);
    }

    #[test]
    fn utilization_accumulates_busy_intervals() {
        let metrics = EngineMetrics::new();
        metrics.record_utilization_interval(WorkerRole::HtmlExtractor, true, 30.0);
        metrics.record_utilization_interval(WorkerRole::HtmlExtractor, false, 30.0);
        let map = metrics.utilization_by_role();
        let u = map.get("html_extractor").unwrap();
        assert!((u.utilization - 0.5).abs() < 1e-9);
        assert!((u.total_secs - 60.0).abs() < 1e-9);
    }
}
