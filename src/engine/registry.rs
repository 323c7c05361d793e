//! Worker registry: per-role pools, availability, and heartbeat tracking
//!
//! The registry is owned by the engine and mutated only under the engine
//! state lock, so a step transition and the matching worker transition are
//! always observed together.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;

use super::workflow::WorkerRole;
use crate::domain_types::{StepId, WorkerId};

/// Availability of one worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerAvailability {
    Idle,
    Busy,
    Error,
    Offline,
}

/// State the engine tracks for each registered worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerState {
    pub worker_id: WorkerId,
    pub role: WorkerRole,
    pub availability: WorkerAvailability,
    pub current_step: Option<StepId>,
    pub last_heartbeat: DateTime<Utc>,
    pub jobs_processed: u64,
    pub error_count: u64,
    pub queue_length: usize,
    pub capabilities: Vec<String>,
    /// Monotonic registration sequence, used as the dispatch tie-breaker
    pub registered_seq: u64,
}

/// Registry of worker instances keyed by id
#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerState>,
    next_seq: u64,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker. Re-registering an existing id replaces its
    /// record.
    pub fn register(&mut self, worker_id: WorkerId, role: WorkerRole, capabilities: Vec<String>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.workers.insert(
            worker_id.clone(),
            WorkerState {
                worker_id,
                role,
                availability: WorkerAvailability::Idle,
                current_step: None,
                last_heartbeat: Utc::now(),
                jobs_processed: 0,
                error_count: 0,
                queue_length: 0,
                capabilities,
                registered_seq: seq,
            },
        );
    }

    /// Removes a worker's record
    pub fn deregister(&mut self, worker_id: &WorkerId) -> Option<WorkerState> {
        self.workers.remove(worker_id)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&WorkerState> {
        self.workers.get(worker_id)
    }

    pub fn get_mut(&mut self, worker_id: &WorkerId) -> Option<&mut WorkerState> {
        self.workers.get_mut(worker_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerState> {
        self.workers.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Picks the idle worker of `role` with the lowest
    /// `(queue_length, error_count)`, tie-broken by registration order
    #[must_use]
    pub fn select_idle(&self, role: WorkerRole) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.role == role && w.availability == WorkerAvailability::Idle)
            .min_by_key(|w| (w.queue_length, w.error_count, w.registered_seq))
            .map(|w| w.worker_id.clone())
    }

    /// Assigns a step to a worker, marking it busy
    pub fn assign(&mut self, worker_id: &WorkerId, step_id: StepId) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.availability = WorkerAvailability::Busy;
            worker.current_step = Some(step_id);
        }
    }

    /// Releases a worker back to idle after its step finished
    pub fn release(&mut self, worker_id: &WorkerId, succeeded: bool) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.availability = WorkerAvailability::Idle;
            worker.current_step = None;
            if succeeded {
                worker.jobs_processed += 1;
            } else {
                worker.error_count += 1;
            }
        }
    }

    /// Returns a worker to idle without touching its counters, e.g. when a
    /// dispatch is reverted or a cancelled step's late result is dropped
    pub fn clear_assignment(&mut self, worker_id: &WorkerId) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            if worker.availability == WorkerAvailability::Busy {
                worker.availability = WorkerAvailability::Idle;
            }
            worker.current_step = None;
        }
    }

    /// Marks a worker offline and drops its assignment
    pub fn set_offline(&mut self, worker_id: &WorkerId) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.availability = WorkerAvailability::Offline;
            worker.current_step = None;
        }
    }

    /// The worker currently assigned to a step, if any
    #[must_use]
    pub fn assignee(&self, step_id: &StepId) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.current_step.as_ref() == Some(step_id))
            .map(|w| w.worker_id.clone())
    }

    /// Applies a heartbeat: refreshes the timestamp, absorbs reported
    /// metrics, and brings offline workers back to idle
    pub fn heartbeat(&mut self, worker_id: &WorkerId, reported_status: Option<&str>, metrics: Option<&Value>) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.last_heartbeat = Utc::now();
            if let Some(queue_length) = metrics
                .and_then(|m| m.get("queue_length"))
                .and_then(Value::as_u64)
            {
                worker.queue_length = queue_length as usize;
            }
            if worker.availability == WorkerAvailability::Offline
                && reported_status.is_some_and(|s| s != "offline")
            {
                worker.availability = WorkerAvailability::Idle;
            }
        }
    }

    /// Marks workers with stale heartbeats offline, returning each newly
    /// offline worker and the step it was assigned, if any
    pub fn mark_stale_offline(&mut self, timeout: Duration) -> Vec<(WorkerId, Option<StepId>)> {
        let now = Utc::now();
        let mut released = Vec::new();
        for worker in self.workers.values_mut() {
            if worker.availability != WorkerAvailability::Offline
                && now - worker.last_heartbeat > timeout
            {
                worker.availability = WorkerAvailability::Offline;
                let step = worker.current_step.take();
                released.push((worker.worker_id.clone(), step));
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(workers: &[(&str, WorkerRole)]) -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        for (id, role) in workers {
            registry.register(WorkerId::new((*id).to_string()), *role, vec![]);
        }
        registry
    }

    #[test]
    fn selection_prefers_lowest_load_then_registration_order() {
        let mut registry = registry_with(&[
            ("w1", WorkerRole::HtmlExtractor),
            ("w2", WorkerRole::HtmlExtractor),
            ("w3", WorkerRole::HtmlExtractor),
        ]);
        // Equal load: registration order wins.
        assert_eq!(
            registry.select_idle(WorkerRole::HtmlExtractor),
            Some(WorkerId::new("w1".to_string()))
        );

        // Higher error count pushes w1 behind w2.
        registry.get_mut(&WorkerId::new("w1".to_string())).unwrap().error_count = 2;
        assert_eq!(
            registry.select_idle(WorkerRole::HtmlExtractor),
            Some(WorkerId::new("w2".to_string()))
        );

        // Queue length dominates error count.
        registry.get_mut(&WorkerId::new("w2".to_string())).unwrap().queue_length = 5;
        registry.get_mut(&WorkerId::new("w3".to_string())).unwrap().queue_length = 5;
        assert_eq!(
            registry.select_idle(WorkerRole::HtmlExtractor),
            Some(WorkerId::new("w1".to_string()))
        );
    }

    #[test]
    fn busy_workers_are_not_selected() {
        let mut registry = registry_with(&[("w1", WorkerRole::Validator)]);
        registry.assign(
            &WorkerId::new("w1".to_string()),
            StepId::new("step".to_string()),
        );
        assert_eq!(registry.select_idle(WorkerRole::Validator), None);
        registry.release(&WorkerId::new("w1".to_string()), true);
        assert!(registry.select_idle(WorkerRole::Validator).is_some());
    }

    #[test]
    fn reregistration_replaces_the_record() {
        let mut registry = registry_with(&[("w1", WorkerRole::Analysis)]);
        let id = WorkerId::new("w1".to_string());
        registry.get_mut(&id).unwrap().error_count = 7;
        registry.register(id.clone(), WorkerRole::Analysis, vec!["deep".to_string()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().error_count, 0);
        assert_eq!(registry.get(&id).unwrap().capabilities, vec!["deep".to_string()]);
    }

    #[test]
    fn stale_workers_go_offline_and_release_their_step() {
        let mut registry = registry_with(&[("w1", WorkerRole::PdfAnalyzer)]);
        let id = WorkerId::new("w1".to_string());
        registry.assign(&id, StepId::new("step".to_string()));
        registry.get_mut(&id).unwrap().last_heartbeat = Utc::now() - Duration::minutes(10);

        let released = registry.mark_stale_offline(Duration::minutes(5));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].1, Some(StepId::new("step".to_string())));
        assert_eq!(
            registry.get(&id).unwrap().availability,
            WorkerAvailability::Offline
        );
    }

    #[test]
    fn heartbeat_brings_offline_workers_back() {
        let mut registry = registry_with(&[("w1", WorkerRole::VisionProcessor)]);
        let id = WorkerId::new("w1".to_string());
        registry.get_mut(&id).unwrap().last_heartbeat = Utc::now() - Duration::minutes(10);
        registry.mark_stale_offline(Duration::minutes(5));

        registry.heartbeat(&id, Some("idle"), None);
        assert_eq!(
            registry.get(&id).unwrap().availability,
            WorkerAvailability::Idle
        );
    }
}
