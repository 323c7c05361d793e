//! Coalescing of in-flight duplicate requests
//!
//! Requests with identical signatures share one real execution: the first
//! caller runs the operation, later callers suspend as waiters, and every
//! caller observes the same outcome.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::debug;

use super::OptimizerError;

type SharedOutcome = Result<Value, OptimizerError>;

/// Result of a coalesced execution
#[derive(Debug)]
pub struct CoalescedResult {
    pub outcome: SharedOutcome,
    /// Whether this caller joined an execution led by another caller
    pub joined: bool,
    /// How many waiters this caller's execution resolved (leaders only)
    pub waiters_served: usize,
}

/// Deterministic signature over a request's salient inputs
#[must_use]
pub fn request_signature(salient: &Value) -> String {
    let digest = Sha256::digest(salient.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Tracks in-flight request signatures and their waiters
#[derive(Default)]
pub struct RequestCoalescer {
    in_flight: Mutex<HashMap<String, Vec<oneshot::Sender<SharedOutcome>>>>,
}

impl RequestCoalescer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of signatures currently in flight
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Executes `op` under the given signature, coalescing with any
    /// execution of the same signature already in flight.
    ///
    /// Exactly one real execution runs per live signature; the leader
    /// resolves every waiter with a clone of its outcome.
    pub async fn execute<F, Fut>(&self, signature: &str, op: F) -> CoalescedResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, OptimizerError>>,
    {
        let waiter = {
            let Ok(mut map) = self.in_flight.lock() else {
                return CoalescedResult {
                    outcome: Err(OptimizerError::Internal {
                        reason: "coalescer lock poisoned".to_string(),
                    }),
                    joined: false,
                    waiters_served: 0,
                };
            };
            if let Some(waiters) = map.get_mut(signature) {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            } else {
                map.insert(signature.to_string(), Vec::new());
                None
            }
        };

        if let Some(rx) = waiter {
            debug!(signature, "joining in-flight request");
            let outcome = rx
                .await
                .unwrap_or(Err(OptimizerError::CoalescingAborted));
            return CoalescedResult {
                outcome,
                joined: true,
                waiters_served: 0,
            };
        }

        let outcome = op().await;

        let waiters = self
            .in_flight
            .lock()
            .map(|mut map| map.remove(signature).unwrap_or_default())
            .unwrap_or_default();
        let waiters_served = waiters.len();
        for tx in waiters {
            let _ = tx.send(outcome.clone());
        }

        CoalescedResult {
            outcome,
            joined: false,
            waiters_served,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    fn signatures_are_deterministic() {
        let a = request_signature(&json!({"model": "gpt-4", "temperature": 0.1}));
        let b = request_signature(&json!({"model": "gpt-4", "temperature": 0.1}));
        let c = request_signature(&json!({"model": "gpt-4", "temperature": 0.2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_execute_once() {
        let coalescer = Arc::new(RequestCoalescer::new());
        let executions = Arc::new(AtomicU64::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coalescer = Arc::clone(&coalescer);
            let executions = Arc::clone(&executions);
            let mut release = release_rx.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .execute("sig", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        // Hold the execution open until every caller has had
                        // the chance to join.
                        let _ = release.wait_for(|released| *released).await;
                        Ok(json!({"answer": 42}))
                    })
                    .await
            }));
        }

        // Let all five tasks reach the coalescer before releasing.
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        release_tx.send(true).unwrap();

        let mut joined = 0;
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.outcome.unwrap(), json!({"answer": 42}));
            if result.joined {
                joined += 1;
            }
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 4);
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn waiters_observe_the_leader_error() {
        let coalescer = Arc::new(RequestCoalescer::new());
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            let mut release = release_rx.clone();
            tokio::spawn(async move {
                coalescer
                    .execute("sig", move || async move {
                        let _ = release.wait_for(|released| *released).await;
                        Err(OptimizerError::CallFailed {
                            reason: "upstream 503".to_string(),
                        })
                    })
                    .await
            })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;

        let waiter = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .execute("sig", || async { Ok(json!("should not run")) })
                    .await
            })
        };
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        release_tx.send(true).unwrap();

        let leader_result = leader.await.unwrap();
        let waiter_result = waiter.await.unwrap();
        assert!(!leader_result.joined);
        assert!(waiter_result.joined);
        assert_eq!(leader_result.outcome, waiter_result.outcome);
    }

    #[tokio::test]
    async fn sequential_requests_each_execute() {
        let coalescer = RequestCoalescer::new();
        let first = coalescer.execute("sig", || async { Ok(json!(1)) }).await;
        let second = coalescer.execute("sig", || async { Ok(json!(2)) }).await;
        assert_eq!(first.outcome.unwrap(), json!(1));
        assert_eq!(second.outcome.unwrap(), json!(2));
        assert!(!second.joined);
    }
}
