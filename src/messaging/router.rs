//! Queue routing: message-kind to queue mapping, capacity caps, and the
//! dead-letter fallback
//!
//! The router owns the static queue topology. A message routes to its
//! explicit recipient when that queue is known, otherwise by kind. Unknown
//! targets and full queues produce a dead-letter envelope retained for 24
//! hours and replayable in bulk.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use super::bus::MessageBus;
use super::message::{Message, MessageKind};
use crate::domain_types::{MaxRetries, QueueCapacity, QueueName};

/// Dead letters are retained for 24 hours
pub const DEAD_LETTER_TTL_SECONDS: i64 = 86_400;

/// Name of the dead-letter queue
pub const DEAD_LETTER_QUEUE: &str = "dead_letter";

/// Errors raised while manipulating the queue topology
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("unknown queue: {queue}")]
    UnknownQueue { queue: QueueName },

    #[error("envelope decode failed: {source}")]
    EnvelopeDecode {
        #[from]
        source: serde_json::Error,
    },
}

/// Scheduling weight of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Critical,
    High,
    Normal,
    Low,
}

/// Per-queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: QueueName,
    pub priority: QueuePriority,
    pub capacity: QueueCapacity,
    pub consumer_timeout_secs: u64,
    pub max_retries: MaxRetries,
    pub ttl_seconds: i64,
    pub dead_letter_enabled: bool,
}

impl QueueConfig {
    fn new(name: &str, priority: QueuePriority, capacity: usize) -> Self {
        Self {
            name: QueueName::from_static(name),
            priority,
            capacity: QueueCapacity::try_new(capacity).unwrap_or_default(),
            consumer_timeout_secs: 30,
            max_retries: MaxRetries::default(),
            ttl_seconds: 3600,
            dead_letter_enabled: true,
        }
    }
}

/// Rolling counters for one queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// A message that could not be routed, preserved for replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEnvelope {
    pub original_message: Message,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
    pub original_recipient: QueueName,
}

/// Point-in-time view of one queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub priority: QueuePriority,
    pub current_depth: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub stats: QueueStats,
}

/// A queue whose depth crossed the monitoring threshold
#[derive(Debug, Clone, Serialize)]
pub struct QueueAlert {
    pub queue: String,
    pub utilization: f64,
    pub current_depth: usize,
    pub capacity: usize,
}

/// Maps message kinds to queues and enforces capacity
pub struct QueueRouter {
    bus: Arc<MessageBus>,
    queues: DashMap<QueueName, QueueConfig>,
    stats: DashMap<QueueName, QueueStats>,
    kind_routes: HashMap<MessageKind, QueueName>,
}

impl QueueRouter {
    /// Creates a router over the default queue topology
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        let router = Self {
            bus,
            queues: DashMap::new(),
            stats: DashMap::new(),
            kind_routes: Self::default_kind_routes(),
        };
        for config in Self::default_queues() {
            router.register_queue(config);
        }
        router
    }

    fn default_queues() -> Vec<QueueConfig> {
        let mut dead_letter = QueueConfig::new(DEAD_LETTER_QUEUE, QueuePriority::Low, 1000);
        // The dead-letter queue has no dead-letter queue of its own.
        dead_letter.dead_letter_enabled = false;
        dead_letter.ttl_seconds = DEAD_LETTER_TTL_SECONDS;

        vec![
            QueueConfig::new("orchestrator", QueuePriority::Critical, 500),
            QueueConfig::new("analysis", QueuePriority::High, 200),
            QueueConfig::new("html_extraction", QueuePriority::Normal, 1000),
            QueueConfig::new("pdf_extraction", QueuePriority::Normal, 500),
            // Resource intensive
            QueueConfig::new("vision_extraction", QueuePriority::Low, 100),
            QueueConfig::new("content_analysis", QueuePriority::Normal, 500),
            QueueConfig::new("validation", QueuePriority::High, 500),
            dead_letter,
        ]
    }

    fn default_kind_routes() -> HashMap<MessageKind, QueueName> {
        let orchestrator = QueueName::from_static("orchestrator");
        HashMap::from([
            (MessageKind::JobCreated, orchestrator.clone()),
            (MessageKind::JobStarted, orchestrator.clone()),
            (MessageKind::JobCompleted, orchestrator.clone()),
            (MessageKind::JobFailed, orchestrator.clone()),
            (MessageKind::WorkflowRequest, orchestrator.clone()),
            (MessageKind::ValidationCompleted, orchestrator),
            (
                MessageKind::WebsiteAnalyzed,
                QueueName::from_static("html_extraction"),
            ),
            (
                MessageKind::ContentExtracted,
                QueueName::from_static("validation"),
            ),
        ])
    }

    /// Registers (or replaces) a queue configuration
    pub fn register_queue(&self, config: QueueConfig) {
        info!(queue = %config.name, priority = ?config.priority, "registered queue");
        self.stats.entry(config.name.clone()).or_default();
        self.queues.insert(config.name.clone(), config);
    }

    /// Resolves the target queue and publishes, falling back to the
    /// dead-letter queue on unknown targets, full queues, or publish
    /// failure.
    ///
    /// Returns `true` only when the message reached its resolved queue.
    pub async fn route(&self, mut message: Message) -> bool {
        let Some(target) = self.resolve_target(&message) else {
            error!(kind = %message.kind, message_id = %message.id, "no target queue for message kind");
            self.send_to_dead_letter(message, "no target queue").await;
            return false;
        };

        if self.is_queue_full(&target).await {
            warn!(queue = %target, message_id = %message.id, "queue full, routing to dead letter");
            self.send_to_dead_letter(message, "queue full").await;
            return false;
        }

        message.recipient = target.clone();
        let published = self.bus.publish(message.clone()).await;

        if published {
            self.record(&target, |s| s.sent += 1);
            debug!(message_id = %message.id, queue = %target, "routed message");
        } else {
            self.send_to_dead_letter(message, "publish failed").await;
        }
        published
    }

    fn resolve_target(&self, message: &Message) -> Option<QueueName> {
        if self.queues.contains_key(&message.recipient) {
            return Some(message.recipient.clone());
        }
        self.kind_routes.get(&message.kind).cloned()
    }

    async fn is_queue_full(&self, queue: &QueueName) -> bool {
        let Some(capacity) = self.queues.get(queue).map(|c| c.capacity.as_usize()) else {
            return true;
        };
        self.bus.queue_depth(queue).await >= capacity
    }

    async fn send_to_dead_letter(&self, message: Message, reason: &str) {
        let original_recipient = message.recipient.clone();
        let correlation_id = message.correlation_id;
        let envelope = DeadLetterEnvelope {
            original_message: message,
            failure_reason: reason.to_string(),
            failed_at: Utc::now(),
            original_recipient: original_recipient.clone(),
        };

        let payload = match serde_json::to_value(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode dead-letter envelope");
                return;
            }
        };

        let dead_letter = Message::new(
            MessageKind::JobFailed,
            "queue_router",
            QueueName::from_static(DEAD_LETTER_QUEUE),
            payload,
        )
        .with_correlation(correlation_id)
        .with_ttl(Some(DEAD_LETTER_TTL_SECONDS));

        let id = envelope_id(&dead_letter);
        if self.bus.publish(dead_letter).await {
            self.record(&original_recipient, |s| s.failed += 1);
            warn!(message_id = %id, reason, "sent message to dead letter");
        } else {
            error!(message_id = %id, reason, "failed to publish dead letter");
        }
    }

    /// Records a consumer acknowledgement against a queue's statistics
    pub fn record_ack(&self, queue: &QueueName, success: bool) {
        self.record(queue, |s| {
            if success {
                s.succeeded += 1;
            } else {
                s.failed += 1;
            }
        });
    }

    fn record(&self, queue: &QueueName, update: impl FnOnce(&mut QueueStats)) {
        let mut stats = self.stats.entry(queue.clone()).or_default();
        update(&mut stats);
        stats.last_activity = Some(Utc::now());
    }

    /// Consumes up to `limit` dead letters and routes their original
    /// messages again, stopping at the first message that fails to route.
    ///
    /// Replayed messages are counted again in routing statistics.
    pub async fn requeue_dead_letters(&self, limit: usize) -> usize {
        let dead_letter_queue = QueueName::from_static(DEAD_LETTER_QUEUE);
        let mut requeued = 0;

        for _ in 0..limit {
            let Some(message) = self
                .bus
                .consume(&dead_letter_queue, Duration::from_millis(100))
                .await
            else {
                break;
            };

            let envelope: DeadLetterEnvelope = match serde_json::from_value(message.payload.clone())
            {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "skipping malformed dead letter");
                    continue;
                }
            };

            if self.route(envelope.original_message.clone()).await {
                requeued += 1;
                info!(message_id = %envelope.original_message.id, "requeued dead letter");
            } else {
                // Still failing; the route call has already re-dead-lettered it.
                break;
            }
        }
        requeued
    }

    /// Drops every message queued for `queue`, returning how many were
    /// purged
    pub async fn purge_queue(&self, queue: &QueueName) -> Result<usize, RoutingError> {
        if !self.queues.contains_key(queue) {
            return Err(RoutingError::UnknownQueue {
                queue: queue.clone(),
            });
        }
        Ok(self.bus.clear_queue(queue).await)
    }

    /// Point-in-time view of one queue
    pub async fn queue_info(&self, queue: &QueueName) -> Option<QueueInfo> {
        let config = self.queues.get(queue)?.clone();
        let depth = self.bus.queue_depth(queue).await;
        let capacity = config.capacity.as_usize();
        let stats = self.stats.get(queue).map(|s| s.clone()).unwrap_or_default();
        Some(QueueInfo {
            name: queue.to_string(),
            priority: config.priority,
            current_depth: depth,
            capacity,
            utilization: depth as f64 / capacity as f64,
            stats,
        })
    }

    /// Point-in-time view of every registered queue
    pub async fn all_queue_status(&self) -> Vec<QueueInfo> {
        let names: Vec<QueueName> = self.queues.iter().map(|e| e.key().clone()).collect();
        let mut infos = Vec::with_capacity(names.len());
        for name in names {
            if let Some(info) = self.queue_info(&name).await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Returns queues whose utilization is at or above `threshold`
    pub async fn monitor_queues(&self, threshold: f64) -> Vec<QueueAlert> {
        let mut alerts = Vec::new();
        for info in self.all_queue_status().await {
            if info.utilization >= threshold {
                alerts.push(QueueAlert {
                    queue: info.name,
                    utilization: info.utilization,
                    current_depth: info.current_depth,
                    capacity: info.capacity,
                });
            }
        }
        if !alerts.is_empty() {
            warn!(count = alerts.len(), "queues over utilization threshold");
        }
        alerts
    }

    /// The queue a worker role consumes from
    #[must_use]
    pub fn queue_for_role(role: &str) -> QueueName {
        let name = match role {
            "analysis" => "analysis",
            "orchestrator" => "orchestrator",
            "html_extractor" => "html_extraction",
            "pdf_analyzer" => "pdf_extraction",
            "vision_processor" => "vision_extraction",
            "validator" => "validation",
            other => other,
        };
        QueueName::from_static(name)
    }
}

fn envelope_id(message: &Message) -> String {
    format!("dl_{}", message.id)
}
