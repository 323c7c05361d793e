//! Typed messages exchanged over the bus
//!
//! Every message carries a correlation id linking it to the causal chain it
//! belongs to; replies always copy the correlation id of their request.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain_types::{CorrelationId, MessageId, QueueName};

/// Default message time-to-live in seconds
pub const DEFAULT_TTL_SECONDS: i64 = 3600;

/// The closed set of message kinds understood by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    JobCreated,
    JobStarted,
    JobCompleted,
    JobFailed,
    WebsiteAnalyzed,
    ContentExtracted,
    ContentValidated,
    ValidationCompleted,
    AgentHealthCheck,
    WorkflowRequest,
    WorkflowCreated,
    WorkflowCompleted,
}

impl MessageKind {
    /// Wire name of the kind, matching the serde representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCreated => "job-created",
            Self::JobStarted => "job-started",
            Self::JobCompleted => "job-completed",
            Self::JobFailed => "job-failed",
            Self::WebsiteAnalyzed => "website-analyzed",
            Self::ContentExtracted => "content-extracted",
            Self::ContentValidated => "content-validated",
            Self::ValidationCompleted => "validation-completed",
            Self::AgentHealthCheck => "agent-health-check",
            Self::WorkflowRequest => "workflow-request",
            Self::WorkflowCreated => "workflow-created",
            Self::WorkflowCompleted => "workflow-completed",
        }
    }

    /// All kinds, in declaration order
    #[must_use]
    pub fn all() -> &'static [MessageKind] {
        &[
            Self::JobCreated,
            Self::JobStarted,
            Self::JobCompleted,
            Self::JobFailed,
            Self::WebsiteAnalyzed,
            Self::ContentExtracted,
            Self::ContentValidated,
            Self::ValidationCompleted,
            Self::AgentHealthCheck,
            Self::WorkflowRequest,
            Self::WorkflowCreated,
            Self::WorkflowCompleted,
        ]
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of inter-component communication
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub kind: MessageKind,
    pub sender: String,
    pub recipient: QueueName,
    pub payload: Value,
    pub correlation_id: CorrelationId,
    pub timestamp: DateTime<Utc>,
    /// Time-to-live in whole seconds; `None` means the message never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
}

impl Message {
    /// Creates a message with a fresh id, fresh correlation id, and the
    /// default TTL
    #[must_use]
    pub fn new(
        kind: MessageKind,
        sender: impl Into<String>,
        recipient: QueueName,
        payload: Value,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            kind,
            sender: sender.into(),
            recipient,
            payload,
            correlation_id: CorrelationId::generate(),
            timestamp: Utc::now(),
            ttl_seconds: Some(DEFAULT_TTL_SECONDS),
        }
    }

    /// Sets the correlation id, linking this message to an existing chain
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Sets the TTL in seconds; `None` disables expiry
    #[must_use]
    pub fn with_ttl(mut self, ttl_seconds: Option<i64>) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Builds a reply to this message. The reply carries the correlation id
    /// of its request.
    #[must_use]
    pub fn reply(
        &self,
        kind: MessageKind,
        sender: impl Into<String>,
        recipient: QueueName,
        payload: Value,
    ) -> Self {
        Self::new(kind, sender, recipient, payload).with_correlation(self.correlation_id)
    }

    /// Whether the message's TTL has elapsed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_seconds {
            Some(ttl) => now > self.timestamp + Duration::seconds(ttl),
            None => false,
        }
    }

    /// Serializes the message to its JSON wire form
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes a message from its JSON wire form
    pub fn from_wire(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_wire_names_are_kebab_case() {
        assert_eq!(MessageKind::JobCreated.as_str(), "job-created");
        assert_eq!(
            serde_json::to_value(MessageKind::AgentHealthCheck).unwrap(),
            json!("agent-health-check")
        );
        assert_eq!(MessageKind::all().len(), 12);
    }

    #[test]
    fn reply_carries_request_correlation_id() {
        let request = Message::new(
            MessageKind::WorkflowRequest,
            "client",
            QueueName::from_static("orchestrator"),
            json!({"url": "https://example.gov/acts"}),
        );
        let reply = request.reply(
            MessageKind::WorkflowCreated,
            "engine",
            QueueName::from_static("client"),
            json!({"workflow_id": "extraction_0001"}),
        );
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn expiry_respects_ttl() {
        let msg = Message::new(
            MessageKind::JobCreated,
            "engine",
            QueueName::from_static("analysis"),
            json!({}),
        )
        .with_ttl(Some(10));
        assert!(!msg.is_expired(msg.timestamp + Duration::seconds(5)));
        assert!(msg.is_expired(msg.timestamp + Duration::seconds(11)));

        let forever = msg.clone().with_ttl(None);
        assert!(!forever.is_expired(forever.timestamp + Duration::days(365)));
    }

    #[test]
    fn wire_round_trip_preserves_all_fields() {
        let msg = Message::new(
            MessageKind::ContentExtracted,
            "html_worker_1",
            QueueName::from_static("validation"),
            json!({"step_id": "extraction_0001_html_extraction", "documents": 3}),
        );
        let decoded = Message::from_wire(&msg.to_wire().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }
}
