//! Per-correlation session tokens for model continuity
//!
//! The kernel stores an opaque token per correlation id with a TTL; the
//! worker side decides what the token means.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{json, Value};

use crate::domain_types::CorrelationId;

struct SessionEntry {
    token: Value,
    created_at: DateTime<Utc>,
}

/// Opaque session tokens keyed by correlation id
pub struct SessionStore {
    entries: DashMap<CorrelationId, SessionEntry>,
    ttl: chrono::Duration,
}

impl SessionStore {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    /// Returns the live token for a correlation id, creating a fresh one if
    /// absent or expired
    pub fn get_or_create(&self, correlation_id: CorrelationId) -> Value {
        let now = Utc::now();
        if let Some(entry) = self.entries.get(&correlation_id) {
            if now - entry.created_at <= self.ttl {
                return entry.token.clone();
            }
        }
        let token = json!({
            "session_id": uuid::Uuid::new_v4().to_string(),
            "correlation_id": correlation_id.to_string(),
        });
        self.entries.insert(
            correlation_id,
            SessionEntry {
                token: token.clone(),
                created_at: now,
            },
        );
        token
    }

    /// Replaces the token for a correlation id
    pub fn update(&self, correlation_id: CorrelationId, token: Value) {
        self.entries.insert(
            correlation_id,
            SessionEntry {
                token,
                created_at: Utc::now(),
            },
        );
    }

    /// Drops expired sessions, returning how many were removed
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now - entry.created_at <= self.ttl);
        before - self.entries.len()
    }
}
