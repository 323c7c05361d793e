//! In-process message bus with per-recipient FIFO queues and per-kind
//! broadcast channels
//!
//! Delivery is at-least-once: a queue listener hands each message to every
//! registered handler in registration order, and handler failures are logged
//! rather than propagated. Messages whose TTL has elapsed by delivery time
//! are discarded. This is the only component that logs raw messages, at
//! debug level.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use super::message::{Message, MessageKind};
use crate::domain_types::QueueName;

/// Broadcast channel depth per message kind
const CHANNEL_CAPACITY: usize = 1024;

/// Errors surfaced by bus handlers and operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is shut down")]
    ShutDown,

    #[error("handler failed: {reason}")]
    HandlerFailed { reason: String },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// A consumer of delivered messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<(), BusError>;
}

/// Snapshot of bus reachability and queue depths
#[derive(Debug, Clone, Serialize)]
pub struct BusHealth {
    pub reachable: bool,
    pub queue_depths: HashMap<String, usize>,
}

struct QueueState {
    buf: Mutex<VecDeque<Message>>,
    notify: Notify,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    listener_started: AtomicBool,
}

impl QueueState {
    fn new() -> Self {
        Self {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            handlers: RwLock::new(Vec::new()),
            listener_started: AtomicBool::new(false),
        }
    }
}

/// In-process message bus
pub struct MessageBus {
    queues: DashMap<QueueName, Arc<QueueState>>,
    channels: DashMap<MessageKind, broadcast::Sender<Message>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    running: AtomicBool,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            channels: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
        }
    }

    fn queue(&self, name: &QueueName) -> Arc<QueueState> {
        self.queues
            .entry(name.clone())
            .or_insert_with(|| Arc::new(QueueState::new()))
            .clone()
    }

    fn channel(&self, kind: MessageKind) -> broadcast::Sender<Message> {
        self.channels
            .entry(kind)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Enqueues a message to its recipient's FIFO queue and mirrors it to
    /// the broadcast channel named by its kind.
    ///
    /// Returns `true` when the message was enqueued; `false` on any
    /// transport failure (currently: the bus has been shut down). Callers
    /// must handle `false`, usually by dead-lettering through the router.
    pub async fn publish(&self, message: Message) -> bool {
        if !self.running.load(Ordering::Acquire) {
            warn!(message_id = %message.id, "publish on shut-down bus");
            return false;
        }

        debug!(
            message_id = %message.id,
            kind = %message.kind,
            sender = %message.sender,
            recipient = %message.recipient,
            payload = %message.payload,
            "publishing message"
        );

        let state = self.queue(&message.recipient);
        {
            let mut buf = state.buf.lock().await;
            buf.push_back(message.clone());
        }
        state.notify.notify_one();

        // Channel taps are best-effort; no receivers is not a failure.
        let _ = self.channel(message.kind).send(message);
        true
    }

    /// Registers a queue handler. Handlers form a chain: every delivered
    /// message is seen by every handler in registration order. The first
    /// registration starts the queue's listener task.
    pub async fn subscribe_queue(self: &Arc<Self>, name: QueueName, handler: Arc<dyn MessageHandler>) {
        let state = self.queue(&name);
        state.handlers.write().await.push(handler);
        info!(queue = %name, "subscribed to queue");

        if !state.listener_started.swap(true, Ordering::AcqRel) {
            let bus = Arc::clone(self);
            let listener_name = name.clone();
            let task = tokio::spawn(async move {
                bus.run_queue_listener(listener_name).await;
            });
            self.tasks.lock().await.push(task);
        }
    }

    async fn run_queue_listener(self: Arc<Self>, name: QueueName) {
        info!(queue = %name, "queue listener started");
        let state = self.queue(&name);

        while self.running.load(Ordering::Acquire) {
            let Some(message) = self.consume(&name, Duration::from_secs(1)).await else {
                continue;
            };
            let handlers = state.handlers.read().await.clone();
            for handler in handlers {
                if let Err(e) = handler.handle(message.clone()).await {
                    error!(queue = %name, message_id = %message.id, error = %e, "queue handler error");
                }
            }
        }
        info!(queue = %name, "queue listener stopped");
    }

    /// Taps the broadcast stream for a message kind. Channel subscribers see
    /// every published message regardless of recipient; delivery is
    /// fire-and-forget and handler errors are logged, not reported.
    pub async fn subscribe_channel(
        self: &Arc<Self>,
        kind: MessageKind,
        handler: Arc<dyn MessageHandler>,
    ) {
        let mut rx = self.channel(kind).subscribe();
        let bus = Arc::clone(self);
        info!(channel = %kind, "subscribed to channel");

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if let Err(e) = handler.handle(message).await {
                            error!(channel = %kind, error = %e, "channel handler error");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %kind, skipped, "channel subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                if !bus.running.load(Ordering::Acquire) {
                    break;
                }
            }
        });
        self.tasks.lock().await.push(task);
    }

    /// Pops the next message from a queue, waiting up to `timeout`.
    ///
    /// Messages whose TTL elapsed while queued are discarded here, at
    /// delivery time.
    pub async fn consume(&self, name: &QueueName, timeout: Duration) -> Option<Message> {
        let state = self.queue(name);
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut buf = state.buf.lock().await;
                while let Some(message) = buf.pop_front() {
                    if message.is_expired(Utc::now()) {
                        debug!(message_id = %message.id, queue = %name, "discarding expired message");
                        continue;
                    }
                    return Some(message);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            tokio::select! {
                () = state.notify.notified() => {}
                () = sleep(remaining) => return None,
            }
        }
    }

    /// Current number of queued messages for a recipient
    pub async fn queue_depth(&self, name: &QueueName) -> usize {
        let state = self.queues.get(name).map(|s| Arc::clone(s.value()));
        match state {
            Some(state) => state.buf.lock().await.len(),
            None => 0,
        }
    }

    /// Drops every queued message for a recipient, returning how many were
    /// cleared
    pub async fn clear_queue(&self, name: &QueueName) -> usize {
        let Some(state) = self.queues.get(name).map(|s| Arc::clone(s.value())) else {
            return 0;
        };
        let mut buf = state.buf.lock().await;
        let cleared = buf.len();
        buf.clear();
        info!(queue = %name, cleared, "cleared queue");
        cleared
    }

    /// Lightweight keepalive: reachability plus per-queue depths
    pub async fn health_check(&self) -> BusHealth {
        let states: Vec<(String, Arc<QueueState>)> = self
            .queues
            .iter()
            .map(|entry| (entry.key().to_string(), Arc::clone(entry.value())))
            .collect();
        let mut queue_depths = HashMap::new();
        for (name, state) in states {
            let depth = state.buf.lock().await.len();
            queue_depths.insert(name, depth);
        }
        BusHealth {
            reachable: self.running.load(Ordering::Acquire),
            queue_depths,
        }
    }

    /// Stops listeners and refuses further publishes
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        for entry in &self.queues {
            entry.value().notify.notify_waiters();
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("message bus shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_message(recipient: &str, tag: u64) -> Message {
        Message::new(
            MessageKind::JobCreated,
            "test",
            QueueName::from_static(recipient),
            json!({ "tag": tag }),
        )
    }

    #[tokio::test]
    async fn publish_then_consume_is_fifo() {
        let bus = MessageBus::new();
        let queue = QueueName::from_static("analysis");
        for tag in 0..5u64 {
            assert!(bus.publish(test_message("analysis", tag)).await);
        }
        for tag in 0..5u64 {
            let msg = bus.consume(&queue, Duration::from_millis(50)).await.unwrap();
            assert_eq!(msg.payload["tag"], json!(tag));
        }
        assert!(bus.consume(&queue, Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn expired_messages_are_discarded_at_delivery() {
        let bus = MessageBus::new();
        let queue = QueueName::from_static("analysis");
        let mut stale = test_message("analysis", 1);
        stale.timestamp = Utc::now() - chrono::Duration::seconds(10);
        stale.ttl_seconds = Some(5);
        assert!(bus.publish(stale).await);
        assert!(bus.publish(test_message("analysis", 2)).await);

        let msg = bus.consume(&queue, Duration::from_millis(50)).await.unwrap();
        assert_eq!(msg.payload["tag"], json!(2));
    }

    #[tokio::test]
    async fn shutdown_refuses_publish() {
        let bus = MessageBus::new();
        bus.shutdown().await;
        assert!(!bus.publish(test_message("analysis", 1)).await);
    }

    #[tokio::test]
    async fn health_reports_queue_depths() {
        let bus = MessageBus::new();
        bus.publish(test_message("validation", 1)).await;
        bus.publish(test_message("validation", 2)).await;
        let health = bus.health_check().await;
        assert!(health.reachable);
        assert_eq!(health.queue_depths.get("validation"), Some(&2));
    }
}
