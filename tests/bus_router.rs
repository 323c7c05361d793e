//! Bus and router integration: FIFO delivery, handler chains, capacity
//! back-pressure, and dead-letter replay

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

use regula::domain_types::QueueName;
use regula::messaging::{
    BusError, Message, MessageBus, MessageHandler, MessageKind, QueueConfig, QueuePriority,
    QueueRouter, DEAD_LETTER_QUEUE,
};

struct Recorder {
    id: usize,
    seen: Arc<Mutex<Vec<(usize, u64)>>>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, message: Message) -> Result<(), BusError> {
        let tag = message.payload["tag"].as_u64().unwrap_or(0);
        self.seen.lock().await.push((self.id, tag));
        Ok(())
    }
}

fn tagged(recipient: &str, tag: u64) -> Message {
    Message::new(
        MessageKind::JobCreated,
        "producer",
        QueueName::from_static(recipient),
        json!({ "tag": tag }),
    )
}

async fn settle(seen: &Arc<Mutex<Vec<(usize, u64)>>>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen.lock().await.len() < expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "handlers never saw {expected} deliveries"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn same_sender_messages_are_delivered_in_fifo_order() {
    let bus = Arc::new(MessageBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_queue(
        QueueName::from_static("analysis"),
        Arc::new(Recorder {
            id: 0,
            seen: Arc::clone(&seen),
        }),
    )
    .await;

    for tag in 0..50u64 {
        assert!(bus.publish(tagged("analysis", tag)).await);
    }
    settle(&seen, 50).await;

    let tags: Vec<u64> = seen.lock().await.iter().map(|(_, t)| *t).collect();
    assert_eq!(tags, (0..50).collect::<Vec<u64>>());
    bus.shutdown().await;
}

#[tokio::test]
async fn handler_chain_sees_every_message_in_registration_order() {
    let bus = Arc::new(MessageBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    for id in 0..2 {
        bus.subscribe_queue(
            QueueName::from_static("validation"),
            Arc::new(Recorder {
                id,
                seen: Arc::clone(&seen),
            }),
        )
        .await;
    }

    bus.publish(tagged("validation", 7)).await;
    bus.publish(tagged("validation", 8)).await;
    settle(&seen, 4).await;

    let log = seen.lock().await.clone();
    assert_eq!(log, vec![(0, 7), (1, 7), (0, 8), (1, 8)]);
    bus.shutdown().await;
}

#[tokio::test]
async fn channel_subscribers_observe_all_recipients() {
    let bus = Arc::new(MessageBus::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe_channel(
        MessageKind::JobCreated,
        Arc::new(Recorder {
            id: 9,
            seen: Arc::clone(&seen),
        }),
    )
    .await;

    bus.publish(tagged("analysis", 1)).await;
    bus.publish(tagged("validation", 2)).await;
    settle(&seen, 2).await;

    let tags: Vec<u64> = seen.lock().await.iter().map(|(_, t)| *t).collect();
    assert_eq!(tags, vec![1, 2]);
    bus.shutdown().await;
}

#[tokio::test]
async fn queue_at_capacity_routes_to_dead_letter() {
    let bus = Arc::new(MessageBus::new());
    let router = QueueRouter::new(Arc::clone(&bus));
    router.register_queue(QueueConfig {
        name: QueueName::from_static("narrow"),
        priority: QueuePriority::Normal,
        capacity: regula::domain_types::QueueCapacity::try_new(2).unwrap(),
        consumer_timeout_secs: 30,
        max_retries: regula::domain_types::MaxRetries::default(),
        ttl_seconds: 3600,
        dead_letter_enabled: true,
    });

    for tag in 0..4u64 {
        router.route(tagged("narrow", tag)).await;
    }
    assert_eq!(bus.queue_depth(&QueueName::from_static("narrow")).await, 2);
    assert_eq!(
        bus.queue_depth(&QueueName::from_static(DEAD_LETTER_QUEUE)).await,
        2
    );
}

#[tokio::test]
async fn replayed_dead_letters_are_counted_again_in_stats() {
    let bus = Arc::new(MessageBus::new());
    let router = QueueRouter::new(Arc::clone(&bus));
    let narrow = QueueName::from_static("narrow");
    router.register_queue(QueueConfig {
        name: narrow.clone(),
        priority: QueuePriority::Normal,
        capacity: regula::domain_types::QueueCapacity::try_new(1).unwrap(),
        consumer_timeout_secs: 30,
        max_retries: regula::domain_types::MaxRetries::default(),
        ttl_seconds: 3600,
        dead_letter_enabled: true,
    });

    assert!(router.route(tagged("narrow", 1)).await);
    assert!(!router.route(tagged("narrow", 2)).await);

    // Drain the queue, then replay the dead letter.
    bus.clear_queue(&narrow).await;
    assert_eq!(router.requeue_dead_letters(10).await, 1);

    let info = router.queue_info(&narrow).await.unwrap();
    // One initial success plus the replayed message: routing work is
    // counted per attempt, not per unique message.
    assert_eq!(info.stats.sent, 2);
    assert_eq!(info.stats.failed, 1);
}

#[tokio::test]
async fn monitor_flags_queues_over_threshold() {
    let bus = Arc::new(MessageBus::new());
    let router = QueueRouter::new(Arc::clone(&bus));
    let narrow = QueueName::from_static("narrow");
    router.register_queue(QueueConfig {
        name: narrow.clone(),
        priority: QueuePriority::Normal,
        capacity: regula::domain_types::QueueCapacity::try_new(4).unwrap(),
        consumer_timeout_secs: 30,
        max_retries: regula::domain_types::MaxRetries::default(),
        ttl_seconds: 3600,
        dead_letter_enabled: true,
    });

    for tag in 0..4u64 {
        router.route(tagged("narrow", tag)).await;
    }
    let alerts = router.monitor_queues(0.8).await;
    assert!(alerts.iter().any(|a| a.queue == "narrow"));

    // Purging clears the alert.
    assert_eq!(router.purge_queue(&narrow).await.unwrap(), 4);
    let alerts = router.monitor_queues(0.8).await;
    assert!(!alerts.iter().any(|a| a.queue == "narrow"));
}
