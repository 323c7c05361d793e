//! Asynchronous message substrate: typed messages, the in-process bus, and
//! the queue router
//!
//! Components never call each other directly; they publish [`Message`]s to
//! per-recipient FIFO queues through the [`QueueRouter`], which enforces
//! capacity and dead-letters anything unroutable. Broadcast channels keyed
//! by [`MessageKind`] let observers tap the stream without consuming it.

pub mod bus;
pub mod message;
pub mod router;

pub use bus::{BusError, BusHealth, MessageBus, MessageHandler};
pub use message::{Message, MessageKind, DEFAULT_TTL_SECONDS};
pub use router::{
    DeadLetterEnvelope, QueueAlert, QueueConfig, QueueInfo, QueuePriority, QueueRouter,
    QueueStats, RoutingError, DEAD_LETTER_QUEUE, DEAD_LETTER_TTL_SECONDS,
};
