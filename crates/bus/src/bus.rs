//! Job message transport abstraction (mechanics only).
//!
//! The bus carries [`JobMessage`] envelopes from the submission path to the
//! dispatcher. It is deliberately small:
//!
//! - **Transport-agnostic**: in-process bounded channel or a durable log (Redis Streams)
//! - **Ordered**: messages are delivered in publish order for a given bus instance
//! - **At-most-once per delivery**: there is no acknowledgement and no redelivery
//! - **No status**: the job store is the source of truth; the bus only says "go"
//!
//! Consumers must not assume a message they missed will be delivered again.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use jobrelay_core::JobMessage;

/// Bus operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bounded buffer is saturated; the message was not enqueued.
    #[error("queue is full")]
    QueueFull,
    /// `close()` has been called.
    #[error("queue is closed")]
    QueueClosed,
    /// The bus hands out a single consumer and it is already taken.
    #[error("queue already has a subscriber")]
    AlreadySubscribed,
    /// The backing service failed or timed out.
    #[error("bus backend unavailable: {0}")]
    Backend(String),
}

/// A consumer's view of the bus.
///
/// Yields messages in arrival order. `recv` suspends until a message is
/// available and returns `None` once the bus is closed and drained.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut sub = bus.subscribe().await?;
/// while let Some(message) = sub.recv().await {
///     dispatch(message).await;
/// }
/// ```
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<JobMessage>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<JobMessage>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message.
    pub async fn recv(&mut self) -> Option<JobMessage> {
        self.receiver.recv().await
    }

    /// Take a message if one is ready, without waiting.
    pub fn try_recv(&mut self) -> Option<JobMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Transport between job submission and execution.
///
/// ## Contract
///
/// - `publish` enqueues for later delivery. Bounded implementations fail fast
///   with [`BusError::QueueFull`] rather than blocking or dropping.
/// - `subscribe` starts a continuous, ordered stream. It is not restartable.
///   Whether messages published before the first subscription are seen is
///   backend specific: the in-process bus buffers them, the Redis stream
///   reader starts from the newest entry.
/// - `close` is idempotent. Afterwards `publish` fails with
///   [`BusError::QueueClosed`] and subscriptions end once drained.
///
/// ## Thread Safety
///
/// Implementations are shared as `Arc<dyn MessageBus>` between the submission
/// path and the dispatcher, so all synchronisation is internal.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, message: JobMessage) -> Result<(), BusError>;

    async fn subscribe(&self) -> Result<Subscription, BusError>;

    fn close(&self);
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, message: JobMessage) -> Result<(), BusError> {
        (**self).publish(message).await
    }

    async fn subscribe(&self) -> Result<Subscription, BusError> {
        (**self).subscribe().await
    }

    fn close(&self) {
        (**self).close()
    }
}
