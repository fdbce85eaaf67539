//! In-process bounded message bus.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use jobrelay_core::JobMessage;

use crate::bus::{BusError, MessageBus, Subscription};

/// Volatile bus backed by a bounded tokio channel.
///
/// - Non-blocking publish: a full buffer is reported as [`BusError::QueueFull`]
/// - Exactly one subscriber (the receiving half of the channel)
/// - `close` drops the sending half, so the subscriber drains what is buffered
///   and then sees the end of the stream
///
/// Messages live only in this process's memory. Running the dispatcher in a
/// different process from the publisher does not work with this backend.
#[derive(Debug)]
pub struct InMemoryMessageBus {
    sender: Mutex<Option<mpsc::Sender<JobMessage>>>,
    receiver: Mutex<Option<mpsc::Receiver<JobMessage>>>,
    capacity: usize,
}

impl InMemoryMessageBus {
    /// Create a bus holding at most `capacity` undelivered messages.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages published but not yet received, while the bus is open.
    ///
    /// The count is read off the sending half, which `close` drops. A closed
    /// bus therefore reports 0 even though the subscriber may still have
    /// buffered messages to drain.
    pub fn len(&self) -> usize {
        match self.sender.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|tx| self.capacity - tx.capacity())
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|guard| guard.is_none()).unwrap_or(true)
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, message: JobMessage) -> Result<(), BusError> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| BusError::Backend("lock poisoned".to_string()))?;
        let tx = guard.as_ref().ok_or(BusError::QueueClosed)?;

        let job_id = message.job_id;
        match tx.try_send(message) {
            Ok(()) => {
                debug!(job_id = %job_id, "published job message");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(BusError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(BusError::QueueClosed),
        }
    }

    async fn subscribe(&self) -> Result<Subscription, BusError> {
        let mut guard = self
            .receiver
            .lock()
            .map_err(|_| BusError::Backend("lock poisoned".to_string()))?;
        let rx = guard.take().ok_or(BusError::AlreadySubscribed)?;
        Ok(Subscription::new(rx))
    }

    fn close(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            if guard.take().is_some() {
                info!("in-memory bus closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrelay_core::JobId;

    fn message(n: usize) -> JobMessage {
        JobMessage::new(JobId::new(), format!("https://example.com/{n}"))
    }

    #[tokio::test]
    async fn publish_beyond_capacity_is_rejected() {
        let bus = InMemoryMessageBus::new(3);
        for n in 0..3 {
            bus.publish(message(n)).await.unwrap();
        }

        assert_eq!(bus.publish(message(3)).await, Err(BusError::QueueFull));
        assert_eq!(bus.len(), 3);
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let bus = InMemoryMessageBus::new(3);
        bus.close();
        bus.close();

        assert!(bus.is_closed());
        assert_eq!(bus.publish(message(0)).await, Err(BusError::QueueClosed));
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = InMemoryMessageBus::new(8);
        let sent: Vec<_> = (0..5).map(message).collect();
        for m in &sent {
            bus.publish(m.clone()).await.unwrap();
        }

        let mut sub = bus.subscribe().await.unwrap();
        for expected in sent {
            assert_eq!(sub.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn close_drains_buffer_then_ends_stream() {
        let bus = InMemoryMessageBus::new(4);
        let mut sub = bus.subscribe().await.unwrap();
        bus.publish(message(0)).await.unwrap();
        bus.publish(message(1)).await.unwrap();
        assert_eq!(bus.len(), 2);
        bus.close();
        assert!(bus.is_closed());
        assert_eq!(bus.len(), 0);

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn consumer_frees_capacity() {
        let bus = InMemoryMessageBus::new(1);
        let mut sub = bus.subscribe().await.unwrap();
        bus.publish(message(0)).await.unwrap();
        assert_eq!(bus.publish(message(1)).await, Err(BusError::QueueFull));

        sub.recv().await.unwrap();
        bus.publish(message(2)).await.unwrap();
    }

    #[tokio::test]
    async fn second_subscriber_is_refused() {
        let bus = InMemoryMessageBus::new(1);
        let _first = bus.subscribe().await.unwrap();
        assert_eq!(bus.subscribe().await.unwrap_err(), BusError::AlreadySubscribed);
    }

    #[tokio::test]
    async fn recv_waits_for_publish() {
        let bus = std::sync::Arc::new(InMemoryMessageBus::new(2));
        let mut sub = bus.subscribe().await.unwrap();

        let publisher = bus.clone();
        let expected = message(7);
        let sent = expected.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(sent).await.unwrap();
        });

        assert_eq!(sub.recv().await, Some(expected));
    }
}
