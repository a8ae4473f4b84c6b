//! In-memory queue transport.
//!
//! Non-durable, single-process. The default transport for tests and
//! prototyping: messages live in a `VecDeque`, delivery counts are tracked
//! per message, and messages that exhaust their retry budget move to an
//! observable dead-letter queue instead of looping forever.
//!
//! Commands and events share one queue - in a single process there is no
//! meaningful topology between them.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::{MessageAttributes, OutgoingMessage, TransportMessage};
use crate::transport::{Transport, TransportError};

const DEFAULT_MAX_RETRIES: u32 = 10;
const DEFAULT_READ_WAIT: Duration = Duration::from_millis(100);

/// Raw envelope for messages leased from the in-memory queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InMemoryRaw {
    /// Queue-assigned sequence number.
    pub seq: u64,
    /// How many times this message has been delivered, this delivery
    /// included. One on first delivery, increasing by one per redelivery.
    pub seen_count: u32,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    name: Option<String>,
    body: String,
    attributes: MessageAttributes,
    enqueued_at: DateTime<Utc>,
    seen_count: u32,
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<StoredMessage>,
    dead_letter: VecDeque<StoredMessage>,
    next_seq: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    max_retries: u32,
    read_wait: Duration,
}

/// Non-durable FIFO queue for tests and prototyping.
///
/// Cheap to clone; clones share the same queue, so a test can keep one handle
/// for assertions and give another to the bus.
///
/// # Example
///
/// ```ignore
/// let queue = InMemoryQueue::new();
/// let bus = configure()
///     .with_transport(queue.clone())
///     .with_handler::<OrderPlaced, _>(handler)
///     .initialize()
///     .await?;
///
/// bus.start().await?;
/// bus.publish(OrderPlaced { .. }).await?;
/// // ... later
/// assert_eq!(queue.depth(), 0);
/// ```
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Shared>,
}

impl InMemoryQueue {
    /// Create a queue with the default retry budget.
    pub fn new() -> Self {
        Self::with_max_retries(DEFAULT_MAX_RETRIES)
    }

    /// Create a queue that dead-letters messages after `max_retries`
    /// deliveries.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                max_retries,
                read_wait: DEFAULT_READ_WAIT,
            }),
        }
    }

    /// Number of messages waiting in the queue (in-flight leases excluded).
    pub fn depth(&self) -> usize {
        self.lock().queue.len()
    }

    /// Number of dead-lettered messages.
    pub fn dead_letter_depth(&self) -> usize {
        self.lock().dead_letter.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, message: OutgoingMessage) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(StoredMessage {
            seq,
            name: Some(message.name),
            body: message.body,
            attributes: message.attributes,
            enqueued_at: Utc::now(),
            seen_count: 0,
        });
        drop(state);
        self.inner.notify.notify_one();
    }

    fn pop_next(&self) -> Option<TransportMessage<InMemoryRaw>> {
        let mut stored = self.lock().queue.pop_front()?;
        stored.seen_count += 1;
        Some(TransportMessage {
            id: Some(stored.seq.to_string()),
            name: stored.name,
            body: stored.body,
            attributes: stored.attributes,
            enqueued_at: stored.enqueued_at,
            raw: InMemoryRaw {
                seq: stored.seq,
                seen_count: stored.seen_count,
            },
        })
    }

    /// Inject a raw external message, as another producer on the same queue
    /// would. Messages without a name are routed through resolver predicates.
    pub fn inject_external(&self, body: impl Into<String>, attributes: MessageAttributes) {
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push_back(StoredMessage {
            seq,
            name: None,
            body: body.into(),
            attributes,
            enqueued_at: Utc::now(),
            seen_count: 0,
        });
        drop(state);
        self.inner.notify.notify_one();
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryQueue {
    type Raw = InMemoryRaw;

    async fn publish(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        self.enqueue(message);
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        self.enqueue(message);
        Ok(())
    }

    async fn read_next(&self) -> Result<Option<TransportMessage<InMemoryRaw>>, TransportError> {
        let deadline = tokio::time::Instant::now() + self.inner.read_wait;
        loop {
            // Register for notification before checking the queue, otherwise
            // an enqueue between check and await is lost.
            let notified = self.inner.notify.notified();
            if let Some(message) = self.pop_next() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn delete_message(
        &self,
        message: TransportMessage<InMemoryRaw>,
    ) -> Result<(), TransportError> {
        // The lease was exclusive; dropping the message completes it.
        debug!(seq = message.raw.seq, "message deleted");
        Ok(())
    }

    async fn return_message(
        &self,
        message: TransportMessage<InMemoryRaw>,
    ) -> Result<(), TransportError> {
        let stored = StoredMessage {
            seq: message.raw.seq,
            name: message.name,
            body: message.body,
            attributes: message.attributes,
            enqueued_at: message.enqueued_at,
            seen_count: message.raw.seen_count,
        };

        let mut state = self.lock();
        if stored.seen_count >= self.inner.max_retries {
            warn!(
                seq = stored.seq,
                seen_count = stored.seen_count,
                "message exceeded retry budget, dead-lettering"
            );
            state.dead_letter.push_back(stored);
        } else {
            state.queue.push_back(stored);
            drop(state);
            self.inner.notify.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outgoing(name: &str, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            name: name.to_string(),
            body: body.to_string(),
            attributes: MessageAttributes::default(),
        }
    }

    #[tokio::test]
    async fn publish_then_read() {
        let queue = InMemoryQueue::new();
        queue.publish(outgoing("test/event", "{}")).await.unwrap();
        assert_eq!(queue.depth(), 1);

        let message = queue.read_next().await.unwrap().unwrap();
        assert_eq!(message.name.as_deref(), Some("test/event"));
        assert_eq!(message.raw.seen_count, 1);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn read_next_returns_none_when_empty() {
        let queue = InMemoryQueue::new();
        let message = queue.read_next().await.unwrap();
        assert!(message.is_none());
    }

    #[tokio::test]
    async fn read_next_wakes_on_enqueue() {
        let queue = InMemoryQueue::new();
        let reader = queue.clone();

        let handle = tokio::spawn(async move { reader.read_next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.send(outgoing("test/cmd", "{}")).await.unwrap();

        let message = handle.await.unwrap().unwrap();
        assert!(message.is_some());
    }

    #[tokio::test]
    async fn returned_message_is_redelivered_with_higher_seen_count() {
        let queue = InMemoryQueue::new();
        queue.publish(outgoing("test/event", "{}")).await.unwrap();

        let first = queue.read_next().await.unwrap().unwrap();
        assert_eq!(first.raw.seen_count, 1);
        queue.return_message(first).await.unwrap();

        let second = queue.read_next().await.unwrap().unwrap();
        assert_eq!(second.raw.seen_count, 2);
    }

    #[tokio::test]
    async fn exhausted_message_is_dead_lettered() {
        let queue = InMemoryQueue::with_max_retries(2);
        queue.publish(outgoing("test/event", "{}")).await.unwrap();

        for _ in 0..2 {
            let message = queue.read_next().await.unwrap().unwrap();
            queue.return_message(message).await.unwrap();
        }

        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.dead_letter_depth(), 1);
    }

    #[tokio::test]
    async fn delete_consumes_the_lease() {
        let queue = InMemoryQueue::new();
        queue.publish(outgoing("test/event", "{}")).await.unwrap();

        let message = queue.read_next().await.unwrap().unwrap();
        queue.delete_message(message).await.unwrap();

        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.dead_letter_depth(), 0);
    }

    #[tokio::test]
    async fn injected_external_message_has_no_name() {
        let queue = InMemoryQueue::new();
        queue.inject_external(r#"{"kind":"alien"}"#, MessageAttributes::default());

        let message = queue.read_next().await.unwrap().unwrap();
        assert!(message.name.is_none());
    }

    #[tokio::test]
    async fn clones_share_the_queue() {
        let queue = InMemoryQueue::new();
        let other = queue.clone();

        queue.publish(outgoing("test/event", "{}")).await.unwrap();
        assert_eq!(other.depth(), 1);
    }
}
