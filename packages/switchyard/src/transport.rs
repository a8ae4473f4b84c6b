//! The transport interface: an abstract queue the bus pulls from.
//!
//! A transport owns delivery policy. It decides visibility timeouts, retry
//! backoff, and the terminal fate of messages that keep failing (dead-letter
//! queues). The bus only tells it two things per leased message: *processing
//! succeeded* ([`delete_message`]) or *processing failed, redeliver later*
//! ([`return_message`]).
//!
//! The raw envelope type is transport-specific: an in-memory receipt, an SQS
//! receipt handle, a Redis stream entry id. The bus carries it opaquely
//! through [`TransportMessage`] and hands it back on delete/return.
//!
//! [`delete_message`]: Transport::delete_message
//! [`return_message`]: Transport::return_message

use async_trait::async_trait;
use thiserror::Error;

use crate::core::{OutgoingMessage, TransportMessage};

/// Errors from the transport backend.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The underlying queue failed (connection, broker, serialization of the
    /// raw envelope).
    #[error("transport backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// An abstract message queue.
///
/// `publish` and `send` enqueue; `read_next` leases the next in-flight
/// message; `delete_message` and `return_message` settle the lease.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The transport-specific raw envelope carried through
    /// [`TransportMessage`].
    type Raw: Send + Sync + 'static;

    /// Start the transport, paralleling the bus lifecycle.
    async fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Stop the transport.
    async fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Enqueue a broadcast event.
    async fn publish(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Enqueue a point-to-point command.
    async fn send(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Lease the next message, or return `None` after a bounded wait.
    ///
    /// Implementations must yield while waiting; the dispatch loop calls this
    /// in a tight cycle.
    async fn read_next(&self) -> Result<Option<TransportMessage<Self::Raw>>, TransportError>;

    /// Acknowledge successful processing, consuming the lease.
    async fn delete_message(
        &self,
        message: TransportMessage<Self::Raw>,
    ) -> Result<(), TransportError>;

    /// Release a message back to the queue for redelivery.
    ///
    /// The message's seen count increases by one per delivery; transports may
    /// apply backoff before making it visible again and may dead-letter
    /// messages that exceed their retry budget.
    async fn return_message(
        &self,
        message: TransportMessage<Self::Raw>,
    ) -> Result<(), TransportError>;
}
