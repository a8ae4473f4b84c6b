//! Core message contract for the switchyard bus.
//!
//! # Overview
//!
//! Switchyard moves **messages**. Two flavors exist by convention:
//! - *Commands* - point-to-point intent, one intended handler
//! - *Events* - broadcast facts, any number of handlers
//!
//! Both flavors are the same thing to the dispatch core; the distinction
//! lives in how they are emitted ([`send`] vs [`publish`]) and in the
//! contract the application gives its handlers.
//!
//! # Identity
//!
//! Every message type carries a stable, externally-visible name. Routing is
//! name-based: the registry maps names to handlers, and registration captures
//! a typed deserializer so the wire payload can be rebuilt into the concrete
//! type without the core ever knowing it.
//!
//! ```ignore
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct OrderPlaced {
//!     order_id: Uuid,
//! }
//!
//! impl Message for OrderPlaced {
//!     const NAME: &'static str = "orders/order-placed";
//! }
//! ```
//!
//! [`send`]: crate::Bus::send
//! [`publish`]: crate::Bus::publish

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use typed_builder::TypedBuilder;

/// A message that can travel over the bus.
///
/// Messages are plain serde data types with a stable wire name. The name must
/// not change once messages of this type exist in a queue.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable identifier used for routing and deserialization,
    /// e.g. `"orders/order-placed"`.
    const NAME: &'static str;
}

/// Metadata accompanying every message.
///
/// Attributes ride alongside the message body rather than inside it, so the
/// payload stays a clean domain type.
///
/// # Sticky attributes
///
/// `attributes` are carried by this message only. `sticky_attributes` are
/// propagated to every message subsequently sent or published from within a
/// handler invocation, nested or not - they travel down the causal chain
/// together with the correlation id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
pub struct MessageAttributes {
    /// Identifier tying together related messages.
    pub correlation_id: Option<String>,
    /// Scalar metadata carried with this message only.
    pub attributes: HashMap<String, Value>,
    /// Scalar metadata propagated down the causal chain.
    pub sticky_attributes: HashMap<String, Value>,
}

impl MessageAttributes {
    /// Create attributes carrying only a correlation id.
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Default::default()
        }
    }

    /// Set a single per-message attribute.
    pub fn set_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set a single sticky attribute.
    pub fn set_sticky_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sticky_attributes.insert(key.into(), value.into());
        self
    }
}

/// A serialized message on its way to the transport.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// The message's wire name.
    pub name: String,
    /// The serialized message body.
    pub body: String,
    /// Attributes to deliver alongside the body.
    pub attributes: MessageAttributes,
}

/// A message leased from the transport, paired with the raw envelope `R`
/// the transport needs to later acknowledge or release it.
///
/// The lease is consumed by [`Transport::delete_message`] on success or
/// [`Transport::return_message`] on failure.
///
/// [`Transport::delete_message`]: crate::Transport::delete_message
/// [`Transport::return_message`]: crate::Transport::return_message
#[derive(Debug)]
pub struct TransportMessage<R> {
    /// Transport-assigned identifier, if the transport has one.
    pub id: Option<String>,
    /// The message's wire name. External messages that were not authored
    /// against this bus may arrive without one; those are routed through
    /// resolver predicates instead.
    pub name: Option<String>,
    /// The serialized message body.
    pub body: String,
    /// Deserialized attributes.
    pub attributes: MessageAttributes,
    /// When the message was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// The raw transport-specific envelope.
    pub raw: R,
}
