//! Message handlers and the context they run in.
//!
//! A handler is dispatched once per leased message. It receives a
//! [`HandlerContext`] carrying the typed message, its attributes, and the
//! only channel for emitting follow-on messages. Sending through the context
//! (rather than a free-standing bus handle) is what propagates the causal
//! chain: the incoming message's correlation id and sticky attributes attach
//! to every message sent or published during the invocation, nested or not.
//!
//! Handlers come in two shapes, normalized to one internally:
//!
//! ```ignore
//! // A plain async closure, adapted with handler_fn
//! .with_handler::<OrderPlaced, _>(handler_fn(|ctx: HandlerContext<OrderPlaced>| async move {
//!     info!(order_id = %ctx.message.order_id, "order placed");
//!     Ok(())
//! }))
//!
//! // Or a type implementing Handler, for handlers with dependencies
//! struct NotifyWarehouse { client: WarehouseClient }
//!
//! #[async_trait]
//! impl Handler<OrderPlaced> for NotifyWarehouse {
//!     async fn handle(&self, ctx: HandlerContext<OrderPlaced>) -> Result<()> {
//!         self.client.reserve(ctx.message.order_id).await?;
//!         ctx.publish(StockReserved { order_id: ctx.message.order_id }).await
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::{Message, MessageAttributes};
use crate::serializer::to_plain;

/// A message handler.
///
/// Implement directly for handlers with dependencies, or adapt an async
/// closure with [`handler_fn`].
#[async_trait]
pub trait Handler<M>: Send + Sync + 'static {
    /// Handle one delivery of the message.
    ///
    /// Returning an error releases the message back to the transport for
    /// redelivery and fires the bus error hook.
    async fn handle(&self, context: HandlerContext<M>) -> Result<()>;
}

/// Adapt an async closure into a [`Handler`].
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<F>
where
    M: Send + Sync + 'static,
    F: Fn(HandlerContext<M>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    FnHandler(f)
}

/// A [`Handler`] backed by an async closure. Built by [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<M, F, Fut> Handler<M> for FnHandler<F>
where
    M: Send + Sync + 'static,
    F: Fn(HandlerContext<M>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, context: HandlerContext<M>) -> Result<()> {
        (self.0)(context).await
    }
}

/// The sink a [`MessageSender`] forwards into. Implemented by the bus core;
/// fires the send/publish hooks and serializes before the transport call.
#[async_trait]
pub(crate) trait EnvelopeSink: Send + Sync {
    async fn publish_plain(
        &self,
        name: &str,
        plain: Value,
        attributes: MessageAttributes,
    ) -> Result<()>;

    async fn send_plain(
        &self,
        name: &str,
        plain: Value,
        attributes: MessageAttributes,
    ) -> Result<()>;
}

/// The causal frame of the handler invocation: what the outgoing side
/// inherits from the incoming message.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextFrame {
    correlation_id: Option<String>,
    sticky_attributes: HashMap<String, Value>,
}

impl ContextFrame {
    pub(crate) fn from_attributes(attributes: &MessageAttributes) -> Self {
        Self {
            correlation_id: attributes.correlation_id.clone(),
            sticky_attributes: attributes.sticky_attributes.clone(),
        }
    }

    /// Merge the frame into explicitly-supplied outgoing attributes.
    /// Explicit values win; the frame fills the gaps.
    fn apply(&self, mut attributes: MessageAttributes) -> MessageAttributes {
        if attributes.correlation_id.is_none() {
            attributes.correlation_id = self.correlation_id.clone();
        }
        for (key, value) in &self.sticky_attributes {
            attributes
                .sticky_attributes
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        attributes
    }
}

/// Frame-aware handle for emitting messages from inside a handler.
#[derive(Clone)]
pub struct MessageSender {
    sink: Arc<dyn EnvelopeSink>,
    frame: ContextFrame,
}

impl MessageSender {
    pub(crate) fn new(sink: Arc<dyn EnvelopeSink>, frame: ContextFrame) -> Self {
        Self { sink, frame }
    }

    /// Publish an event, inheriting the frame's correlation id and sticky
    /// attributes.
    pub async fn publish<E: Message>(&self, event: E) -> Result<()> {
        self.publish_with_attributes(event, MessageAttributes::default())
            .await
    }

    /// Publish an event with explicit attributes; the frame fills any gaps.
    pub async fn publish_with_attributes<E: Message>(
        &self,
        event: E,
        attributes: MessageAttributes,
    ) -> Result<()> {
        let plain = to_plain(&event)?;
        self.sink
            .publish_plain(E::NAME, plain, self.frame.apply(attributes))
            .await
    }

    /// Send a command, inheriting the frame's correlation id and sticky
    /// attributes.
    pub async fn send<C: Message>(&self, command: C) -> Result<()> {
        self.send_with_attributes(command, MessageAttributes::default())
            .await
    }

    /// Send a command with explicit attributes; the frame fills any gaps.
    pub async fn send_with_attributes<C: Message>(
        &self,
        command: C,
        attributes: MessageAttributes,
    ) -> Result<()> {
        let plain = to_plain(&command)?;
        self.sink
            .send_plain(C::NAME, plain, self.frame.apply(attributes))
            .await
    }
}

/// Context passed to message handlers and workflow steps.
///
/// Cheap to clone; clones are semantically identical.
#[derive(Clone)]
pub struct HandlerContext<M> {
    /// The deserialized message.
    pub message: M,
    /// The attributes it was delivered with.
    pub attributes: MessageAttributes,
    sender: MessageSender,
}

impl<M> HandlerContext<M> {
    pub(crate) fn new(message: M, attributes: MessageAttributes, sender: MessageSender) -> Self {
        Self {
            message,
            attributes,
            sender,
        }
    }

    /// Publish an event down the causal chain of this invocation.
    pub async fn publish<E: Message>(&self, event: E) -> Result<()> {
        self.sender.publish(event).await
    }

    /// Publish with explicit attributes; the invocation's frame fills gaps.
    pub async fn publish_with_attributes<E: Message>(
        &self,
        event: E,
        attributes: MessageAttributes,
    ) -> Result<()> {
        self.sender.publish_with_attributes(event, attributes).await
    }

    /// Send a command down the causal chain of this invocation.
    pub async fn send<C: Message>(&self, command: C) -> Result<()> {
        self.sender.send(command).await
    }

    /// Send with explicit attributes; the invocation's frame fills gaps.
    pub async fn send_with_attributes<C: Message>(
        &self,
        command: C,
        attributes: MessageAttributes,
    ) -> Result<()> {
        self.sender.send_with_attributes(command, attributes).await
    }

    /// The frame-aware sender, for handing to helpers.
    pub fn sender(&self) -> &MessageSender {
        &self.sender
    }
}
