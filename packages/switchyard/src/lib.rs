//! # Switchyard
//!
//! A transport-agnostic message bus with persistent, message-driven
//! workflows.
//!
//! ## Core Concepts
//!
//! Applications get three primitives:
//! - **publish** an event (broadcast fact)
//! - **send** a command (point-to-point intent)
//! - **subscribe** handlers to messages
//!
//! and, on top of them, **workflows**: declarative state machines whose
//! instances persist across messages and advance by consuming them.
//!
//! ## Architecture
//!
//! ```text
//! publish()/send()
//!     │
//!     ▼ hooks (send/publish)
//! Serializer ──► Transport (queue)
//!                    │
//!                    ▼ read_next()
//!              dispatch loop ──► HandlerRegistry
//!                    │                 │
//!                    │       ┌─────────┴──────────┐
//!                    │   plain handlers     workflow handlers
//!                    │                             │
//!                    │                     lookup + step dispatch
//!                    │                             │
//!                    │                        Persistence
//!                    │                     (optimistic version)
//!                    │
//!         success ──► delete_message
//!         failure ──► error hook + return_message (redelivery)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At-least-once delivery** - a message is deleted only after every
//!    resolved handler succeeded; failures return it for redelivery.
//! 2. **Retry policy belongs to the transport** - the bus only distinguishes
//!    success from failure.
//! 3. **Steps see snapshots** - workflow state handed to a step is an owned
//!    copy; the returned [`StepOutcome`] is the only channel back.
//! 4. **Optimistic concurrency is the only lock** - saves carry the loaded
//!    version; losers are retried via redelivery, never blocked.
//! 5. **Registries freeze at initialization** - configuration happens through
//!    the builder, which `initialize()` consumes.
//!
//! ## Example
//!
//! ```ignore
//! use switchyard::{configure, handler_fn, HandlerContext, InMemoryQueue, Message};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct OrderPlaced { order_id: String }
//!
//! impl Message for OrderPlaced {
//!     const NAME: &'static str = "orders/order-placed";
//! }
//!
//! let bus = configure()
//!     .with_transport(InMemoryQueue::new())
//!     .with_handler::<OrderPlaced, _>(handler_fn(|ctx: HandlerContext<OrderPlaced>| async move {
//!         tracing::info!(order_id = %ctx.message.order_id, "order placed");
//!         Ok(())
//!     }))
//!     .initialize()
//!     .await?;
//!
//! bus.start().await?;
//! bus.publish(OrderPlaced { order_id: "ord-1".into() }).await?;
//! ```

// Core modules
mod bus;
mod core;
mod error;
mod handler;
mod hooks;
mod memory_queue;
mod persistence;
mod registry;
mod serializer;
mod transport;
mod workflow;
mod workflow_registry;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export the message contract
pub use crate::core::{Message, MessageAttributes, OutgoingMessage, TransportMessage};

// Re-export the bus core
pub use crate::bus::{configure, Bus, BusConfiguration, BusState, NoTransport};

// Re-export handler types
pub use crate::handler::{handler_fn, FnHandler, Handler, HandlerContext, MessageSender};

// Re-export the handler registry
pub use crate::registry::HandlerRegistry;

// Re-export hook types
pub use crate::hooks::{ErrorListener, HookId, MessageListener};

// Re-export error types
pub use crate::error::BusError;

// Re-export the transport interface and the in-memory queue
pub use crate::memory_queue::{InMemoryQueue, InMemoryRaw};
pub use crate::transport::{Transport, TransportError};

// Re-export persistence types
pub use crate::persistence::{
    InMemoryPersistence, Persistence, PersistenceError, WorkflowRow, WorkflowSchema,
    WorkflowStatus,
};

// Re-export the serializer interface
pub use crate::serializer::{to_class, to_plain, JsonSerializer, SerializationError, Serializer};

// Re-export workflow types
pub use crate::workflow::{Lookup, StepOutcome, WorkflowDefinition, WorkflowState};
pub use crate::workflow_registry::WorkflowRegistry;

// Re-export commonly used external types
pub use async_trait::async_trait;
