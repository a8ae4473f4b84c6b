//! The bus core: lifecycle, publish/send entry points, and the dispatch loop.
//!
//! ```text
//! publish()/send() ──► hooks ──► serializer ──► Transport
//!
//! Transport ──► dispatch loop ──► HandlerRegistry ──► handlers
//!                    │                                   │
//!                    │          all succeed ──► delete_message
//!                    │          any failure ──► error hook + return_message
//!                    │                                   │
//!                    └────────── workflow handlers ──► Persistence
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ─initialize()─► Initialized ─start()─► Starting ─► Started
//!                                    ▲                                │
//!                                    │                             stop()
//!                                 (builder)                           ▼
//!                                              Stopped ◄─ Stopping ◄──┘
//!                                                 │
//!                                                 └────── start() ──► …
//! ```
//!
//! `Uninitialized` is the builder: dependencies can only be installed through
//! [`configure`], and [`BusConfiguration::initialize`] consumes it, freezing
//! both registries. Re-entering `Starting`/`Stopping` from themselves is a
//! [`BusError::LifecycleViolation`].
//!
//! # Delivery semantics
//!
//! At-least-once. A message is deleted from the transport only after every
//! resolved handler has succeeded; any failure returns it for redelivery and
//! the transport decides backoff and terminal fate. The bus itself never
//! retries in place.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{Message, MessageAttributes, OutgoingMessage, TransportMessage};
use crate::error::{is_concurrency_conflict, BusError};
use crate::handler::{ContextFrame, EnvelopeSink, Handler, MessageSender};
use crate::hooks::{ErrorListener, HookId, HookRegistry, MessageListener};
use crate::persistence::{Persistence, PersistenceError};
use crate::registry::HandlerRegistry;
use crate::serializer::{to_plain, JsonSerializer, Serializer};
use crate::transport::Transport;
use crate::workflow::{WorkflowDefinition, WorkflowState};
use crate::workflow_registry::WorkflowRegistry;

/// How long the loop backs off after a transport read failure.
const READ_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Observable lifecycle state of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Dependencies are still being installed (the builder phase).
    Uninitialized,
    /// Registries are wired and frozen; the dispatch loop is not running.
    Initialized,
    /// `start()` is in progress.
    Starting,
    /// The dispatch loop is running.
    Started,
    /// `stop()` is in progress; in-flight handlers are draining.
    Stopping,
    /// The dispatch loop has drained and stopped.
    Stopped,
}

impl fmt::Display for BusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusState::Uninitialized => "Uninitialized",
            BusState::Initialized => "Initialized",
            BusState::Starting => "Starting",
            BusState::Started => "Started",
            BusState::Stopping => "Stopping",
            BusState::Stopped => "Stopped",
        };
        write!(f, "{name}")
    }
}

/// Start configuring a bus.
///
/// The builder is the only way to install dependencies; `initialize()`
/// consumes it and freezes the registries.
pub fn configure() -> BusConfiguration<NoTransport> {
    BusConfiguration::new()
}

/// Placeholder transport before [`BusConfiguration::with_transport`] is
/// called. A bus cannot be initialized without a real transport.
pub struct NoTransport;

/// Builder for a [`Bus`].
pub struct BusConfiguration<T> {
    transport: T,
    serializer: Arc<dyn Serializer>,
    persistence: Option<Arc<dyn Persistence>>,
    handlers: HandlerRegistry,
    workflows: WorkflowRegistry,
    concurrency: usize,
}

impl BusConfiguration<NoTransport> {
    /// Create a configuration with the JSON serializer and no transport.
    pub fn new() -> Self {
        Self {
            transport: NoTransport,
            serializer: Arc::new(JsonSerializer),
            persistence: None,
            handlers: HandlerRegistry::new(),
            workflows: WorkflowRegistry::new(),
            concurrency: 1,
        }
    }
}

impl Default for BusConfiguration<NoTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X> BusConfiguration<X> {
    /// Install the transport.
    pub fn with_transport<T: Transport>(self, transport: T) -> BusConfiguration<T> {
        BusConfiguration {
            transport,
            serializer: self.serializer,
            persistence: self.persistence,
            handlers: self.handlers,
            workflows: self.workflows,
            concurrency: self.concurrency,
        }
    }

    /// Replace the default JSON serializer.
    pub fn with_serializer(mut self, serializer: impl Serializer) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    /// Install the workflow persistence backend.
    pub fn with_persistence(mut self, persistence: impl Persistence) -> Self {
        self.persistence = Some(Arc::new(persistence));
        self
    }

    /// Maximum number of in-flight messages processed concurrently.
    /// Defaults to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Register a handler for a named message type.
    ///
    /// # Panics
    ///
    /// Panics if the same handler type is already registered for this
    /// message - a configuration bug. Use [`try_with_handler`] for the
    /// non-panicking form.
    ///
    /// [`try_with_handler`]: Self::try_with_handler
    pub fn with_handler<M, H>(self, handler: H) -> Self
    where
        M: Message,
        H: Handler<M>,
    {
        self.try_with_handler::<M, H>(handler)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Register a handler, returning an error on duplicate registration.
    pub fn try_with_handler<M, H>(mut self, handler: H) -> Result<Self, BusError>
    where
        M: Message,
        H: Handler<M>,
    {
        self.handlers.register::<M, H>(handler)?;
        Ok(self)
    }

    /// Register a handler for external messages, claimed by a resolver
    /// predicate over the plain payload.
    ///
    /// # Panics
    ///
    /// Panics on duplicate registration; use [`try_with_custom_handler`].
    ///
    /// [`try_with_custom_handler`]: Self::try_with_custom_handler
    pub fn with_custom_handler<M, H>(
        self,
        handler: H,
        resolves_with: impl Fn(&Value) -> bool + Send + Sync + 'static,
        topic_identifier: Option<String>,
    ) -> Self
    where
        M: serde::de::DeserializeOwned + Send + Sync + 'static,
        H: Handler<M>,
    {
        self.try_with_custom_handler::<M, H>(handler, resolves_with, topic_identifier)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Register a custom handler, returning an error on duplicate
    /// registration.
    pub fn try_with_custom_handler<M, H>(
        mut self,
        handler: H,
        resolves_with: impl Fn(&Value) -> bool + Send + Sync + 'static,
        topic_identifier: Option<String>,
    ) -> Result<Self, BusError>
    where
        M: serde::de::DeserializeOwned + Send + Sync + 'static,
        H: Handler<M>,
    {
        self.handlers
            .register_resolver::<M, H>(handler, resolves_with, topic_identifier)?;
        Ok(self)
    }

    /// Register a workflow definition.
    ///
    /// # Panics
    ///
    /// Panics on duplicate workflow names or invalid lookup mappings; use
    /// [`try_with_workflow`] for the non-panicking form.
    ///
    /// [`try_with_workflow`]: Self::try_with_workflow
    pub fn with_workflow<S: WorkflowState>(self, workflow: WorkflowDefinition<S>) -> Self {
        self.try_with_workflow(workflow)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Register a workflow, returning an error on duplicates or invalid
    /// mappings.
    pub fn try_with_workflow<S: WorkflowState>(
        mut self,
        workflow: WorkflowDefinition<S>,
    ) -> Result<Self, BusError> {
        self.workflows.register(workflow)?;
        Ok(self)
    }
}

impl<T: Transport> BusConfiguration<T> {
    /// Wire registered handlers and workflows into the registries and the
    /// persistence backend, and hand back the bus in `Initialized` state.
    pub async fn initialize(mut self) -> Result<Bus<T>, BusError> {
        if !self.workflows.is_empty() {
            let persistence = self
                .persistence
                .clone()
                .ok_or(PersistenceError::NotConfigured)?;
            persistence.initialize().await?;
            self.workflows
                .initialize(&mut self.handlers, persistence)
                .await?;
        } else if let Some(persistence) = &self.persistence {
            persistence.initialize().await?;
        }

        info!(
            message_names = self.handlers.message_names().len(),
            concurrency = self.concurrency,
            "bus initialized"
        );

        Ok(Bus {
            inner: Arc::new(BusInner {
                transport: self.transport,
                serializer: self.serializer,
                persistence: self.persistence,
                handlers: self.handlers,
                hooks: HookRegistry::default(),
                state: Mutex::new(BusState::Initialized),
                concurrency: self.concurrency,
                loop_control: Mutex::new(None),
            }),
        })
    }
}

struct LoopControl {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct BusInner<T: Transport> {
    transport: T,
    serializer: Arc<dyn Serializer>,
    persistence: Option<Arc<dyn Persistence>>,
    handlers: HandlerRegistry,
    hooks: HookRegistry<T::Raw>,
    state: Mutex<BusState>,
    concurrency: usize,
    loop_control: Mutex<Option<LoopControl>>,
}

impl<T: Transport> BusInner<T> {
    fn state(&self) -> BusState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: BusState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Fire the hook, serialize, and hand the message to the transport.
    /// The hook fires before the transport call, on the calling task.
    async fn emit(
        &self,
        is_command: bool,
        name: &str,
        plain: Value,
        attributes: MessageAttributes,
    ) -> Result<(), BusError> {
        if is_command {
            self.hooks.fire_send(&plain, &attributes);
        } else {
            self.hooks.fire_publish(&plain, &attributes);
        }

        let body = self.serializer.serialize(&plain)?;
        let outgoing = OutgoingMessage {
            name: name.to_string(),
            body,
            attributes,
        };
        if is_command {
            self.transport.send(outgoing).await?;
        } else {
            self.transport.publish(outgoing).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Transport> EnvelopeSink for BusInner<T> {
    async fn publish_plain(
        &self,
        name: &str,
        plain: Value,
        attributes: MessageAttributes,
    ) -> Result<()> {
        self.emit(false, name, plain, attributes)
            .await
            .map_err(anyhow::Error::from)
    }

    async fn send_plain(
        &self,
        name: &str,
        plain: Value,
        attributes: MessageAttributes,
    ) -> Result<()> {
        self.emit(true, name, plain, attributes)
            .await
            .map_err(anyhow::Error::from)
    }
}

/// A configured message bus.
///
/// Cheap to clone; clones share the same transport, registries, and
/// lifecycle.
pub struct Bus<T: Transport> {
    inner: Arc<BusInner<T>>,
}

impl<T: Transport> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Bus<T> {
    /// Current lifecycle state.
    pub fn state(&self) -> BusState {
        self.inner.state()
    }

    /// Begin the dispatch loop.
    pub async fn start(&self) -> Result<(), BusError> {
        let prior = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                prior @ (BusState::Initialized | BusState::Stopped) => {
                    *state = BusState::Starting;
                    prior
                }
                actual => {
                    return Err(BusError::LifecycleViolation {
                        operation: "start",
                        required: "Initialized or Stopped",
                        actual,
                    })
                }
            }
        };

        if let Err(error) = self.inner.transport.start().await {
            self.inner.set_state(prior);
            return Err(error.into());
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_dispatch_loop(self.inner.clone(), shutdown.clone()));
        *self
            .inner
            .loop_control
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(LoopControl { shutdown, handle });

        self.inner.set_state(BusState::Started);
        info!("bus started");
        Ok(())
    }

    /// Stop accepting messages and wait for in-flight handlers to drain.
    pub async fn stop(&self) -> Result<(), BusError> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                BusState::Started => *state = BusState::Stopping,
                actual => {
                    return Err(BusError::LifecycleViolation {
                        operation: "stop",
                        required: "Started",
                        actual,
                    })
                }
            }
        }

        let control = self
            .inner
            .loop_control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(control) = control {
            control.shutdown.cancel();
            if let Err(error) = control.handle.await {
                error!(error = %error, "dispatch loop task failed");
            }
        }

        let result = self.inner.transport.stop().await;
        self.inner.set_state(BusState::Stopped);
        info!("bus stopped");
        result.map_err(Into::into)
    }

    /// Stop the bus if running and dispose the persistence backend.
    ///
    /// A backend reporting [`PersistenceError::NotConfigured`] during dispose
    /// is tolerated; every other failure propagates.
    pub async fn dispose(&self) -> Result<(), BusError> {
        if self.state() == BusState::Started {
            self.stop().await?;
        }
        if let Some(persistence) = &self.inner.persistence {
            match persistence.dispose().await {
                Err(PersistenceError::NotConfigured) => {}
                other => other?,
            }
        }
        Ok(())
    }

    /// Publish a broadcast event. The `publish` hook fires exactly once,
    /// before the transport call.
    pub async fn publish<E: Message>(&self, event: E) -> Result<(), BusError> {
        self.publish_with_attributes(event, MessageAttributes::default())
            .await
    }

    /// Publish with explicit attributes.
    pub async fn publish_with_attributes<E: Message>(
        &self,
        event: E,
        attributes: MessageAttributes,
    ) -> Result<(), BusError> {
        let plain = to_plain(&event)?;
        self.inner.emit(false, E::NAME, plain, attributes).await
    }

    /// Send a point-to-point command. The `send` hook fires exactly once,
    /// before the transport call.
    pub async fn send<C: Message>(&self, command: C) -> Result<(), BusError> {
        self.send_with_attributes(command, MessageAttributes::default())
            .await
    }

    /// Send with explicit attributes.
    pub async fn send_with_attributes<C: Message>(
        &self,
        command: C,
        attributes: MessageAttributes,
    ) -> Result<(), BusError> {
        let plain = to_plain(&command)?;
        self.inner.emit(true, C::NAME, plain, attributes).await
    }

    /// Observe every `send`.
    pub fn on_send(
        &self,
        listener: impl Fn(&Value, &MessageAttributes) + Send + Sync + 'static,
    ) -> HookId {
        self.inner.hooks.on_send(Arc::new(listener) as MessageListener)
    }

    /// Observe every `publish`.
    pub fn on_publish(
        &self,
        listener: impl Fn(&Value, &MessageAttributes) + Send + Sync + 'static,
    ) -> HookId {
        self.inner
            .hooks
            .on_publish(Arc::new(listener) as MessageListener)
    }

    /// Observe every handler failure (optimistic-concurrency retries
    /// excepted).
    pub fn on_error(
        &self,
        listener: impl Fn(&Value, &anyhow::Error, &MessageAttributes, &TransportMessage<T::Raw>)
            + Send
            + Sync
            + 'static,
    ) -> HookId {
        self.inner
            .hooks
            .on_error(Arc::new(listener) as ErrorListener<T::Raw>)
    }

    /// Remove a `send` listener.
    pub fn off_send(&self, id: HookId) -> bool {
        self.inner.hooks.off_send(id)
    }

    /// Remove a `publish` listener.
    pub fn off_publish(&self, id: HookId) -> bool {
        self.inner.hooks.off_publish(id)
    }

    /// Remove an `error` listener.
    pub fn off_error(&self, id: HookId) -> bool {
        self.inner.hooks.off_error(id)
    }
}

async fn run_dispatch_loop<T: Transport>(inner: Arc<BusInner<T>>, shutdown: CancellationToken) {
    let concurrency = inner.concurrency as u32;
    let semaphore = Arc::new(Semaphore::new(inner.concurrency));
    info!(concurrency, "dispatch loop started");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // One permit per in-flight message; waiting here is the back-pressure.
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        tokio::select! {
            _ = shutdown.cancelled() => {
                drop(permit);
                break;
            }
            next = inner.transport.read_next() => match next {
                Ok(Some(message)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        process_message(inner, message).await;
                    });
                }
                Ok(None) => drop(permit),
                Err(error) => {
                    error!(error = %error, "failed to read from transport");
                    drop(permit);
                    tokio::time::sleep(READ_FAILURE_BACKOFF).await;
                }
            }
        }
    }

    // Reacquiring every permit means every in-flight handler has finished.
    let _ = semaphore.acquire_many(concurrency).await;
    info!("dispatch loop stopped");
}

async fn process_message<T: Transport>(inner: Arc<BusInner<T>>, message: TransportMessage<T::Raw>) {
    let plain = match inner.serializer.deserialize(&message.body) {
        Ok(plain) => plain,
        Err(error) => {
            let error = anyhow::Error::new(error);
            warn!(error = %error, "failed to decode message body");
            inner
                .hooks
                .fire_error(&Value::Null, &error, &message.attributes, &message);
            if let Err(error) = inner.transport.return_message(message).await {
                error!(error = %error, "failed to return message to transport");
            }
            return;
        }
    };

    let handlers = inner.handlers.get(message.name.as_deref(), &plain);
    if handlers.is_empty() {
        if let Err(error) = inner.transport.delete_message(message).await {
            error!(error = %error, "failed to delete unhandled message");
        }
        return;
    }

    let sink: Arc<dyn EnvelopeSink> = inner.clone();
    let sender = MessageSender::new(sink, ContextFrame::from_attributes(&message.attributes));

    let mut failure = None;
    for dispatch in handlers {
        if let Err(error) =
            dispatch(plain.clone(), message.attributes.clone(), sender.clone()).await
        {
            failure = Some(error);
            break;
        }
    }

    match failure {
        None => {
            if let Err(error) = inner.transport.delete_message(message).await {
                error!(error = %error, "failed to delete message after handling");
            }
        }
        Some(error) => {
            if is_concurrency_conflict(&error) {
                debug!(
                    message_name = message.name.as_deref().unwrap_or("<unnamed>"),
                    "optimistic concurrency conflict, returning message for retry"
                );
            } else {
                warn!(
                    message_name = message.name.as_deref().unwrap_or("<unnamed>"),
                    error = %error,
                    "handler failed, returning message"
                );
                inner
                    .hooks
                    .fire_error(&plain, &error, &message.attributes, &message);
            }
            if let Err(error) = inner.transport.return_message(message).await {
                error!(error = %error, "failed to return message to transport");
            }
        }
    }
}
