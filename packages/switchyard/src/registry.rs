//! Handler registry: maps message names to handlers.
//!
//! Registration captures a typed deserializer in a boxed closure, so the
//! registry itself is type-erased: it stores `Fn(plain value, attributes,
//! sender) -> Future` and never sees concrete message types. The dispatch
//! loop resolves a leased message to its handlers in one call.
//!
//! Two routing paths exist:
//! - **name-keyed**: messages authored against this bus carry a wire name;
//!   handlers registered for that name run in registration order.
//! - **resolvers**: external messages arrive without a recognized name; a
//!   resolver is a predicate over the plain payload that claims such
//!   messages for its handler. Resolvers run after keyed handlers, in
//!   registration order.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::core::{Message, MessageAttributes};
use crate::error::BusError;
use crate::handler::{Handler, HandlerContext, MessageSender};
use crate::serializer::to_class;

/// Future returned by a type-erased handler invocation.
pub(crate) type DispatchFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A type-erased handler: deserialization is captured at registration.
pub(crate) type DispatchFn =
    Arc<dyn Fn(Value, MessageAttributes, MessageSender) -> DispatchFuture + Send + Sync>;

/// Predicate over the plain payload of an external message.
pub(crate) type ResolverFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct Registration {
    handler_type: String,
    dispatch: DispatchFn,
}

struct ResolverRegistration {
    handler_type: String,
    resolves_with: ResolverFn,
    #[allow(dead_code)]
    topic_identifier: Option<String>,
    dispatch: DispatchFn,
}

/// Maps message names (and resolver predicates) to handlers.
///
/// Mutated only while the bus is being configured; the bus core freezes it
/// behind an `Arc` at initialization.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Registration>>,
    resolvers: Vec<ResolverRegistration>,
    unhandled: DashSet<String>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a named message type.
    ///
    /// Fails with [`BusError::HandlerAlreadyRegistered`] if a handler of the
    /// same type is already registered for this name.
    pub fn register<M, H>(&mut self, handler: H) -> Result<(), BusError>
    where
        M: Message,
        H: Handler<M>,
    {
        self.register_dispatch(
            M::NAME,
            type_name::<H>().to_string(),
            make_dispatch::<M, H>(handler),
        )
    }

    /// Register a handler for external messages, claimed by a resolver
    /// predicate over the plain payload.
    ///
    /// `M` is the shape to deserialize the payload into; use
    /// `serde_json::Value` to receive it raw.
    pub fn register_resolver<M, H>(
        &mut self,
        handler: H,
        resolves_with: impl Fn(&Value) -> bool + Send + Sync + 'static,
        topic_identifier: Option<String>,
    ) -> Result<(), BusError>
    where
        M: DeserializeOwned + Send + Sync + 'static,
        H: Handler<M>,
    {
        let handler_type = type_name::<H>().to_string();
        if self
            .resolvers
            .iter()
            .any(|existing| existing.handler_type == handler_type)
        {
            return Err(BusError::HandlerAlreadyRegistered {
                message_name: topic_identifier.unwrap_or_else(|| "<resolver>".to_string()),
                handler: handler_type,
            });
        }

        self.resolvers.push(ResolverRegistration {
            handler_type,
            resolves_with: Arc::new(resolves_with),
            topic_identifier,
            dispatch: make_dispatch::<M, H>(handler),
        });
        Ok(())
    }

    /// Register a pre-erased handler under a name. Used by the workflow
    /// registry, whose handlers are synthesized rather than user types.
    pub(crate) fn register_dispatch(
        &mut self,
        message_name: &str,
        handler_type: String,
        dispatch: DispatchFn,
    ) -> Result<(), BusError> {
        let registrations = self.handlers.entry(message_name.to_string()).or_default();
        if registrations
            .iter()
            .any(|existing| existing.handler_type == handler_type)
        {
            return Err(BusError::HandlerAlreadyRegistered {
                message_name: message_name.to_string(),
                handler: handler_type,
            });
        }

        registrations.push(Registration {
            handler_type,
            dispatch,
        });
        Ok(())
    }

    /// Resolve a leased message to its handlers: name-keyed handlers first,
    /// then resolvers whose predicate accepts the payload, each in
    /// registration order.
    ///
    /// A named message that resolves to nothing is logged once per name.
    pub(crate) fn get(&self, name: Option<&str>, plain: &Value) -> Vec<DispatchFn> {
        let mut matched = Vec::new();

        if let Some(name) = name {
            if let Some(registrations) = self.handlers.get(name) {
                matched.extend(registrations.iter().map(|r| r.dispatch.clone()));
            }
        }

        matched.extend(
            self.resolvers
                .iter()
                .filter(|r| (r.resolves_with)(plain))
                .map(|r| r.dispatch.clone()),
        );

        if matched.is_empty() {
            if let Some(name) = name {
                if self.unhandled.insert(name.to_string()) {
                    warn!(message_name = %name, "no handlers registered for message");
                }
            }
        }

        matched
    }

    /// All registered message names.
    pub fn message_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Whether any handler is registered for this message name.
    pub fn is_registered(&self, message_name: &str) -> bool {
        self.handlers.contains_key(message_name)
    }

    /// Clear all registrations and diagnostics. For tests.
    pub fn reset(&mut self) {
        self.handlers.clear();
        self.resolvers.clear();
        self.unhandled.clear();
    }
}

fn make_dispatch<M, H>(handler: H) -> DispatchFn
where
    M: DeserializeOwned + Send + Sync + 'static,
    H: Handler<M>,
{
    let handler = Arc::new(handler);
    Arc::new(move |plain, attributes, sender| {
        let handler = handler.clone();
        Box::pin(async move {
            let message: M = to_class(plain)?;
            handler
                .handle(HandlerContext::new(message, attributes, sender))
                .await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::handler::ContextFrame;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestEvent {
        value: i32,
    }

    impl Message for TestEvent {
        const NAME: &'static str = "test/test-event";
    }

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Handler<TestEvent> for CountingHandler {
        async fn handle(&self, _context: HandlerContext<TestEvent>) -> Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl crate::handler::EnvelopeSink for NullSink {
        async fn publish_plain(
            &self,
            _name: &str,
            _plain: Value,
            _attributes: MessageAttributes,
        ) -> Result<()> {
            Ok(())
        }

        async fn send_plain(
            &self,
            _name: &str,
            _plain: Value,
            _attributes: MessageAttributes,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn sender() -> MessageSender {
        MessageSender::new(Arc::new(NullSink), ContextFrame::default())
    }

    #[test]
    fn registered_handler_is_resolvable() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<TestEvent, _>(CountingHandler {
                count: Arc::new(AtomicUsize::new(0)),
            })
            .unwrap();

        assert!(registry.is_registered(TestEvent::NAME));
        assert_eq!(registry.message_names(), vec![TestEvent::NAME.to_string()]);

        let matched = registry.get(Some(TestEvent::NAME), &json!({"value": 1}));
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn duplicate_handler_type_fails() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register::<TestEvent, _>(CountingHandler {
                count: count.clone(),
            })
            .unwrap();

        let err = registry
            .register::<TestEvent, _>(CountingHandler { count })
            .unwrap_err();
        assert!(matches!(err, BusError::HandlerAlreadyRegistered { .. }));
    }

    #[test]
    fn distinct_handlers_share_a_name() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register::<TestEvent, _>(CountingHandler {
                count: count.clone(),
            })
            .unwrap();

        let other_count = count.clone();
        registry
            .register::<TestEvent, _>(crate::handler::handler_fn(
                move |_ctx: HandlerContext<TestEvent>| {
                    let count = other_count.clone();
                    async move {
                        count.fetch_add(10, Ordering::SeqCst);
                        Ok(())
                    }
                },
            ))
            .unwrap();

        let matched = registry.get(Some(TestEvent::NAME), &json!({"value": 1}));
        assert_eq!(matched.len(), 2);
    }

    #[tokio::test]
    async fn dispatch_deserializes_and_invokes() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register::<TestEvent, _>(CountingHandler {
                count: count.clone(),
            })
            .unwrap();

        let matched = registry.get(Some(TestEvent::NAME), &json!({"value": 7}));
        matched[0](json!({"value": 7}), MessageAttributes::default(), sender())
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolver_claims_unnamed_messages() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler_count = count.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register_resolver::<Value, _>(
                crate::handler::handler_fn(move |_ctx: HandlerContext<Value>| {
                    let count = handler_count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                |plain| plain.get("kind").and_then(Value::as_str) == Some("alien"),
                Some("external-topic".to_string()),
            )
            .unwrap();

        let matched = registry.get(None, &json!({"kind": "alien"}));
        assert_eq!(matched.len(), 1);

        let unmatched = registry.get(None, &json!({"kind": "familiar"}));
        assert!(unmatched.is_empty());
    }

    #[test]
    fn keyed_handlers_come_before_resolvers() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<TestEvent, _>(crate::handler::handler_fn(
                |_ctx: HandlerContext<TestEvent>| async move { Ok(()) },
            ))
            .unwrap();
        registry
            .register_resolver::<Value, _>(
                crate::handler::handler_fn(|_ctx: HandlerContext<Value>| async move { Ok(()) }),
                |_plain| true,
                None,
            )
            .unwrap();

        // A named message that also satisfies the resolver matches both,
        // keyed first.
        let matched = registry.get(Some(TestEvent::NAME), &json!({"value": 1}));
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn unmatched_named_message_is_recorded_once() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(Some("nobody/home"), &json!({})).is_empty());
        // Second resolution hits the diagnostic set instead of logging again.
        assert!(registry.get(Some("nobody/home"), &json!({})).is_empty());
        assert_eq!(registry.unhandled.len(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut registry = HandlerRegistry::new();
        registry
            .register::<TestEvent, _>(crate::handler::handler_fn(
                |_ctx: HandlerContext<TestEvent>| async move { Ok(()) },
            ))
            .unwrap();
        registry.get(Some("nobody/home"), &json!({}));

        registry.reset();
        assert!(registry.message_names().is_empty());
        assert!(!registry.is_registered(TestEvent::NAME));
        assert_eq!(registry.unhandled.len(), 0);
    }
}
