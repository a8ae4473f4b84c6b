//! Bus hooks: observe sends, publishes, and handler failures.
//!
//! A plain multi-listener observer. Listeners fire synchronously, in
//! registration order, on the task performing the triggering operation -
//! before the transport call for `send`/`publish`, after the handler result
//! for `error`. There is no error isolation: a panicking listener fails the
//! operation that fired it.
//!
//! The listener list may change at any time. A firing works against a
//! snapshot, so listeners registered during a firing are not invoked for
//! that firing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::core::{MessageAttributes, TransportMessage};

/// Token returned by hook registration, used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Listener for `send` and `publish` hooks: `(plain message, attributes)`.
pub type MessageListener = Arc<dyn Fn(&Value, &MessageAttributes) + Send + Sync>;

/// Listener for the `error` hook:
/// `(plain message, error, attributes, transport message)`.
pub type ErrorListener<R> =
    Arc<dyn Fn(&Value, &anyhow::Error, &MessageAttributes, &TransportMessage<R>) + Send + Sync>;

pub(crate) struct HookRegistry<R> {
    next_id: AtomicU64,
    send: RwLock<Vec<(HookId, MessageListener)>>,
    publish: RwLock<Vec<(HookId, MessageListener)>>,
    error: RwLock<Vec<(HookId, ErrorListener<R>)>>,
}

impl<R> Default for HookRegistry<R> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            send: RwLock::new(Vec::new()),
            publish: RwLock::new(Vec::new()),
            error: RwLock::new(Vec::new()),
        }
    }
}

impl<R> HookRegistry<R> {
    fn next_id(&self) -> HookId {
        HookId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn on_send(&self, listener: MessageListener) -> HookId {
        let id = self.next_id();
        self.send
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub(crate) fn on_publish(&self, listener: MessageListener) -> HookId {
        let id = self.next_id();
        self.publish
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub(crate) fn on_error(&self, listener: ErrorListener<R>) -> HookId {
        let id = self.next_id();
        self.error
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub(crate) fn off_send(&self, id: HookId) -> bool {
        let mut listeners = self.send.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn off_publish(&self, id: HookId) -> bool {
        let mut listeners = self.publish.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn off_error(&self, id: HookId) -> bool {
        let mut listeners = self.error.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn fire_send(&self, plain: &Value, attributes: &MessageAttributes) {
        let snapshot: Vec<MessageListener> = self
            .send
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(plain, attributes);
        }
    }

    pub(crate) fn fire_publish(&self, plain: &Value, attributes: &MessageAttributes) {
        let snapshot: Vec<MessageListener> = self
            .publish
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(plain, attributes);
        }
    }

    pub(crate) fn fire_error(
        &self,
        plain: &Value,
        error: &anyhow::Error,
        attributes: &MessageAttributes,
        message: &TransportMessage<R>,
    ) {
        let snapshot: Vec<ErrorListener<R>> = self
            .error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener(plain, error, attributes, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn registry() -> HookRegistry<()> {
        HookRegistry::default()
    }

    #[test]
    fn send_listener_fires_in_order() {
        let hooks = registry();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = order.clone();
        hooks.on_send(Arc::new(move |_, _| first.lock().unwrap().push(1)));
        let second = order.clone();
        hooks.on_send(Arc::new(move |_, _| second.lock().unwrap().push(2)));

        hooks.fire_send(&json!({}), &MessageAttributes::default());
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn removed_listener_does_not_fire() {
        let hooks = registry();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        let id = hooks.on_send(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        hooks.fire_send(&json!({}), &MessageAttributes::default());
        assert!(hooks.off_send(id));
        hooks.fire_send(&json!({}), &MessageAttributes::default());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Removing twice is a no-op.
        assert!(!hooks.off_send(id));
    }

    #[test]
    fn hook_kinds_are_independent() {
        let hooks = registry();
        let sends = Arc::new(AtomicUsize::new(0));
        let publishes = Arc::new(AtomicUsize::new(0));

        let send_counter = sends.clone();
        hooks.on_send(Arc::new(move |_, _| {
            send_counter.fetch_add(1, Ordering::SeqCst);
        }));
        let publish_counter = publishes.clone();
        hooks.on_publish(Arc::new(move |_, _| {
            publish_counter.fetch_add(1, Ordering::SeqCst);
        }));

        hooks.fire_publish(&json!({}), &MessageAttributes::default());
        assert_eq!(sends.load(Ordering::SeqCst), 0);
        assert_eq!(publishes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_listener_receives_the_report() {
        let hooks = registry();
        let seen = Arc::new(std::sync::Mutex::new(None));

        let sink = seen.clone();
        hooks.on_error(Arc::new(move |plain, error, attributes, _message| {
            *sink.lock().unwrap() = Some((
                plain.clone(),
                error.to_string(),
                attributes.correlation_id.clone(),
            ));
        }));

        let message = TransportMessage {
            id: None,
            name: Some("test/event".into()),
            body: "{}".into(),
            attributes: MessageAttributes::default(),
            enqueued_at: chrono::Utc::now(),
            raw: (),
        };
        hooks.fire_error(
            &json!({"value": 1}),
            &anyhow::anyhow!("handler exploded"),
            &MessageAttributes::with_correlation_id("c-1"),
            &message,
        );

        let report = seen.lock().unwrap().take().unwrap();
        assert_eq!(report.0, json!({"value": 1}));
        assert!(report.1.contains("exploded"));
        assert_eq!(report.2.as_deref(), Some("c-1"));
    }

    #[test]
    fn listener_added_during_firing_misses_that_firing() {
        let hooks = Arc::new(registry());
        let late_fired = Arc::new(AtomicUsize::new(0));

        let hooks_inner = hooks.clone();
        let late = late_fired.clone();
        hooks.on_send(Arc::new(move |_, _| {
            let late = late.clone();
            hooks_inner.on_send(Arc::new(move |_, _| {
                late.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        hooks.fire_send(&json!({}), &MessageAttributes::default());
        assert_eq!(late_fired.load(Ordering::SeqCst), 0);

        hooks.fire_send(&json!({}), &MessageAttributes::default());
        assert_eq!(late_fired.load(Ordering::SeqCst), 1);
    }
}
