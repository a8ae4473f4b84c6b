//! Testing utilities for buses and workflows.
//!
//! Only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! switchyard = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use switchyard::testing::{wait_until, CountingHandler, FlakyHandler};
//!
//! let handler = CountingHandler::new();
//! let bus = configure()
//!     .with_transport(queue.clone())
//!     .with_handler::<TestEvent, _>(handler.clone())
//!     .initialize()
//!     .await?;
//!
//! bus.start().await?;
//! bus.publish(TestEvent { .. }).await?;
//!
//! wait_until(|| queue.depth() == 0).await;
//! assert_eq!(handler.invocation_count(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::handler::{Handler, HandlerContext};

/// Default timeout for [`wait_until`].
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll a condition until it holds, panicking after
/// [`DEFAULT_WAIT_TIMEOUT`].
///
/// The blunt instrument for "publish, then wait for the loop to settle".
pub async fn wait_until(condition: impl Fn() -> bool) {
    wait_until_timeout(condition, DEFAULT_WAIT_TIMEOUT).await
}

/// Poll a condition until it holds, panicking after `timeout`.
pub async fn wait_until_timeout(condition: impl Fn() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Handler that counts its invocations and always succeeds.
///
/// Cheap to clone; clones share the counter.
#[derive(Clone, Default)]
pub struct CountingHandler {
    invocations: Arc<AtomicUsize>,
}

impl CountingHandler {
    /// Create a handler with a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the handler has been invoked.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> Handler<M> for CountingHandler {
    async fn handle(&self, _context: HandlerContext<M>) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that fails its first `failures` invocations, then succeeds.
///
/// Cheap to clone; clones share the counter.
#[derive(Clone)]
pub struct FlakyHandler {
    failures: usize,
    invocations: Arc<AtomicUsize>,
}

impl FlakyHandler {
    /// Fail the first `failures` invocations.
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many times the handler has been invoked, failures included.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> Handler<M> for FlakyHandler {
    async fn handle(&self, _context: HandlerContext<M>) -> Result<()> {
        let attempt = self.invocations.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(anyhow!("flaky handler failing attempt {}", attempt + 1))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageAttributes;
    use crate::handler::{ContextFrame, MessageSender};
    use serde_json::Value;

    struct NullSink;

    #[async_trait]
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

    fn context() -> HandlerContext<Value> {
        HandlerContext::new(
            Value::Null,
            MessageAttributes::default(),
            MessageSender::new(Arc::new(NullSink), ContextFrame::default()),
        )
    }

    #[tokio::test]
    async fn counting_handler_counts() {
        let handler = CountingHandler::new();
        handler.handle(context()).await.unwrap();
        handler.handle(context()).await.unwrap();
        assert_eq!(handler.invocation_count(), 2);
    }

    #[tokio::test]
    async fn flaky_handler_recovers() {
        let handler = FlakyHandler::failing(1);
        assert!(handler.handle(context()).await.is_err());
        assert!(handler.handle(context()).await.is_ok());
        assert_eq!(handler.invocation_count(), 2);
    }

    #[tokio::test]
    async fn wait_until_passes_quickly() {
        wait_until(|| true).await;
    }

    #[tokio::test]
    #[should_panic(expected = "condition not met")]
    async fn wait_until_times_out() {
        wait_until_timeout(|| false, Duration::from_millis(50)).await;
    }
}
