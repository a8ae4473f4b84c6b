//! Declarative, persistent workflows.
//!
//! A workflow is a state machine that advances by consuming messages:
//!
//! - a `started_by` message creates a new instance (fresh UUID, `Running`,
//!   version 0) and runs the initializing step against its default state;
//! - a `when` message advances existing instances: a pure lookup extracts a
//!   key from the message, and every `Running` row whose mapped state field
//!   equals that key gets the step, each against its own snapshot.
//!
//! Steps never touch live rows. They receive an owned copy of the state and
//! answer with a [`StepOutcome`]; persisting the outcome is the engine's job,
//! guarded by optimistic versioning. Losing a version race is not an error
//! for the user - the triggering message is redelivered and the step re-runs
//! against the now-current state.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Clone, Default, Serialize, Deserialize)]
//! struct Fulfilment {
//!     order_id: String,
//!     shipped: bool,
//! }
//!
//! impl WorkflowState for Fulfilment {
//!     const WORKFLOW_NAME: &'static str = "fulfilment";
//! }
//!
//! let workflow = WorkflowDefinition::<Fulfilment>::new()
//!     .started_by::<OrderPlaced, _, _>(|ctx, mut state| async move {
//!         state.order_id = ctx.message.order_id.clone();
//!         Ok(StepOutcome::Update(state))
//!     })
//!     .when::<OrderShipped, _, _>(
//!         Lookup::new(|message: &OrderShipped, _| Some(message.order_id.clone()), "order_id"),
//!         |_ctx, mut state| async move {
//!             state.shipped = true;
//!             Ok(StepOutcome::Complete(state))
//!         },
//!     );
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::core::{Message, MessageAttributes};
use crate::handler::{HandlerContext, MessageSender};
use crate::serializer::to_class;

/// User-defined workflow state.
///
/// `Default` supplies the blank state a `started_by` step initializes;
/// `Clone` backs the snapshot handed to every step.
pub trait WorkflowState:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The workflow's unique name, also its storage identity.
    const WORKFLOW_NAME: &'static str;
}

/// What a step decided about the state it was shown.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<S> {
    /// The step has nothing to record. Nothing is persisted and the version
    /// does not advance.
    Ignore,
    /// Persist the returned state; the instance stays `Running`.
    Update(S),
    /// Persist the returned state and complete the instance. Completed
    /// instances no longer match active-state lookups.
    Complete(S),
    /// Drop this step's output entirely. Nothing is persisted - the sentinel
    /// for "this delivery turned out to be irrelevant".
    Discard,
}

/// How a `when` message finds the workflow instances it advances.
///
/// `key` must be pure and side-effect-free; a `None` key means the message
/// is not associated with any instance and is ignored.
pub struct Lookup<M> {
    pub(crate) key: Arc<dyn Fn(&M, &MessageAttributes) -> Option<String> + Send + Sync>,
    pub(crate) maps_to: &'static str,
    pub(crate) include_completed: bool,
}

impl<M> Lookup<M> {
    /// Pair a key extractor with the state field it must equal.
    pub fn new(
        key: impl Fn(&M, &MessageAttributes) -> Option<String> + Send + Sync + 'static,
        maps_to: &'static str,
    ) -> Self {
        Self {
            key: Arc::new(key),
            maps_to,
            include_completed: false,
        }
    }

    /// Also match instances that have already completed.
    pub fn including_completed(mut self) -> Self {
        self.include_completed = true;
        self
    }
}

/// Future returned by a type-erased workflow step.
pub(crate) type StepFuture<S> = Pin<Box<dyn Future<Output = Result<StepOutcome<S>>> + Send>>;

/// A type-erased step: message deserialization is captured at registration,
/// the state snapshot is passed by value.
pub(crate) type StepFn<S> =
    Arc<dyn Fn(Value, MessageAttributes, MessageSender, S) -> StepFuture<S> + Send + Sync>;

/// Type-erased lookup-key extraction for a `when` registration.
pub(crate) type KeyFn = Arc<dyn Fn(Value, &MessageAttributes) -> Result<Option<String>> + Send + Sync>;

pub(crate) struct StartRegistration<S> {
    pub(crate) message_name: &'static str,
    pub(crate) run: StepFn<S>,
}

pub(crate) struct WhenRegistration<S> {
    pub(crate) message_name: &'static str,
    pub(crate) maps_to: &'static str,
    pub(crate) include_completed: bool,
    pub(crate) extract_key: KeyFn,
    pub(crate) run: StepFn<S>,
}

/// Declarative mapping from messages to workflow steps.
///
/// Immutable once registered with the bus. The workflow's name comes from
/// [`WorkflowState::WORKFLOW_NAME`] and must be unique across the
/// application.
pub struct WorkflowDefinition<S: WorkflowState> {
    pub(crate) started_by: Vec<StartRegistration<S>>,
    pub(crate) when: Vec<WhenRegistration<S>>,
}

impl<S: WorkflowState> WorkflowDefinition<S> {
    /// Start an empty definition for state type `S`.
    pub fn new() -> Self {
        Self {
            started_by: Vec::new(),
            when: Vec::new(),
        }
    }

    /// The workflow's name.
    pub fn workflow_name(&self) -> &'static str {
        S::WORKFLOW_NAME
    }

    /// A message type that creates a new instance of this workflow.
    ///
    /// The step receives the default state (the frozen blank instance) and
    /// its outcome becomes the first saved version.
    pub fn started_by<M, F, Fut>(mut self, step: F) -> Self
    where
        M: Message,
        F: Fn(HandlerContext<M>, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome<S>>> + Send + 'static,
    {
        self.started_by.push(StartRegistration {
            message_name: M::NAME,
            run: erase_step(step),
        });
        self
    }

    /// A message type that advances existing instances matched by `lookup`.
    pub fn when<M, F, Fut>(mut self, lookup: Lookup<M>, step: F) -> Self
    where
        M: Message,
        F: Fn(HandlerContext<M>, S) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepOutcome<S>>> + Send + 'static,
    {
        let key = lookup.key.clone();
        let extract_key: KeyFn = Arc::new(move |plain, attributes| {
            let message: M = to_class(plain)?;
            Ok(key(&message, attributes))
        });

        self.when.push(WhenRegistration {
            message_name: M::NAME,
            maps_to: lookup.maps_to,
            include_completed: lookup.include_completed,
            extract_key,
            run: erase_step(step),
        });
        self
    }
}

impl<S: WorkflowState> Default for WorkflowDefinition<S> {
    fn default() -> Self {
        Self::new()
    }
}

fn erase_step<S, M, F, Fut>(step: F) -> StepFn<S>
where
    S: WorkflowState,
    M: Message,
    F: Fn(HandlerContext<M>, S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome<S>>> + Send + 'static,
{
    let step = Arc::new(step);
    Arc::new(move |plain, attributes, sender, state| {
        let step = step.clone();
        Box::pin(async move {
            let message: M = to_class(plain)?;
            step(HandlerContext::new(message, attributes, sender), state).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    use crate::handler::ContextFrame;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Fulfilment {
        order_id: String,
        shipped: bool,
    }

    impl WorkflowState for Fulfilment {
        const WORKFLOW_NAME: &'static str = "fulfilment";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl Message for OrderPlaced {
        const NAME: &'static str = "orders/order-placed";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderShipped {
        order_id: Option<String>,
    }

    impl Message for OrderShipped {
        const NAME: &'static str = "orders/order-shipped";
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

    fn definition() -> WorkflowDefinition<Fulfilment> {
        WorkflowDefinition::<Fulfilment>::new()
            .started_by::<OrderPlaced, _, _>(|ctx, mut state| async move {
                state.order_id = ctx.message.order_id.clone();
                Ok(StepOutcome::Update(state))
            })
            .when::<OrderShipped, _, _>(
                Lookup::new(
                    |message: &OrderShipped, _| message.order_id.clone(),
                    "order_id",
                ),
                |_ctx, mut state| async move {
                    state.shipped = true;
                    Ok(StepOutcome::Complete(state))
                },
            )
    }

    #[test]
    fn definition_records_registrations() {
        let workflow = definition();
        assert_eq!(workflow.workflow_name(), "fulfilment");
        assert_eq!(workflow.started_by.len(), 1);
        assert_eq!(workflow.started_by[0].message_name, OrderPlaced::NAME);
        assert_eq!(workflow.when.len(), 1);
        assert_eq!(workflow.when[0].maps_to, "order_id");
        assert!(!workflow.when[0].include_completed);
    }

    #[test]
    fn lookup_can_include_completed() {
        let lookup =
            Lookup::new(|m: &OrderShipped, _| m.order_id.clone(), "order_id").including_completed();
        assert!(lookup.include_completed);
    }

    #[tokio::test]
    async fn erased_step_deserializes_and_runs() {
        let workflow = definition();
        let outcome = (workflow.started_by[0].run)(
            json!({"order_id": "ord-1"}),
            MessageAttributes::default(),
            sender(),
            Fulfilment::default(),
        )
        .await
        .unwrap();

        match outcome {
            StepOutcome::Update(state) => {
                assert_eq!(state.order_id, "ord-1");
                assert!(!state.shipped);
            }
            other => panic!("expected Update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn erased_key_extraction() {
        let workflow = definition();
        let key = (workflow.when[0].extract_key)(
            json!({"order_id": "X"}),
            &MessageAttributes::default(),
        )
        .unwrap();
        assert_eq!(key.as_deref(), Some("X"));

        let absent = (workflow.when[0].extract_key)(
            json!({"order_id": null}),
            &MessageAttributes::default(),
        )
        .unwrap();
        assert!(absent.is_none());
    }

    #[tokio::test]
    async fn step_snapshot_is_owned() {
        let workflow = definition();
        let original = Fulfilment {
            order_id: "X".into(),
            shipped: false,
        };

        let outcome = (workflow.when[0].run)(
            json!({"order_id": "X"}),
            MessageAttributes::default(),
            sender(),
            original.clone(),
        )
        .await
        .unwrap();

        // The step mutated its copy; the caller's value is untouched.
        assert!(!original.shipped);
        assert!(matches!(outcome, StepOutcome::Complete(state) if state.shipped));
    }
}
