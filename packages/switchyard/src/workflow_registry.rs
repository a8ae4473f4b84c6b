//! Binds workflow definitions into the handler registry.
//!
//! Definitions are buffered at configuration time and wired up exactly once
//! during bus initialization. Wiring a definition means synthesizing one bus
//! handler per `started_by`/`when` registration:
//!
//! - a `started_by` handler mints a fresh instance id, runs the initializer
//!   step against the default state, and persists the outcome at version 0;
//! - a `when` handler extracts the lookup key, loads every matching active
//!   row, and dispatches each through the step runner concurrently. Any
//!   failure propagates so the bus returns the triggering message to the
//!   transport.
//!
//! Version conflicts during save are the sole concurrency control: the loser
//! propagates, the message is redelivered, and the step re-runs against the
//! row's current version.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::BusError;
use crate::persistence::{Persistence, WorkflowRow, WorkflowSchema, WorkflowStatus};
use crate::registry::{DispatchFn, HandlerRegistry};
use crate::serializer::{to_class, to_plain};
use crate::workflow::{StepOutcome, WorkflowDefinition, WorkflowState};

/// Type-erased view of a [`WorkflowDefinition`], so definitions over
/// different state types share one buffer.
pub(crate) trait WorkflowBinding: Send + Sync {
    fn workflow_name(&self) -> &'static str;

    /// Storage description for the persistence backend.
    fn schema(&self) -> WorkflowSchema;

    /// Check the definition against the state type (every `maps_to` must
    /// name a real field).
    fn validate(&self) -> Result<(), BusError>;

    /// Synthesize bus handlers for every registration and install them.
    fn install(
        &self,
        handlers: &mut HandlerRegistry,
        persistence: Arc<dyn Persistence>,
    ) -> Result<(), BusError>;
}

impl<S: WorkflowState> WorkflowBinding for WorkflowDefinition<S> {
    fn workflow_name(&self) -> &'static str {
        S::WORKFLOW_NAME
    }

    fn schema(&self) -> WorkflowSchema {
        let mut mapped_fields: Vec<String> = Vec::new();
        for registration in &self.when {
            let field = registration.maps_to.to_string();
            if !mapped_fields.contains(&field) {
                mapped_fields.push(field);
            }
        }
        WorkflowSchema {
            workflow_name: S::WORKFLOW_NAME.to_string(),
            mapped_fields,
        }
    }

    fn validate(&self) -> Result<(), BusError> {
        let blank = to_plain(&S::default()).map_err(BusError::Serialization)?;
        for registration in &self.when {
            let present = blank
                .as_object()
                .map(|fields| fields.contains_key(registration.maps_to))
                .unwrap_or(false);
            if !present {
                return Err(BusError::InvalidLookupMapping {
                    workflow_name: S::WORKFLOW_NAME,
                    field: registration.maps_to,
                });
            }
        }
        Ok(())
    }

    fn install(
        &self,
        handlers: &mut HandlerRegistry,
        persistence: Arc<dyn Persistence>,
    ) -> Result<(), BusError> {
        for registration in &self.started_by {
            let run = registration.run.clone();
            let persistence = persistence.clone();

            let dispatch: DispatchFn = Arc::new(move |plain, attributes, sender| {
                let run = run.clone();
                let persistence = persistence.clone();
                Box::pin(async move {
                    let workflow_id = Uuid::new_v4();
                    let outcome = run(plain, attributes, sender, S::default()).await?;
                    persist_outcome::<S>(&persistence, workflow_id, 0, outcome).await
                })
            });

            handlers.register_dispatch(
                registration.message_name,
                format!(
                    "workflow/{}/started_by/{}",
                    S::WORKFLOW_NAME,
                    registration.message_name
                ),
                dispatch,
            )?;
        }

        for registration in &self.when {
            let run = registration.run.clone();
            let extract_key = registration.extract_key.clone();
            let maps_to = registration.maps_to;
            let include_completed = registration.include_completed;
            let message_name = registration.message_name;
            let persistence = persistence.clone();

            let dispatch: DispatchFn = Arc::new(move |plain, attributes, sender| {
                let run = run.clone();
                let extract_key = extract_key.clone();
                let persistence = persistence.clone();
                Box::pin(async move {
                    let key = match extract_key(plain.clone(), &attributes)? {
                        Some(key) => key,
                        None => {
                            trace!(
                                workflow = S::WORKFLOW_NAME,
                                message_name,
                                "lookup produced no key, ignoring message"
                            );
                            return Ok(());
                        }
                    };

                    let rows = persistence
                        .get_workflow_state(S::WORKFLOW_NAME, maps_to, &key, include_completed)
                        .await?;
                    if rows.is_empty() {
                        debug!(
                            workflow = S::WORKFLOW_NAME,
                            message_name,
                            key = %key,
                            "no matching workflow instances"
                        );
                        return Ok(());
                    }

                    let dispatches = rows.into_iter().map(|row| {
                        let run = run.clone();
                        let persistence = persistence.clone();
                        let plain = plain.clone();
                        let attributes = attributes.clone();
                        let sender = sender.clone();
                        async move {
                            let snapshot: S = to_class(row.data.clone())?;
                            let outcome = run(plain, attributes, sender, snapshot).await?;
                            persist_outcome::<S>(&persistence, row.id, row.version, outcome).await
                        }
                    });

                    for result in join_all(dispatches).await {
                        result?;
                    }
                    Ok(())
                })
            });

            handlers.register_dispatch(
                message_name,
                format!("workflow/{}/when/{}", S::WORKFLOW_NAME, message_name),
                dispatch,
            )?;
        }

        Ok(())
    }
}

/// The step dispatcher's write half: turn a [`StepOutcome`] into a persisted
/// row (or deliberately nothing).
async fn persist_outcome<S: WorkflowState>(
    persistence: &Arc<dyn Persistence>,
    workflow_id: Uuid,
    version: u64,
    outcome: StepOutcome<S>,
) -> Result<()> {
    let (state, status) = match outcome {
        StepOutcome::Ignore => {
            trace!(
                workflow = S::WORKFLOW_NAME,
                %workflow_id,
                "step produced no state change"
            );
            return Ok(());
        }
        StepOutcome::Discard => {
            debug!(
                workflow = S::WORKFLOW_NAME,
                %workflow_id,
                "discarding step output"
            );
            return Ok(());
        }
        StepOutcome::Update(state) => (state, WorkflowStatus::Running),
        StepOutcome::Complete(state) => (state, WorkflowStatus::Complete),
    };

    let row = WorkflowRow {
        id: workflow_id,
        workflow_name: S::WORKFLOW_NAME.to_string(),
        status,
        version,
        data: to_plain(&state)?,
    };

    match persistence.save_workflow_state(&row).await {
        Ok(stored_version) => {
            debug!(
                workflow = S::WORKFLOW_NAME,
                %workflow_id,
                version = stored_version,
                "persisted workflow state"
            );
            Ok(())
        }
        Err(error) => {
            warn!(
                workflow = S::WORKFLOW_NAME,
                %workflow_id,
                error = %error,
                "failed to persist workflow state"
            );
            Err(error.into())
        }
    }
}

/// Buffers workflow definitions until the bus wires them up.
///
/// Process-lifetime rules: all registration happens before `initialize`,
/// `initialize` runs exactly once, and the buffer is consumed by it.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: Vec<Box<dyn WorkflowBinding>>,
    initialized: bool,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any workflows are registered.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Buffer a workflow definition for wire-up.
    pub fn register<S: WorkflowState>(
        &mut self,
        workflow: WorkflowDefinition<S>,
    ) -> Result<(), BusError> {
        if self.initialized {
            return Err(BusError::WorkflowRegisteredAfterInitialize {
                workflow_name: S::WORKFLOW_NAME,
            });
        }
        if self
            .definitions
            .iter()
            .any(|existing| existing.workflow_name() == S::WORKFLOW_NAME)
        {
            return Err(BusError::WorkflowAlreadyRegistered {
                workflow_name: S::WORKFLOW_NAME,
            });
        }

        let binding: Box<dyn WorkflowBinding> = Box::new(workflow);
        binding.validate()?;
        self.definitions.push(binding);
        Ok(())
    }

    /// Wire every buffered definition into the handler registry and
    /// persistence backend. Consumes the buffer; callable once.
    pub(crate) async fn initialize(
        &mut self,
        handlers: &mut HandlerRegistry,
        persistence: Arc<dyn Persistence>,
    ) -> Result<(), BusError> {
        if self.initialized {
            return Err(BusError::WorkflowRegistryAlreadyInitialized);
        }
        self.initialized = true;

        for binding in std::mem::take(&mut self.definitions) {
            persistence.initialize_workflow(&binding.schema()).await?;
            binding.install(handlers, persistence.clone())?;
        }
        Ok(())
    }
}
