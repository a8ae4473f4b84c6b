//! Structured error types for bus configuration and operation.
//!
//! `BusError` covers config-time and call-time failures of the bus itself.
//! Handler and step failures stay `anyhow::Error` internally - the dispatch
//! loop only needs to tell an optimistic-concurrency conflict (silent retry
//! via redelivery) apart from everything else (error hook + redelivery), and
//! does so by downcasting the chain.

use thiserror::Error;

use crate::bus::BusState;
use crate::persistence::PersistenceError;
use crate::serializer::SerializationError;
use crate::transport::TransportError;

/// Structured error type for switchyard operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The same handler is already registered for this message name.
    #[error("handler {handler} already registered for message {message_name}")]
    HandlerAlreadyRegistered {
        /// The message name the duplicate registration targeted.
        message_name: String,
        /// The handler's type name.
        handler: String,
    },

    /// An operation was attempted in a lifecycle state that does not allow it.
    #[error("cannot {operation} bus while {actual} (requires {required})")]
    LifecycleViolation {
        /// The attempted operation.
        operation: &'static str,
        /// The states the operation is legal in.
        required: &'static str,
        /// The state the bus was actually in.
        actual: BusState,
    },

    /// A workflow with this name is already registered.
    #[error("workflow {workflow_name} already registered")]
    WorkflowAlreadyRegistered {
        /// The duplicated workflow name.
        workflow_name: &'static str,
    },

    /// A workflow was registered after the registry was wired up.
    #[error("workflow {workflow_name} registered after initialization")]
    WorkflowRegisteredAfterInitialize {
        /// The late workflow's name.
        workflow_name: &'static str,
    },

    /// The workflow registry was initialized more than once.
    #[error("workflow registry already initialized")]
    WorkflowRegistryAlreadyInitialized,

    /// A `when` lookup names a field the workflow state does not have.
    #[error("lookup field {field} is not a field of workflow state {workflow_name}")]
    InvalidLookupMapping {
        /// The workflow whose definition is invalid.
        workflow_name: &'static str,
        /// The missing field.
        field: &'static str,
    },

    /// Message encode/decode failure.
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    /// Transport failure, surfaced to `publish`/`send` callers.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Persistence failure, including the optimistic-concurrency variant.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// True when the error chain bottoms out in an optimistic-concurrency
/// conflict. Conflicts are retried via redelivery and skip the error hook.
pub(crate) fn is_concurrency_conflict(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause
            .downcast_ref::<PersistenceError>()
            .map(PersistenceError::is_concurrency_conflict)
            .unwrap_or(false)
    })
}
