//! Workflow state persistence.
//!
//! # The contract
//!
//! 1. **Load before step.** For every message routed to a workflow, the
//!    engine loads the matching rows (or creates a fresh one for a starting
//!    message).
//!
//! 2. **Snapshot in, outcome out.** The step sees an owned copy of the state;
//!    the row it came from is never shared.
//!
//! 3. **Optimistic save.** Every save carries the version the state was
//!    loaded at. A concurrent writer having advanced the row surfaces as
//!    [`PersistenceError::WorkflowStateNotFound`] - the distinction from a
//!    backend failure is load-bearing: a conflict means *retry with fresh
//!    state via redelivery*, a backend error means *storage is broken*.
//!
//! # Row layout
//!
//! The reference relational layout is `id UUID PRIMARY KEY, version INTEGER,
//! status TEXT, data JSONB`, with a secondary index on `data->>field` for
//! each field named by a workflow lookup. The `(id, version)` predicate
//! drives the optimistic update.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Errors from workflow state storage.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The row was not at the expected version when saving - another writer
    /// advanced it concurrently. Expected under concurrency; the triggering
    /// message is redelivered and re-runs against fresh state.
    #[error(
        "workflow state {workflow_id} of {workflow_name} not found at version {version}"
    )]
    WorkflowStateNotFound {
        /// The workflow instance id.
        workflow_id: Uuid,
        /// The workflow the row belongs to.
        workflow_name: String,
        /// The version the save expected to find.
        version: u64,
    },

    /// Persistence was used without being configured on the bus.
    #[error("persistence has not been configured on this bus")]
    NotConfigured,

    /// The storage backend failed (connection, timeout, serialization).
    #[error("persistence backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl PersistenceError {
    /// True for the optimistic-concurrency variant, which is retried via
    /// message redelivery rather than reported through the error hook.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, PersistenceError::WorkflowStateNotFound { .. })
    }
}

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// The instance is live and participates in active-state lookups.
    Running,
    /// A step completed the instance; it is excluded from active lookups but
    /// never deleted.
    Complete,
}

impl WorkflowStatus {
    /// Stable storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Complete => "complete",
        }
    }
}

/// A persisted workflow instance.
///
/// `version` is 0 before the first save and increments by exactly one per
/// successful save. `data` holds the serialized user-defined state fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRow {
    /// Instance id, assigned on creation, immutable.
    pub id: Uuid,
    /// The owning workflow's name, immutable.
    pub workflow_name: String,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Version the state was loaded at (0 for a row that has never been
    /// saved). `save_workflow_state` stores `version + 1`.
    pub version: u64,
    /// Serialized user state.
    pub data: Value,
}

/// Storage description for one workflow, handed to the backend at
/// initialization so it can create tables and indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSchema {
    /// The workflow's unique name.
    pub workflow_name: String,
    /// Fields named by `maps_to` lookups; each must be efficiently queryable.
    pub mapped_fields: Vec<String>,
}

/// A workflow state storage backend.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Optional startup hook.
    async fn initialize(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Optional shutdown hook.
    async fn dispose(&self) -> Result<(), PersistenceError> {
        Ok(())
    }

    /// Ensure storage exists for this workflow and that each mapped field is
    /// efficiently queryable.
    async fn initialize_workflow(&self, schema: &WorkflowSchema) -> Result<(), PersistenceError>;

    /// Load all rows of `workflow_name` where the mapped `field` of the
    /// stored data equals `key`. Excludes `Complete` rows unless
    /// `include_completed` is set.
    ///
    /// The engine never calls this with a falsy key - a message whose lookup
    /// produces no key is not associated with any instance.
    async fn get_workflow_state(
        &self,
        workflow_name: &str,
        field: &str,
        key: &str,
        include_completed: bool,
    ) -> Result<Vec<WorkflowRow>, PersistenceError>;

    /// Upsert a row with optimistic concurrency control.
    ///
    /// `row.version == 0` ⇒ insert with version 1. Otherwise update
    /// `WHERE id = row.id AND version = row.version`, storing
    /// `row.version + 1`. Zero affected rows ⇒
    /// [`PersistenceError::WorkflowStateNotFound`].
    ///
    /// Returns the stored version.
    async fn save_workflow_state(&self, row: &WorkflowRow) -> Result<u64, PersistenceError>;
}

// Also implemented for Arc<P> so a store can be shared with test code that
// keeps its own handle for assertions.
#[async_trait]
impl<P: Persistence> Persistence for std::sync::Arc<P> {
    async fn initialize(&self) -> Result<(), PersistenceError> {
        (**self).initialize().await
    }

    async fn dispose(&self) -> Result<(), PersistenceError> {
        (**self).dispose().await
    }

    async fn initialize_workflow(&self, schema: &WorkflowSchema) -> Result<(), PersistenceError> {
        (**self).initialize_workflow(schema).await
    }

    async fn get_workflow_state(
        &self,
        workflow_name: &str,
        field: &str,
        key: &str,
        include_completed: bool,
    ) -> Result<Vec<WorkflowRow>, PersistenceError> {
        (**self)
            .get_workflow_state(workflow_name, field, key, include_completed)
            .await
    }

    async fn save_workflow_state(&self, row: &WorkflowRow) -> Result<u64, PersistenceError> {
        (**self).save_workflow_state(row).await
    }
}

/// Compare a stored data field against a lookup key.
///
/// Keys are strings on the engine side; stored fields may be strings,
/// numbers, or booleans.
pub(crate) fn field_matches(value: &Value, key: &str) -> bool {
    match value {
        Value::String(s) => s == key,
        Value::Number(n) => n.to_string() == key,
        Value::Bool(b) => b.to_string() == key,
        _ => false,
    }
}

/// In-memory workflow persistence, non-durable, for tests and prototyping.
#[derive(Default)]
pub struct InMemoryPersistence {
    rows: Mutex<HashMap<Uuid, WorkflowRow>>,
}

impl InMemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a single row by instance id, for test assertions.
    pub fn row(&self, id: Uuid) -> Option<WorkflowRow> {
        self.lock().get(&id).cloned()
    }

    /// All stored rows across all workflows, for test assertions.
    pub fn rows(&self) -> Vec<WorkflowRow> {
        self.lock().values().cloned().collect()
    }

    /// Number of stored rows across all workflows.
    pub fn row_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, WorkflowRow>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn initialize_workflow(&self, _schema: &WorkflowSchema) -> Result<(), PersistenceError> {
        // A HashMap needs no tables or indexes.
        Ok(())
    }

    async fn get_workflow_state(
        &self,
        workflow_name: &str,
        field: &str,
        key: &str,
        include_completed: bool,
    ) -> Result<Vec<WorkflowRow>, PersistenceError> {
        let rows = self.lock();
        Ok(rows
            .values()
            .filter(|row| row.workflow_name == workflow_name)
            .filter(|row| include_completed || row.status == WorkflowStatus::Running)
            .filter(|row| {
                row.data
                    .get(field)
                    .map(|value| field_matches(value, key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn save_workflow_state(&self, row: &WorkflowRow) -> Result<u64, PersistenceError> {
        let mut rows = self.lock();
        let current = rows.get(&row.id).map(|existing| existing.version).unwrap_or(0);

        if current != row.version {
            return Err(PersistenceError::WorkflowStateNotFound {
                workflow_id: row.id,
                workflow_name: row.workflow_name.clone(),
                version: row.version,
            });
        }

        let stored_version = row.version + 1;
        rows.insert(
            row.id,
            WorkflowRow {
                version: stored_version,
                ..row.clone()
            },
        );
        Ok(stored_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: Uuid, version: u64, order_id: &str) -> WorkflowRow {
        WorkflowRow {
            id,
            workflow_name: "fulfilment".into(),
            status: WorkflowStatus::Running,
            version,
            data: json!({ "order_id": order_id, "shipped": false }),
        }
    }

    #[tokio::test]
    async fn first_save_stores_version_one() {
        let store = InMemoryPersistence::new();
        let id = Uuid::new_v4();

        let version = store.save_workflow_state(&row(id, 0, "X")).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(store.row(id).unwrap().version, 1);
    }

    #[tokio::test]
    async fn stale_save_is_a_conflict() {
        let store = InMemoryPersistence::new();
        let id = Uuid::new_v4();

        store.save_workflow_state(&row(id, 0, "X")).await.unwrap();

        let err = store.save_workflow_state(&row(id, 0, "X")).await.unwrap_err();
        assert!(err.is_concurrency_conflict());
        assert!(matches!(
            err,
            PersistenceError::WorkflowStateNotFound { workflow_id, version: 0, .. }
                if workflow_id == id
        ));

        // Saving at the current version succeeds.
        let version = store.save_workflow_state(&row(id, 1, "X")).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn lookup_filters_by_field_and_status() {
        let store = InMemoryPersistence::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        store.save_workflow_state(&row(a, 0, "X")).await.unwrap();
        store.save_workflow_state(&row(b, 0, "X")).await.unwrap();
        store.save_workflow_state(&row(c, 0, "Y")).await.unwrap();

        let matched = store
            .get_workflow_state("fulfilment", "order_id", "X", false)
            .await
            .unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|r| r.data["order_id"] == "X"));
    }

    #[tokio::test]
    async fn completed_rows_are_excluded_unless_requested() {
        let store = InMemoryPersistence::new();
        let id = Uuid::new_v4();

        let mut completed = row(id, 0, "X");
        completed.status = WorkflowStatus::Complete;
        store.save_workflow_state(&completed).await.unwrap();

        let active = store
            .get_workflow_state("fulfilment", "order_id", "X", false)
            .await
            .unwrap();
        assert!(active.is_empty());

        let all = store
            .get_workflow_state("fulfilment", "order_id", "X", true)
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn lookup_matches_numeric_fields_as_strings() {
        let store = InMemoryPersistence::new();
        let id = Uuid::new_v4();
        let numeric = WorkflowRow {
            data: json!({ "order_id": 42 }),
            ..row(id, 0, "ignored")
        };
        store.save_workflow_state(&numeric).await.unwrap();

        let matched = store
            .get_workflow_state("fulfilment", "order_id", "42", false)
            .await
            .unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[tokio::test]
    async fn other_workflows_are_invisible() {
        let store = InMemoryPersistence::new();
        store.save_workflow_state(&row(Uuid::new_v4(), 0, "X")).await.unwrap();

        let matched = store
            .get_workflow_state("some-other-workflow", "order_id", "X", false)
            .await
            .unwrap();
        assert!(matched.is_empty());
    }

    #[test]
    fn status_storage_representation() {
        assert_eq!(WorkflowStatus::Running.as_str(), "running");
        assert_eq!(WorkflowStatus::Complete.as_str(), "complete");
    }
}
