//! PostgreSQL workflow persistence for switchyard.
//!
//! The reference durable backend. Each workflow gets its own table:
//!
//! ```sql
//! CREATE TABLE switchyard_<workflow> (
//!     id      UUID PRIMARY KEY,
//!     version INTEGER NOT NULL,
//!     status  TEXT NOT NULL,
//!     data    JSONB NOT NULL
//! );
//! ```
//!
//! plus an expression index on `data->>field` for every field named by a
//! `when` lookup, so active-state queries stay indexed. Saves are guarded by
//! the `(id, version)` predicate: a zero-row update means another writer
//! advanced the row, surfaced as
//! [`PersistenceError::WorkflowStateNotFound`].
//!
//! ```ignore
//! let pool = PgPoolOptions::new()
//!     .max_connections(5)
//!     .connect(&database_url)
//!     .await?;
//!
//! let bus = configure()
//!     .with_transport(transport)
//!     .with_persistence(PostgresPersistence::new(pool))
//!     .with_workflow(fulfilment_workflow())
//!     .initialize()
//!     .await?;
//! ```

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use switchyard::{Persistence, PersistenceError, WorkflowRow, WorkflowSchema, WorkflowStatus};

/// PostgreSQL-backed workflow persistence.
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a backend over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Derive the table name for a workflow.
///
/// Workflow names and mapped fields are Rust identifiers or slugs authored
/// in code, never user input; anything outside `[a-z0-9_]` is rejected
/// rather than quoted, since it would have to be interpolated into DDL.
fn table_name(workflow_name: &str) -> Result<String, PersistenceError> {
    let sanitized = identifier(workflow_name, "workflow name")?;
    Ok(format!("switchyard_{sanitized}"))
}

fn identifier(raw: &str, what: &str) -> Result<String, PersistenceError> {
    if raw.is_empty() {
        return Err(PersistenceError::Backend(anyhow!("empty {what}")));
    }
    let lowered = raw.to_ascii_lowercase().replace('-', "_");
    if lowered
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Ok(lowered)
    } else {
        Err(PersistenceError::Backend(anyhow!(
            "{what} {raw:?} contains characters unsafe for an identifier"
        )))
    }
}

fn parse_status(raw: &str) -> Result<WorkflowStatus, PersistenceError> {
    match raw {
        "running" => Ok(WorkflowStatus::Running),
        "complete" => Ok(WorkflowStatus::Complete),
        other => Err(PersistenceError::Backend(anyhow!(
            "unknown workflow status {other:?}"
        ))),
    }
}

fn backend(error: sqlx::Error) -> PersistenceError {
    PersistenceError::Backend(error.into())
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn initialize(&self) -> Result<(), PersistenceError> {
        // Fail fast if the pool cannot reach the database.
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), PersistenceError> {
        self.pool.close().await;
        Ok(())
    }

    async fn initialize_workflow(&self, schema: &WorkflowSchema) -> Result<(), PersistenceError> {
        let table = table_name(&schema.workflow_name)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id      UUID PRIMARY KEY,
                version INTEGER NOT NULL,
                status  TEXT NOT NULL,
                data    JSONB NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        for field in &schema.mapped_fields {
            let field_ident = identifier(field, "mapped field")?;
            sqlx::query(&format!(
                r#"
                CREATE INDEX IF NOT EXISTS {table}_{field_ident}_idx
                ON {table} ((data->>'{field_ident}'))
                "#
            ))
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        }

        info!(
            workflow = %schema.workflow_name,
            table = %table,
            mapped_fields = schema.mapped_fields.len(),
            "workflow storage ready"
        );
        Ok(())
    }

    async fn get_workflow_state(
        &self,
        workflow_name: &str,
        field: &str,
        key: &str,
        include_completed: bool,
    ) -> Result<Vec<WorkflowRow>, PersistenceError> {
        let table = table_name(workflow_name)?;
        let field_ident = identifier(field, "mapped field")?;

        let mut sql = format!(
            "SELECT id, version, status, data FROM {table} WHERE data->>'{field_ident}' = $1"
        );
        if !include_completed {
            sql.push_str(" AND status = 'running'");
        }

        let rows = sqlx::query(&sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| {
                let id: Uuid = row.try_get("id").map_err(backend)?;
                let version: i32 = row.try_get("version").map_err(backend)?;
                let status: String = row.try_get("status").map_err(backend)?;
                let data: serde_json::Value = row.try_get("data").map_err(backend)?;
                Ok(WorkflowRow {
                    id,
                    workflow_name: workflow_name.to_string(),
                    status: parse_status(&status)?,
                    version: version as u64,
                    data,
                })
            })
            .collect()
    }

    async fn save_workflow_state(&self, row: &WorkflowRow) -> Result<u64, PersistenceError> {
        let table = table_name(&row.workflow_name)?;
        let stored_version = row.version + 1;

        if row.version == 0 {
            let result = sqlx::query(&format!(
                "INSERT INTO {table} (id, version, status, data) VALUES ($1, 1, $2, $3)"
            ))
            .bind(row.id)
            .bind(row.status.as_str())
            .bind(&row.data)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {}
                // An existing id means another writer created the row first.
                Err(error)
                    if error
                        .as_database_error()
                        .is_some_and(|db| db.is_unique_violation()) =>
                {
                    return Err(PersistenceError::WorkflowStateNotFound {
                        workflow_id: row.id,
                        workflow_name: row.workflow_name.clone(),
                        version: row.version,
                    });
                }
                Err(error) => return Err(backend(error)),
            }
        } else {
            let result = sqlx::query(&format!(
                r#"
                UPDATE {table}
                SET version = $1,
                    status = $2,
                    data = $3
                WHERE id = $4 AND version = $5
                "#
            ))
            .bind(stored_version as i32)
            .bind(row.status.as_str())
            .bind(&row.data)
            .bind(row.id)
            .bind(row.version as i32)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

            if result.rows_affected() == 0 {
                return Err(PersistenceError::WorkflowStateNotFound {
                    workflow_id: row.id,
                    workflow_name: row.workflow_name.clone(),
                    version: row.version,
                });
            }
        }

        debug!(
            workflow = %row.workflow_name,
            workflow_id = %row.id,
            version = stored_version,
            "workflow state saved"
        );
        Ok(stored_version)
    }
}
