//! The append-only audit log.
//!
//! Entries are only ever inserted.

use super::{invalid_column, unavailable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use switchyard_core::{AuditEntryId, IntegrationId};
use switchyard_integration::error::AuditError;
use switchyard_integration::{Actor, AuditEntry, AuditEvent, AuditLog};

#[derive(FromRow)]
struct AuditRow {
    id: String,
    integration_id: String,
    event: String,
    detail: Json<Map<String, Value>>,
    acted_by: String,
    at: DateTime<Utc>,
}

impl AuditRow {
    fn try_into_entry(self) -> Result<AuditEntry, sqlx::Error> {
        Ok(AuditEntry {
            id: AuditEntryId::from_str(&self.id)
                .map_err(|e| invalid_column("audit entry id", &self.id, e))?,
            integration_id: IntegrationId::from_str(&self.integration_id)
                .map_err(|e| invalid_column("integration id", &self.integration_id, e))?,
            event: AuditEvent::from_str(&self.event)
                .map_err(|e| invalid_column("audit event", &self.event, e))?,
            detail: self.detail.0,
            acted_by: Actor::from_str(&self.acted_by)
                .map_err(|e| invalid_column("actor", &self.acted_by, e))?,
            at: self.at,
        })
    }
}

fn audit_unavailable(e: sqlx::Error) -> AuditError {
    AuditError::Unavailable {
        details: unavailable(e).to_string(),
    }
}

/// Audit entries in Postgres.
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    /// Creates a new log.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, integration_id, event, detail, acted_by, at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.integration_id.to_string())
        .bind(entry.event.as_str())
        .bind(Json(&entry.detail))
        .bind(entry.acted_by.to_string())
        .bind(entry.at)
        .execute(&self.pool)
        .await
        .map_err(audit_unavailable)?;

        Ok(())
    }

    async fn list_for(&self, integration_id: IntegrationId) -> Result<Vec<AuditEntry>, AuditError> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT id, integration_id, event, detail, acted_by, at
            FROM audit_log
            WHERE integration_id = $1
            ORDER BY at ASC, id ASC
            "#,
        )
        .bind(integration_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(audit_unavailable)?;

        rows.into_iter()
            .map(|r| r.try_into_entry().map_err(audit_unavailable))
            .collect()
    }
}
