//! Integration records.

use super::{invalid_column, is_unique_violation, unavailable};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use std::str::FromStr;
use switchyard_core::{IntegrationId, OwnerId};
use switchyard_integration::error::StoreError;
use switchyard_integration::{
    Integration, IntegrationKind, IntegrationState, IntegrationStore, ListFilter, StateWrite,
};

const COLUMNS: &str = "id, owner_id, kind, display_name, config, state, last_error, \
     last_tested_at, next_test_at, consecutive_failures, created_at, updated_at";

/// Row type for integration queries.
#[derive(FromRow)]
struct IntegrationRow {
    id: String,
    owner_id: String,
    kind: String,
    display_name: String,
    config: Json<BTreeMap<String, String>>,
    state: String,
    last_error: Option<String>,
    last_tested_at: Option<DateTime<Utc>>,
    next_test_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl IntegrationRow {
    fn try_into_integration(self) -> Result<Integration, sqlx::Error> {
        let id = IntegrationId::from_str(&self.id)
            .map_err(|e| invalid_column("integration id", &self.id, e))?;
        let owner = OwnerId::from_str(&self.owner_id)
            .map_err(|e| invalid_column("owner id", &self.owner_id, e))?;
        let kind = IntegrationKind::from_str(&self.kind)
            .map_err(|e| invalid_column("integration kind", &self.kind, e))?;
        let state = IntegrationState::from_str(&self.state)
            .map_err(|e| invalid_column("integration state", &self.state, e))?;
        let consecutive_failures = u32::try_from(self.consecutive_failures).map_err(|e| {
            invalid_column(
                "consecutive failure count",
                &self.consecutive_failures.to_string(),
                e,
            )
        })?;

        Ok(Integration {
            id,
            owner,
            kind,
            display_name: self.display_name,
            config: self.config.0,
            state,
            last_error: self.last_error,
            last_tested_at: self.last_tested_at,
            next_test_at: self.next_test_at,
            consecutive_failures,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn failures_column(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

fn decode_all(rows: Vec<IntegrationRow>) -> Result<Vec<Integration>, StoreError> {
    rows.into_iter()
        .map(|r| r.try_into_integration().map_err(unavailable))
        .collect()
}

/// Integration records in Postgres.
///
/// State writes are compare-and-set on the stored state, so a transition
/// decided against a stale read never lands.
#[derive(Clone)]
pub struct PgIntegrationStore {
    pool: PgPool,
}

impl PgIntegrationStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IntegrationStore for PgIntegrationStore {
    async fn insert(&self, integration: &Integration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO integrations
                (id, owner_id, kind, display_name, config, state, last_error,
                 last_tested_at, next_test_at, consecutive_failures, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(integration.id.to_string())
        .bind(integration.owner.to_string())
        .bind(integration.kind.as_str())
        .bind(&integration.display_name)
        .bind(Json(&integration.config))
        .bind(integration.state.as_str())
        .bind(&integration.last_error)
        .bind(integration.last_tested_at)
        .bind(integration.next_test_at)
        .bind(failures_column(integration.consecutive_failures))
        .bind(integration.created_at)
        .bind(integration.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateName {
                    name: integration.display_name.clone(),
                }
            } else {
                unavailable(e)
            }
        })?;

        Ok(())
    }

    async fn find(&self, id: IntegrationId) -> Result<Option<Integration>, StoreError> {
        let row: Option<IntegrationRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM integrations WHERE id = $1"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;

        row.map(|r| r.try_into_integration().map_err(unavailable))
            .transpose()
    }

    async fn list(
        &self,
        owner: OwnerId,
        filter: &ListFilter,
    ) -> Result<Vec<Integration>, StoreError> {
        let rows: Vec<IntegrationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM integrations
            WHERE owner_id = $1
              AND ($2::TEXT IS NULL OR state = $2)
              AND ($3::TEXT IS NULL OR kind = $3)
            ORDER BY display_name ASC, id ASC
            "#
        ))
        .bind(owner.to_string())
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        decode_all(rows)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Integration>, StoreError> {
        let rows: Vec<IntegrationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS}
            FROM integrations
            WHERE state IN ('active', 'error')
              AND (next_test_at IS NULL OR next_test_at <= $1)
            ORDER BY next_test_at ASC NULLS FIRST, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        decode_all(rows)
    }

    async fn update_config(
        &self,
        id: IntegrationId,
        config: &BTreeMap<String, String>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integrations
            SET config = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(Json(config))
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn rename(
        &self,
        id: IntegrationId,
        display_name: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integrations
            SET display_name = $2, updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .bind(display_name)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateName {
                    name: display_name.to_string(),
                }
            } else {
                unavailable(e)
            }
        })?;

        Ok(result.rows_affected() == 1)
    }

    async fn write_state(&self, id: IntegrationId, write: &StateWrite) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integrations
            SET state = $3, last_error = $4, last_tested_at = $5, next_test_at = $6,
                consecutive_failures = $7, updated_at = $8
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id.to_string())
        .bind(write.expected.as_str())
        .bind(write.state.as_str())
        .bind(&write.last_error)
        .bind(write.last_tested_at)
        .bind(write.next_test_at)
        .bind(failures_column(write.consecutive_failures))
        .bind(write.updated_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_next_test_at(
        &self,
        id: IntegrationId,
        at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE integrations SET next_test_at = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: IntegrationId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM integrations WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> IntegrationRow {
        let now = Utc::now();
        IntegrationRow {
            id: IntegrationId::new().to_string(),
            owner_id: OwnerId::new().to_string(),
            kind: "source-host".to_string(),
            display_name: "github".to_string(),
            config: Json(BTreeMap::from([(
                "api_url".to_string(),
                "https://api.github.com".to_string(),
            )])),
            state: "error".to_string(),
            last_error: Some("401".to_string()),
            last_tested_at: Some(now),
            next_test_at: None,
            consecutive_failures: 2,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn row_converts() {
        let integration = row().try_into_integration().expect("valid row");
        assert_eq!(integration.kind, IntegrationKind::SourceHost);
        assert_eq!(integration.state, IntegrationState::Error);
        assert_eq!(integration.consecutive_failures, 2);
        assert_eq!(integration.config["api_url"], "https://api.github.com");
    }

    #[test]
    fn bad_columns_are_decode_errors() {
        let unknown_state = IntegrationRow {
            state: "connected".to_string(),
            ..row()
        };
        assert!(matches!(
            unknown_state.try_into_integration(),
            Err(sqlx::Error::Decode(_))
        ));

        let bad_id = IntegrationRow {
            id: "nope".to_string(),
            ..row()
        };
        assert!(bad_id.try_into_integration().is_err());

        let negative = IntegrationRow {
            consecutive_failures: -1,
            ..row()
        };
        assert!(negative.try_into_integration().is_err());
    }

    #[test]
    fn failure_count_saturates() {
        assert_eq!(failures_column(3), 3);
        assert_eq!(failures_column(u32::MAX), i32::MAX);
    }
}
