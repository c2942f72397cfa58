//! Encrypted credential records.

use super::{invalid_column, unavailable};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;
use switchyard_core::IntegrationId;
use switchyard_integration::cipher::KeyVersion;
use switchyard_integration::error::StoreError;
use switchyard_integration::{CredentialKind, CredentialRecordStore, StoredCredential};

#[derive(FromRow)]
struct CredentialRow {
    kind: String,
    ciphertext: Vec<u8>,
    key_version: String,
}

impl CredentialRow {
    fn try_into_stored(self) -> Result<StoredCredential, sqlx::Error> {
        let kind = CredentialKind::from_str(&self.kind)
            .map_err(|e| invalid_column("credential kind", &self.kind, e))?;
        Ok(StoredCredential {
            kind,
            ciphertext: self.ciphertext,
            key_version: KeyVersion::new(self.key_version),
        })
    }
}

/// Credential records in Postgres, one row per integration.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialRecordStore for PgCredentialStore {
    async fn upsert(&self, id: IntegrationId, record: &StoredCredential) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (integration_id, kind, ciphertext, key_version, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (integration_id)
            DO UPDATE SET kind = $2, ciphertext = $3, key_version = $4, updated_at = $5
            "#,
        )
        .bind(id.to_string())
        .bind(record.kind.as_str())
        .bind(&record.ciphertext)
        .bind(record.key_version.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn load(&self, id: IntegrationId) -> Result<Option<StoredCredential>, StoreError> {
        let row: Option<CredentialRow> = sqlx::query_as(
            r#"
            SELECT kind, ciphertext, key_version
            FROM credentials
            WHERE integration_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|r| r.try_into_stored().map_err(unavailable))
            .transpose()
    }

    async fn remove(&self, id: IntegrationId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM credentials WHERE integration_id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(())
    }

    async fn list_stale(&self, active: &KeyVersion) -> Result<Vec<IntegrationId>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT integration_id
            FROM credentials
            WHERE key_version <> $1
            ORDER BY integration_id
            "#,
        )
        .bind(active.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter()
            .map(|(id,)| {
                IntegrationId::from_str(&id)
                    .map_err(|e| unavailable(invalid_column("integration id", &id, e)))
            })
            .collect()
    }
}
