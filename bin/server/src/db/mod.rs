//! Postgres persistence for the vault.
//!
//! This module provides sqlx-backed implementations of:
//! - Integration records (`integrations`)
//! - Encrypted credentials (`credentials`)
//! - The append-only audit log (`audit_log`)

pub mod audit;
pub mod credential;
pub mod integration;

pub use audit::PgAuditLog;
pub use credential::PgCredentialStore;
pub use integration::PgIntegrationStore;

use switchyard_integration::error::StoreError;

/// Builds the decode error for a column holding an unparseable value.
fn invalid_column(column: &str, value: &str, reason: impl std::fmt::Display) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("invalid {column} '{value}': {reason}"),
    )))
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable {
        details: e.to_string(),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
