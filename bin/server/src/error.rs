//! Domain error types for server operations.
//!
//! [`StartupError`] covers the bootstrap, where any failure means the process
//! refuses to start. [`ApiError`] is what management handlers return; it
//! maps lifecycle errors onto HTTP statuses and keeps internal details out of
//! response bodies.

use crate::routes::OWNER_HEADER;
use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rootcause::prelude::Report;
use serde_json::json;
use std::fmt;
use switchyard_integration::{ErrorClass, LifecycleError};
use tracing::error;

/// Reasons the server refuses to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupError {
    /// Configuration is missing or malformed.
    Config { reason: String },
    /// The key ring could not be derived from the configured secrets.
    KeyRing { reason: String },
    /// The database is unreachable.
    Database { reason: String },
    /// Migrations failed to apply.
    Migration { reason: String },
    /// Re-wrapping stale credentials failed.
    Rewrap { reason: String },
    /// The health monitor configuration was rejected.
    Monitor { reason: String },
    /// The listen address could not be bound.
    Bind { addr: String, reason: String },
    /// The HTTP server stopped with an error.
    Serve { reason: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "failed to load configuration: {reason}"),
            Self::KeyRing { reason } => write!(f, "failed to initialise key ring: {reason}"),
            Self::Database { reason } => write!(f, "failed to connect to database: {reason}"),
            Self::Migration { reason } => write!(f, "failed to run migrations: {reason}"),
            Self::Rewrap { reason } => write!(f, "failed to re-wrap credentials: {reason}"),
            Self::Monitor { reason } => write!(f, "failed to start health monitor: {reason}"),
            Self::Bind { addr, reason } => write!(f, "failed to bind {addr}: {reason}"),
            Self::Serve { reason } => write!(f, "server error: {reason}"),
        }
    }
}

impl std::error::Error for StartupError {}

/// Errors returned by management handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// A lifecycle operation failed.
    Lifecycle(LifecycleError),
    /// The owner header is absent.
    MissingOwner,
    /// The owner header is not an owner id.
    InvalidOwner,
    /// The path does not hold an integration id.
    InvalidId,
    /// The request body or query string could not be read.
    InvalidRequest { status: StatusCode },
}

impl From<Report<LifecycleError>> for ApiError {
    fn from(report: Report<LifecycleError>) -> Self {
        Self::Lifecycle(report.current_context().clone())
    }
}

// Rejection messages can quote the offending input, which may be a secret.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest {
            status: rejection.status(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidRequest {
            status: rejection.status(),
        }
    }
}

impl ApiError {
    /// The response status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Lifecycle(e) => match e {
                LifecycleError::NotFound { .. } => StatusCode::NOT_FOUND,
                LifecycleError::DuplicateName { .. }
                | LifecycleError::InvalidTransition { .. } => StatusCode::CONFLICT,
                LifecycleError::UnsupportedKind { .. }
                | LifecycleError::InvalidName { .. }
                | LifecycleError::InvalidConfig { .. }
                | LifecycleError::InvalidCredential { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                LifecycleError::StorageFailed { .. } | LifecycleError::AuditFailed { .. } => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                LifecycleError::TestAborted { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::MissingOwner | Self::InvalidOwner => StatusCode::UNAUTHORIZED,
            Self::InvalidId => StatusCode::NOT_FOUND,
            Self::InvalidRequest { status } => *status,
        }
    }

    /// The user-safe message.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Lifecycle(e) if e.class() == ErrorClass::Fatal => {
                "service unavailable".to_string()
            }
            Self::Lifecycle(e) => e.to_string(),
            Self::MissingOwner => format!("missing {OWNER_HEADER} header"),
            Self::InvalidOwner => format!("invalid {OWNER_HEADER} header"),
            Self::InvalidId => "integration not found".to_string(),
            Self::InvalidRequest { .. } => "malformed request".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Lifecycle(e) = &self {
            if e.class() == ErrorClass::Fatal {
                error!(error = %e, "request failed");
            }
        }
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_core::IntegrationId;
    use switchyard_integration::IntegrationState;

    #[test]
    fn lifecycle_status_mapping() {
        let id = IntegrationId::new();
        let cases = [
            (LifecycleError::NotFound { id }, StatusCode::NOT_FOUND),
            (
                LifecycleError::DuplicateName {
                    name: "prod".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                LifecycleError::InvalidTransition {
                    id,
                    from: IntegrationState::Disabled,
                    to: IntegrationState::Active,
                },
                StatusCode::CONFLICT,
            ),
            (
                LifecycleError::UnsupportedKind {
                    kind: "ftp".to_string(),
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                LifecycleError::StorageFailed {
                    details: "connection reset".to_string(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::Lifecycle(err).status(), status);
        }
        assert_eq!(ApiError::MissingOwner.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn fatal_details_stay_internal() {
        let err = ApiError::Lifecycle(LifecycleError::StorageFailed {
            details: "pg: password authentication failed for user vault".to_string(),
        });
        assert_eq!(err.message(), "service unavailable");

        let err = ApiError::Lifecycle(LifecycleError::DuplicateName {
            name: "prod".to_string(),
        });
        assert!(err.message().contains("prod"));
    }

    #[test]
    fn startup_error_display() {
        let err = StartupError::Bind {
            addr: "0.0.0.0:80".to_string(),
            reason: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("0.0.0.0:80"));
    }
}
