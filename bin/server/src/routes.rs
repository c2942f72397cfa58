//! The management API.
//!
//! Every route maps onto one lifecycle controller operation. The owner scope
//! comes from the `x-owner-id` header set by the identity proxy in front of
//! this service; nothing here authenticates callers.

use crate::error::ApiError;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use switchyard_core::{IntegrationId, OwnerId};
use switchyard_integration::{
    Actor, AuditEntry, ConnectorInfo, CredentialKind, Integration, IntegrationKind,
    LifecycleController, ListFilter, NewIntegration, SecretFields, TestReport,
};
use tower_http::trace::TraceLayer;
use tracing::instrument;

/// Header carrying the caller's owner scope.
pub const OWNER_HEADER: &str = "x-owner-id";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub controller: LifecycleController,
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/connectors", get(list_connectors))
        .route(
            "/api/integrations",
            post(create_integration).get(list_integrations),
        )
        .route(
            "/api/integrations/{id}",
            get(get_integration).delete(delete_integration),
        )
        .route("/api/integrations/{id}/config", put(update_config))
        .route("/api/integrations/{id}/name", put(rename))
        .route("/api/integrations/{id}/credential", put(update_credential))
        .route("/api/integrations/{id}/test", post(test_connection))
        .route("/api/integrations/{id}/disable", post(disable))
        .route("/api/integrations/{id}/reenable", post(reenable))
        .route("/api/integrations/{id}/audit", get(audit_trail))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Extractor for the caller's owner scope.
pub struct Owner(pub OwnerId);

impl Owner {
    fn actor(&self) -> Actor {
        Actor::Owner(self.0)
    }
}

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or(ApiError::MissingOwner)?;
        let raw = raw.to_str().map_err(|_| ApiError::InvalidOwner)?;
        OwnerId::from_str(raw.trim())
            .map(Owner)
            .map_err(|_| ApiError::InvalidOwner)
    }
}

fn integration_id(raw: &str) -> Result<IntegrationId, ApiError> {
    IntegrationId::from_str(raw).map_err(|_| ApiError::InvalidId)
}

/// Body of a create request.
#[derive(Deserialize)]
pub struct CreateRequest {
    pub kind: IntegrationKind,
    pub display_name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub credential_kind: CredentialKind,
    pub secret: SecretFields,
    #[serde(default)]
    pub test_now: bool,
}

#[derive(Deserialize)]
pub struct ConfigRequest {
    pub config: BTreeMap<String, String>,
}

#[derive(Deserialize)]
pub struct RenameRequest {
    pub display_name: String,
}

#[derive(Deserialize)]
pub struct CredentialRequest {
    pub credential_kind: CredentialKind,
    pub secret: SecretFields,
}

#[derive(Default, Deserialize)]
pub struct DisableRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn healthz() -> &'static str {
    "ok"
}

/// Kinds that can be created, with the credential kinds each accepts.
async fn list_connectors(State(state): State<AppState>) -> Json<Vec<ConnectorInfo>> {
    Json(state.controller.dispatch().registered())
}

#[instrument(skip_all, fields(owner = %owner.0))]
async fn create_integration(
    State(state): State<AppState>,
    owner: Owner,
    body: Result<Json<CreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Integration>), ApiError> {
    let Json(request) = body?;
    let integration = state
        .controller
        .create_integration(
            owner.0,
            NewIntegration {
                kind: request.kind,
                display_name: request.display_name,
                config: request.config,
                credential_kind: request.credential_kind,
                secret: request.secret,
                test_now: request.test_now,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(integration)))
}

async fn list_integrations(
    State(state): State<AppState>,
    owner: Owner,
    filter: Result<Query<ListFilter>, QueryRejection>,
) -> Result<Json<Vec<Integration>>, ApiError> {
    let Query(filter) = filter?;
    Ok(Json(state.controller.list(owner.0, &filter).await?))
}

async fn get_integration(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<Integration>, ApiError> {
    let id = integration_id(&id)?;
    Ok(Json(state.controller.get(owner.actor(), id).await?))
}

async fn update_config(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
    body: Result<Json<ConfigRequest>, JsonRejection>,
) -> Result<Json<Integration>, ApiError> {
    let id = integration_id(&id)?;
    let Json(request) = body?;
    Ok(Json(
        state
            .controller
            .update_config(owner.actor(), id, request.config)
            .await?,
    ))
}

async fn rename(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
    body: Result<Json<RenameRequest>, JsonRejection>,
) -> Result<Json<Integration>, ApiError> {
    let id = integration_id(&id)?;
    let Json(request) = body?;
    Ok(Json(
        state
            .controller
            .rename(owner.actor(), id, &request.display_name)
            .await?,
    ))
}

#[instrument(skip_all, fields(owner = %owner.0, integration_id = %id))]
async fn update_credential(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
    body: Result<Json<CredentialRequest>, JsonRejection>,
) -> Result<Json<Integration>, ApiError> {
    let id = integration_id(&id)?;
    let Json(request) = body?;
    Ok(Json(
        state
            .controller
            .update_credential(owner.actor(), id, request.credential_kind, request.secret)
            .await?,
    ))
}

async fn test_connection(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<TestReport>, ApiError> {
    let id = integration_id(&id)?;
    Ok(Json(
        state.controller.test_connection(owner.actor(), id).await?,
    ))
}

async fn disable(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Integration>, ApiError> {
    let id = integration_id(&id)?;
    // The body is optional; an empty one means no reason.
    let request: DisableRequest = if body.is_empty() {
        DisableRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|_| ApiError::InvalidRequest {
            status: StatusCode::UNPROCESSABLE_ENTITY,
        })?
    };
    Ok(Json(
        state
            .controller
            .disable(owner.actor(), id, request.reason)
            .await?,
    ))
}

async fn reenable(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<Integration>, ApiError> {
    let id = integration_id(&id)?;
    Ok(Json(state.controller.reenable(owner.actor(), id).await?))
}

async fn delete_integration(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // An id that cannot exist is as gone as a deleted one.
    let Ok(id) = integration_id(&id) else {
        return Ok(StatusCode::NO_CONTENT);
    };
    state.controller.delete(owner.actor(), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn audit_trail(
    State(state): State<AppState>,
    owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let id = integration_id(&id)?;
    Ok(Json(state.controller.audit_trail(owner.actor(), id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use switchyard_integration::cipher::MasterSecret;
    use switchyard_integration::connector::ProbeOutcome;
    use switchyard_integration::error::ConnectorError;
    use switchyard_integration::memory::{
        InMemoryAuditLog, InMemoryCredentialStore, InMemoryIntegrationStore,
    };
    use switchyard_integration::{
        Connector, ConnectorDispatch, ConnectorInfo, IntegrationRegistry, KeyRing, KeyVersion,
        LifecycleConfig, Secret, SecretStore,
    };
    use tower::ServiceExt;

    /// Accepts exactly the token "good".
    struct TokenCheck;

    #[async_trait]
    impl Connector for TokenCheck {
        fn info(&self) -> ConnectorInfo {
            ConnectorInfo {
                kind: IntegrationKind::SourceHost,
                name: "token check".to_string(),
                description: "test double".to_string(),
                credential_kinds: vec![CredentialKind::Token],
            }
        }

        async fn test_connection(
            &self,
            _config: &BTreeMap<String, String>,
            secret: &Secret,
            _timeout: Duration,
        ) -> Result<ProbeOutcome, ConnectorError> {
            if secret.fields.get("token") == Some("good") {
                Ok(ProbeOutcome::succeeded().with_detail("login", "octocat"))
            } else {
                Ok(ProbeOutcome::failed("401"))
            }
        }
    }

    fn app() -> Router {
        let ring = KeyRing::builder("routes-salt", 1_000)
            .with_key(KeyVersion::new("v1"), &MasterSecret::new("routes secret"))
            .expect("derive")
            .build(KeyVersion::new("v1"))
            .expect("ring");
        let registry = IntegrationRegistry::new(
            Arc::new(InMemoryIntegrationStore::new()),
            SecretStore::new(Arc::new(ring), Arc::new(InMemoryCredentialStore::new())),
            Arc::new(InMemoryAuditLog::new()),
        );
        let dispatch = Arc::new(ConnectorDispatch::new());
        dispatch.register(IntegrationKind::SourceHost, Arc::new(TokenCheck));
        router(AppState {
            controller: LifecycleController::new(registry, dispatch, LifecycleConfig::default()),
        })
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        owner: Option<OwnerId>,
        body: Option<Value>,
    ) -> (StatusCode, String) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            request = request.header(OWNER_HEADER, owner.to_string());
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .expect("request");

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn create_body(name: &str, token: &str) -> Value {
        json!({
            "kind": "source-host",
            "display_name": name,
            "config": {"api_url": "https://api.github.com"},
            "credential_kind": "token",
            "secret": {"token": token},
        })
    }

    async fn create(app: &Router, owner: OwnerId, name: &str, token: &str) -> String {
        let (status, body) = call(
            app,
            Method::POST,
            "/api/integrations",
            Some(owner),
            Some(create_body(name, token)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let created: Value = serde_json::from_str(&body).expect("json");
        created["id"].as_str().expect("id").to_string()
    }

    #[tokio::test]
    async fn owner_header_is_required() {
        let app = app();
        let (status, _) = call(&app, Method::GET, "/api/integrations", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/integrations")
            .header(OWNER_HEADER, "not-an-owner")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_test_and_read_back_without_secrets() {
        let app = app();
        let owner = OwnerId::new();
        let id = create(&app, owner, "github", "good").await;

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/integrations/{id}/test"),
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(report["ok"], json!(true));
        assert_eq!(report["integration"]["state"], json!("active"));

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/api/integrations/{id}"),
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.contains("good"));
        assert!(!body.contains("ciphertext"));

        let (_, body) = call(
            &app,
            Method::GET,
            &format!("/api/integrations/{id}/audit"),
            Some(owner),
            None,
        )
        .await;
        let trail: Value = serde_json::from_str(&body).expect("json");
        let events: Vec<&str> = trail
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|e| e["event"].as_str())
            .collect();
        assert_eq!(events, ["created", "test-succeeded"]);
    }

    #[tokio::test]
    async fn foreign_owner_sees_nothing() {
        let app = app();
        let owner = OwnerId::new();
        let id = create(&app, owner, "github", "good").await;

        let stranger = Some(OwnerId::new());
        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/api/integrations/{id}"),
            stranger,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::GET, "/api/integrations", stranger, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn conflicts_and_validation() {
        let app = app();
        let owner = OwnerId::new();
        let id = create(&app, owner, "github", "good").await;

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/integrations",
            Some(owner),
            Some(create_body("github", "good")),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Pending cannot be re-enabled.
        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/api/integrations/{id}/reenable"),
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let mut unsupported = create_body("chat", "good");
        unsupported["kind"] = json!("chat-platform");
        let (status, _) = call(
            &app,
            Method::POST,
            "/api/integrations",
            Some(owner),
            Some(unsupported),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, _) = call(
            &app,
            Method::PUT,
            &format!("/api/integrations/{id}/config"),
            Some(owner),
            Some(json!({"config": {"password": "x"}})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn malformed_body_does_not_echo_input() {
        let app = app();
        let mut body = create_body("github", "good");
        body["secret"] = json!({"token": 8_675_309});
        let (status, response) = call(
            &app,
            Method::POST,
            "/api/integrations",
            Some(OwnerId::new()),
            Some(body),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(!response.contains("8675309"));
    }

    #[tokio::test]
    async fn disable_reenable_and_delete() {
        let app = app();
        let owner = OwnerId::new();
        let id = create(&app, owner, "github", "good").await;
        call(
            &app,
            Method::POST,
            &format!("/api/integrations/{id}/test"),
            Some(owner),
            None,
        )
        .await;

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/integrations/{id}/disable"),
            Some(owner),
            Some(json!({"reason": "rotating tokens"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"disabled\""));

        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/api/integrations/{id}/reenable"),
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"pending\""));

        for _ in 0..2 {
            let (status, _) = call(
                &app,
                Method::DELETE,
                &format!("/api/integrations/{id}"),
                Some(owner),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::NO_CONTENT);
        }

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/api/integrations/{id}"),
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_filters_by_state() {
        let app = app();
        let owner = OwnerId::new();
        let tested = create(&app, owner, "tested", "good").await;
        create(&app, owner, "untested", "good").await;
        call(
            &app,
            Method::POST,
            &format!("/api/integrations/{tested}/test"),
            Some(owner),
            None,
        )
        .await;

        let (status, body) = call(
            &app,
            Method::GET,
            "/api/integrations?state=active",
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let listed: Value = serde_json::from_str(&body).expect("json");
        let names: Vec<&str> = listed
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|i| i["display_name"].as_str())
            .collect();
        assert_eq!(names, ["tested"]);

        let (status, _) = call(
            &app,
            Method::GET,
            "/api/integrations?state=broken",
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lists_registered_connectors() {
        let app = app();
        let (status, body) = call(&app, Method::GET, "/api/connectors", None, None).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let connectors: Value = serde_json::from_str(&body).expect("json");
        assert_eq!(connectors.as_array().map(Vec::len), Some(1));
        assert_eq!(connectors[0]["kind"], json!("source-host"));
        assert_eq!(connectors[0]["credential_kinds"], json!(["token"]));
    }
}
