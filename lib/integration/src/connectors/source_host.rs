//! Source-control host probe.

use super::http;
use crate::connector::{Connector, ConnectorInfo, ProbeOutcome};
use crate::credential::{CredentialKind, Secret};
use crate::error::ConnectorError;
use crate::registry::IntegrationKind;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.github.com";

/// Fetches the authenticated user with a bearer token.
///
/// Config: `api_url` (default the public GitHub API).
pub struct SourceHostConnector;

#[derive(Deserialize)]
struct User {
    login: String,
}

#[async_trait]
impl Connector for SourceHostConnector {
    fn info(&self) -> ConnectorInfo {
        ConnectorInfo {
            kind: IntegrationKind::SourceHost,
            name: "Source host".to_string(),
            description: "Source-control host REST API".to_string(),
            credential_kinds: vec![CredentialKind::Token],
        }
    }

    async fn test_connection(
        &self,
        config: &BTreeMap<String, String>,
        secret: &Secret,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ConnectorError> {
        let api_url = http::base_url(config, "api_url", Some(DEFAULT_API_URL))?;
        let token = http::bearer_token(secret)?;

        let client = http::client(timeout, true)?;
        let response = http::send(
            client
                .get(format!("{api_url}/user"))
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .bearer_auth(token),
        )
        .await?;
        if let Some(rejected) = http::rejected(&response)? {
            return Ok(rejected);
        }

        let user: User = response.json().await.map_err(|e| http::unparseable(&e))?;
        Ok(ProbeOutcome::succeeded().with_detail("login", user.login))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::http::testing::{config, serve, token};
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
    use axum::routing::get;
    use serde_json::{Value, json};

    async fn user(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        if headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) == Some("Bearer ghp_good") {
            (StatusCode::OK, Json(json!({"login": "octocat", "id": 1})))
        } else {
            (StatusCode::FORBIDDEN, Json(json!({"message": "Bad credentials"})))
        }
    }

    #[tokio::test]
    async fn reports_login_or_rejection() {
        let url = serve(axum::Router::new().route("/user", get(user))).await;
        let config = config(&[("api_url", &url)]);

        let outcome = SourceHostConnector
            .test_connection(&config, &token("ghp_good"), Duration::from_secs(5))
            .await
            .expect("probe");
        assert!(outcome.ok);
        assert_eq!(outcome.detail["login"], json!("octocat"));

        let outcome = SourceHostConnector
            .test_connection(&config, &token("ghp_bad"), Duration::from_secs(5))
            .await
            .expect("probe");
        assert_eq!(outcome.reason(), Some("403"));
    }

    #[tokio::test]
    async fn garbage_body_is_protocol_error() {
        let url = serve(axum::Router::new().route("/user", get(|| async { "not json" }))).await;
        let err = SourceHostConnector
            .test_connection(&config(&[("api_url", &url)]), &token("x"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ProtocolError { .. }));
    }
}
