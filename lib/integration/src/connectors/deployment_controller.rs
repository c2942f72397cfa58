//! GitOps deployment controller probe.

use super::http;
use crate::connector::{Connector, ConnectorInfo, ProbeOutcome};
use crate::credential::{CredentialKind, Secret};
use crate::error::ConnectorError;
use crate::registry::IntegrationKind;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Lists applications on the controller's REST API with a bearer token.
///
/// Config: `server_url` (required), `tls_verify` (default true).
pub struct DeploymentControllerConnector;

#[derive(Deserialize)]
struct ApplicationList {
    #[serde(default)]
    items: Option<Vec<serde_json::Value>>,
}

#[async_trait]
impl Connector for DeploymentControllerConnector {
    fn info(&self) -> ConnectorInfo {
        ConnectorInfo {
            kind: IntegrationKind::DeploymentController,
            name: "Deployment controller".to_string(),
            description: "GitOps deployment controller REST API".to_string(),
            credential_kinds: vec![CredentialKind::Token],
        }
    }

    async fn test_connection(
        &self,
        config: &BTreeMap<String, String>,
        secret: &Secret,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ConnectorError> {
        let server_url = http::base_url(config, "server_url", None)?;
        let tls_verify = http::flag(config, "tls_verify", true)?;
        let token = http::bearer_token(secret)?;

        let client = http::client(timeout, tls_verify)?;
        let response = http::send(
            client
                .get(format!("{server_url}/api/v1/applications"))
                .bearer_auth(token),
        )
        .await?;
        if let Some(rejected) = http::rejected(&response)? {
            return Ok(rejected);
        }

        // The controller returns `"items": null` when there are no applications.
        let list: ApplicationList = response.json().await.map_err(|e| http::unparseable(&e))?;
        let count = list.items.map_or(0, |items| items.len());
        Ok(ProbeOutcome::succeeded().with_detail("application_count", count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::http::testing::{config, dead_url, serve, token};
    use axum::Json;
    use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
    use axum::routing::get;
    use serde_json::{Value, json};

    async fn applications(headers: HeaderMap) -> (StatusCode, Json<Value>) {
        match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
            Some("Bearer good") => (StatusCode::OK, Json(json!({"items": [{}, {}]}))),
            Some("Bearer empty") => (StatusCode::OK, Json(json!({"items": null}))),
            _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))),
        }
    }

    async fn server() -> String {
        serve(axum::Router::new().route("/api/v1/applications", get(applications))).await
    }

    #[tokio::test]
    async fn counts_applications() {
        let url = server().await;
        let outcome = DeploymentControllerConnector
            .test_connection(&config(&[("server_url", &url)]), &token("good"), Duration::from_secs(5))
            .await
            .expect("probe");
        assert!(outcome.ok);
        assert_eq!(outcome.detail["application_count"], json!(2));

        let empty = DeploymentControllerConnector
            .test_connection(&config(&[("server_url", &url)]), &token("empty"), Duration::from_secs(5))
            .await
            .expect("probe");
        assert_eq!(empty.detail["application_count"], json!(0));
    }

    #[tokio::test]
    async fn bad_token_is_failed_probe() {
        let url = server().await;
        let outcome = DeploymentControllerConnector
            .test_connection(&config(&[("server_url", &url)]), &token("bad"), Duration::from_secs(5))
            .await
            .expect("probe");
        assert!(!outcome.ok);
        assert_eq!(outcome.reason(), Some("401"));
    }

    #[tokio::test]
    async fn unreachable_and_misconfigured() {
        let url = dead_url().await;
        let err = DeploymentControllerConnector
            .test_connection(&config(&[("server_url", &url)]), &token("good"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::ConnectionFailed { .. }));

        let err = DeploymentControllerConnector
            .test_connection(&config(&[]), &token("good"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::InvalidConfig { .. }));
    }
}
