//! Probe for arbitrary HTTP endpoints.

use super::http;
use crate::connector::{Connector, ConnectorInfo, ProbeOutcome};
use crate::credential::{AuthMaterial, CredentialKind, Secret};
use crate::error::ConnectorError;
use crate::registry::IntegrationKind;
use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::HeaderName;
use std::collections::BTreeMap;
use std::time::Duration;

/// Calls `{method} {url}` and checks the status.
///
/// Config: `url` (required), `method` (default GET), `expected_status`
/// (default any 2xx), `header_name` (sends a token credential in this header
/// instead of `Authorization: Bearer`), `tls_verify` (default true).
/// Keyed bundles are sent as one header per field.
pub struct GenericHttpConnector;

fn method(config: &BTreeMap<String, String>) -> Result<Method, ConnectorError> {
    let raw = config.get("method").map_or("GET", |m| m.trim());
    Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(|_| {
        ConnectorError::InvalidConfig {
            reason: format!("'{raw}' is not an HTTP method"),
        }
    })
}

fn expected_status(config: &BTreeMap<String, String>) -> Result<Option<u16>, ConnectorError> {
    config
        .get("expected_status")
        .map(|raw| {
            raw.trim()
                .parse::<u16>()
                .ok()
                .filter(|code| (100..600).contains(code))
                .ok_or_else(|| ConnectorError::InvalidConfig {
                    reason: "'expected_status' must be an HTTP status code".to_string(),
                })
        })
        .transpose()
}

fn header_name(name: &str) -> Result<HeaderName, ConnectorError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|_| ConnectorError::InvalidConfig {
        reason: format!("'{name}' is not a valid header name"),
    })
}

#[async_trait]
impl Connector for GenericHttpConnector {
    fn info(&self) -> ConnectorInfo {
        ConnectorInfo {
            kind: IntegrationKind::GenericHttp,
            name: "Generic HTTP".to_string(),
            description: "Any HTTP endpoint".to_string(),
            credential_kinds: vec![
                CredentialKind::Token,
                CredentialKind::BasicAuth,
                CredentialKind::KeyedBundle,
            ],
        }
    }

    async fn test_connection(
        &self,
        config: &BTreeMap<String, String>,
        secret: &Secret,
        timeout: Duration,
    ) -> Result<ProbeOutcome, ConnectorError> {
        let url = http::base_url(config, "url", None)?;
        let method = method(config)?;
        let expected = expected_status(config)?;
        let tls_verify = http::flag(config, "tls_verify", true)?;

        let client = http::client(timeout, tls_verify)?;
        let mut request = client.request(method, &url);
        request = match secret.auth() {
            AuthMaterial::Bearer { token } => match config.get("header_name") {
                Some(name) => request.header(header_name(name.trim())?, token),
                None => request.bearer_auth(token),
            },
            AuthMaterial::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthMaterial::Bundle { fields } => {
                for (name, value) in fields.iter() {
                    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                        ConnectorError::InvalidCredential {
                            reason: format!("bundle field '{name}' is not a valid header name"),
                        }
                    })?;
                    request = request.header(name, value);
                }
                request
            }
        };

        let response = http::send(request).await?;
        let status = response.status();
        let accepted = match expected {
            Some(code) => status.as_u16() == code,
            None => status.is_success(),
        };

        if accepted {
            Ok(ProbeOutcome::succeeded().with_detail("status", status.as_u16()))
        } else {
            http::throttled(&response)?;
            Ok(http::failure_for(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::http::testing::{config, serve, token};
    use crate::credential::SecretFields;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};

    async fn guarded(headers: HeaderMap) -> StatusCode {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        if header("x-api-key") == Some("k1") && header("x-tenant") == Some("t1") {
            StatusCode::NO_CONTENT
        } else if header("authorization") == Some("Basic dXNlcjpwYXNz") {
            StatusCode::OK
        } else if header("x-token") == Some("tok") {
            StatusCode::ACCEPTED
        } else {
            StatusCode::UNAUTHORIZED
        }
    }

    async fn server() -> String {
        serve(
            axum::Router::new()
                .route("/health", get(guarded))
                .route("/hook", post(|| async { StatusCode::CREATED })),
        )
        .await
    }

    #[tokio::test]
    async fn auth_by_credential_kind() {
        let url = format!("{}/health", server().await);
        let timeout = Duration::from_secs(5);

        let bundle = Secret {
            kind: CredentialKind::KeyedBundle,
            fields: SecretFields::from_iter([("x-api-key", "k1"), ("x-tenant", "t1")]),
        };
        let outcome = GenericHttpConnector
            .test_connection(&config(&[("url", &url)]), &bundle, timeout)
            .await
            .expect("bundle");
        assert!(outcome.ok);

        let basic = Secret {
            kind: CredentialKind::BasicAuth,
            fields: SecretFields::from_iter([("username", "user"), ("password", "pass")]),
        };
        let outcome = GenericHttpConnector
            .test_connection(&config(&[("url", &url)]), &basic, timeout)
            .await
            .expect("basic");
        assert!(outcome.ok);

        let outcome = GenericHttpConnector
            .test_connection(
                &config(&[("url", &url), ("header_name", "x-token")]),
                &token("tok"),
                timeout,
            )
            .await
            .expect("custom header");
        assert!(outcome.ok);

        let outcome = GenericHttpConnector
            .test_connection(&config(&[("url", &url)]), &token("tok"), timeout)
            .await
            .expect("bearer");
        assert_eq!(outcome.reason(), Some("401"));
    }

    #[tokio::test]
    async fn method_and_expected_status() {
        let url = format!("{}/hook", server().await);
        let timeout = Duration::from_secs(5);

        let outcome = GenericHttpConnector
            .test_connection(
                &config(&[("url", &url), ("method", "post"), ("expected_status", "201")]),
                &token("t"),
                timeout,
            )
            .await
            .expect("probe");
        assert!(outcome.ok);

        let outcome = GenericHttpConnector
            .test_connection(
                &config(&[("url", &url), ("method", "POST"), ("expected_status", "200")]),
                &token("t"),
                timeout,
            )
            .await
            .expect("probe");
        assert_eq!(outcome.reason(), Some("HTTP 201"));
    }

    #[test]
    fn config_validation() {
        assert!(method(&config(&[("method", "NOT A METHOD")])).is_err());
        assert_eq!(method(&config(&[])), Ok(Method::GET));
        assert_eq!(expected_status(&config(&[("expected_status", "204")])), Ok(Some(204)));
        assert!(expected_status(&config(&[("expected_status", "999")])).is_err());
    }
}
