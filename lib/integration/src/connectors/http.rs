//! Shared HTTP plumbing for the bundled connectors.

use crate::connector::ProbeOutcome;
use crate::credential::{AuthMaterial, Secret};
use crate::error::ConnectorError;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));

pub(crate) fn client(timeout: Duration, tls_verify: bool) -> Result<reqwest::Client, ConnectorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(!tls_verify)
        .build()
        .map_err(|e| ConnectorError::ConnectionFailed {
            reason: e.to_string(),
        })
}

/// Returns a required, non-empty config value.
pub(crate) fn required<'a>(
    config: &'a BTreeMap<String, String>,
    key: &str,
) -> Result<&'a str, ConnectorError> {
    config
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConnectorError::InvalidConfig {
            reason: format!("missing '{key}'"),
        })
}

/// Returns an http(s) base URL from config without its trailing slash.
pub(crate) fn base_url(
    config: &BTreeMap<String, String>,
    key: &str,
    default: Option<&str>,
) -> Result<String, ConnectorError> {
    let url = match (required(config, key), default) {
        (Ok(url), _) => url,
        (Err(_), Some(default)) => default,
        (Err(e), None) => return Err(e),
    };
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ConnectorError::InvalidConfig {
            reason: format!("'{key}' must be an http or https URL"),
        });
    }
    Ok(url.trim_end_matches('/').to_string())
}

/// Parses an optional boolean flag.
pub(crate) fn flag(
    config: &BTreeMap<String, String>,
    key: &str,
    default: bool,
) -> Result<bool, ConnectorError> {
    match config.get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(_) => Err(ConnectorError::InvalidConfig {
            reason: format!("'{key}' must be true or false"),
        }),
    }
}

/// Returns the bearer token of a token credential.
pub(crate) fn bearer_token(secret: &Secret) -> Result<&str, ConnectorError> {
    match secret.auth() {
        AuthMaterial::Bearer { token } => Ok(token),
        _ => Err(ConnectorError::InvalidCredential {
            reason: format!("expected a token credential, got {}", secret.kind),
        }),
    }
}

/// Sends a request, mapping transport failures.
pub(crate) async fn send(request: RequestBuilder) -> Result<Response, ConnectorError> {
    request.send().await.map_err(|e| {
        debug!(error = %e, "probe request failed");
        if e.is_timeout() {
            ConnectorError::Timeout
        } else if e.is_connect() {
            ConnectorError::ConnectionFailed {
                reason: e.to_string(),
            }
        } else {
            ConnectorError::ProtocolError {
                reason: e.to_string(),
            }
        }
    })
}

/// The failed probe for a non-accepted status.
pub(crate) fn failure_for(status: StatusCode) -> ProbeOutcome {
    let reason = match status {
        StatusCode::UNAUTHORIZED => "401".to_string(),
        StatusCode::FORBIDDEN => "403".to_string(),
        other => format!("HTTP {}", other.as_u16()),
    };
    ProbeOutcome::failed(reason).with_detail("status", status.as_u16())
}

/// Fails with `RateLimited` when the remote system answered 429.
pub(crate) fn throttled(response: &Response) -> Result<(), ConnectorError> {
    if response.status() != StatusCode::TOO_MANY_REQUESTS {
        return Ok(());
    }
    // Only the delta-seconds form of Retry-After is honoured.
    let retry_after_secs = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());
    Err(ConnectorError::RateLimited { retry_after_secs })
}

/// The failed probe for a non-success status, if any.
///
/// # Errors
///
/// `RateLimited` for a 429.
pub(crate) fn rejected(response: &Response) -> Result<Option<ProbeOutcome>, ConnectorError> {
    throttled(response)?;
    let status = response.status();
    Ok((!status.is_success()).then(|| failure_for(status)))
}

pub(crate) fn unparseable(e: &reqwest::Error) -> ConnectorError {
    ConnectorError::ProtocolError {
        reason: format!("unexpected response body: {e}"),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::credential::{CredentialKind, Secret, SecretFields};
    use std::collections::BTreeMap;

    /// Serves `router` on an ephemeral local port and returns its base URL.
    pub(crate) async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    /// A base URL nothing listens on.
    pub(crate) async fn dead_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);
        format!("http://{addr}")
    }

    pub(crate) fn token(value: &str) -> Secret {
        Secret {
            kind: CredentialKind::Token,
            fields: SecretFields::from_iter([("token", value)]),
        }
    }

    pub(crate) fn config(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reasons() {
        assert_eq!(failure_for(StatusCode::UNAUTHORIZED).reason(), Some("401"));
        assert_eq!(failure_for(StatusCode::FORBIDDEN).reason(), Some("403"));
        assert_eq!(
            failure_for(StatusCode::BAD_GATEWAY).reason(),
            Some("HTTP 502")
        );
    }

    #[test]
    fn config_helpers() {
        let config = testing::config(&[("url", "https://x/ "), ("tls_verify", "no")]);
        assert_eq!(base_url(&config, "url", None).expect("url"), "https://x");
        assert_eq!(
            base_url(&config, "api_url", Some("https://api.example")).expect("default"),
            "https://api.example"
        );
        assert!(base_url(&testing::config(&[("url", "ftp://x")]), "url", None).is_err());
        assert_eq!(flag(&config, "tls_verify", true), Ok(false));
        assert_eq!(flag(&config, "missing", true), Ok(true));
        assert!(flag(&testing::config(&[("f", "maybe")]), "f", true).is_err());
    }

    #[tokio::test]
    async fn too_many_requests_is_rate_limited() {
        use axum::http::{StatusCode as Status, header};
        use axum::routing::get;

        let url = testing::serve(
            axum::Router::new()
                .route(
                    "/slow",
                    get(|| async { (Status::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "30")]) }),
                )
                .route("/bare", get(|| async { Status::TOO_MANY_REQUESTS }))
                .route("/ok", get(|| async { "fine" }))
                .route("/gone", get(|| async { Status::NOT_FOUND })),
        )
        .await;
        let client = client(Duration::from_secs(5), true).expect("client");
        let fetch = |path: &str| send(client.get(format!("{url}{path}")));

        let response = fetch("/slow").await.expect("response");
        assert_eq!(
            rejected(&response).err(),
            Some(ConnectorError::RateLimited {
                retry_after_secs: Some(30)
            })
        );
        let response = fetch("/bare").await.expect("response");
        assert_eq!(
            rejected(&response).err(),
            Some(ConnectorError::RateLimited {
                retry_after_secs: None
            })
        );
        let response = fetch("/ok").await.expect("response");
        assert_eq!(rejected(&response), Ok(None));
        let response = fetch("/gone").await.expect("response");
        let outcome = rejected(&response).expect("not throttled").expect("rejected");
        assert_eq!(outcome.reason(), Some("HTTP 404"));
    }
}
