//! Chat platform probe.

use super::http;
use crate::connector::{Connector, ConnectorInfo, ProbeOutcome};
use crate::credential::{CredentialKind, Secret};
use crate::error::ConnectorError;
use crate::registry::IntegrationKind;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://slack.com/api";

/// Calls `auth.test` with a bot token.
///
/// The platform answers 200 for rejected tokens too; the verdict is the
/// `ok` field of the body.
pub struct ChatPlatformConnector;

#[derive(Deserialize)]
struct AuthTest {
    ok: bool,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl Connector for ChatPlatformConnector {
    fn info(&self) -> ConnectorInfo {
        ConnectorInfo {
            kind: IntegrationKind::ChatPlatform,
            name: "Chat platform".to_string(),
            description: "Team chat platform Web API".to_string(),
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
        let response =
            http::send(client.post(format!("{api_url}/auth.test")).bearer_auth(token)).await?;
        if let Some(rejected) = http::rejected(&response)? {
            return Ok(rejected);
        }

        let verdict: AuthTest = response.json().await.map_err(|e| http::unparseable(&e))?;
        if verdict.ok {
            let mut outcome = ProbeOutcome::succeeded();
            if let Some(team) = verdict.team {
                outcome = outcome.with_detail("team", team);
            }
            Ok(outcome)
        } else {
            Ok(ProbeOutcome::failed(
                verdict.error.unwrap_or_else(|| "auth.test rejected".to_string()),
            ))
        }
    }
}
