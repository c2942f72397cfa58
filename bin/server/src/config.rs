//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables. Nested keys use
//! `__` as separator, so `VAULT__KDF_SALT` sets `vault.kdf_salt` and
//! `VAULT__MASTER_SECRETS__V1` supplies the master secret for key version
//! `v1`.
//!
//! See [`KeyRingConfig`], [`LifecycleConfig`] and [`HealthMonitorConfig`] for
//! the library-owned sections.

use serde::Deserialize;
use switchyard_integration::{KeyRingConfig, LifecycleConfig};
use switchyard_scheduler::HealthMonitorConfig;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Upper bound on pooled database connections.
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Address the management API listens on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Master secrets and key derivation.
    pub vault: KeyRingConfig,

    /// Connection test bounds.
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Background re-testing.
    #[serde(default)]
    pub health: HealthMonitorConfig,
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_listen_addr() -> String {
    "127.0.0.1:3000".to_string()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_vars(None)
    }

    fn from_vars(
        vars: Option<config::Map<String, String>>,
    ) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .source(vars.clone()),
            )
            // Key material is read verbatim, so a salt of "007" never becomes 7.
            .add_source(
                config::Environment::with_prefix("VAULT")
                    .prefix_separator("__")
                    .separator("__")
                    .keep_prefix(true)
                    .try_parsing(false)
                    .source(vars),
            )
            .build()?
            .try_deserialize()
    }
}
