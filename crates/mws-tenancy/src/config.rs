// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::tenant::ConnectionSpec;

/// mws-tenancy configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection to the control-plane database
    pub control_plane: ConnectionSpec,
    /// Host for newly provisioned tenant databases (defaults to the control-plane host)
    pub tenant_host: Option<String>,
    /// Port for newly provisioned tenant databases (defaults to the control-plane port)
    pub tenant_port: Option<u16>,
    /// Pool size for the control-plane pool and each tenant pool
    pub max_connections: u32,
    /// Bound on each remote provisioning and rollback step
    pub step_timeout: Duration,
    /// Bound on control-plane lookups on a registry miss
    pub lookup_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `MWS_DB_NAME`: control-plane database name
    /// - `MWS_DB_USER`: control-plane user
    /// - `MWS_DB_PASSWORD` or `MWS_PASSWD_FILE`: control-plane password
    ///
    /// Optional (with defaults):
    /// - `MWS_DB_HOST`: control-plane host (default: localhost)
    /// - `MWS_DB_PORT`: control-plane port (default: 5432)
    /// - `MWS_TENANT_DB_HOST` / `MWS_TENANT_DB_PORT`: tenant database server override
    /// - `MWS_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `MWS_PROVISION_STEP_TIMEOUT_SECS`: per-step provisioning timeout (default: 60)
    /// - `MWS_LOOKUP_TIMEOUT_MS`: control-plane lookup timeout (default: 2000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database = required("MWS_DB_NAME")?;
        let user = required("MWS_DB_USER")?;
        let password = password_from_env()?;

        let host = std::env::var("MWS_DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let port: u16 = parse_or("MWS_DB_PORT", "5432", "must be a valid port number")?;

        let tenant_host = std::env::var("MWS_TENANT_DB_HOST").ok();
        let tenant_port = match std::env::var("MWS_TENANT_DB_PORT") {
            Ok(value) => Some(value.parse().map_err(|_| {
                ConfigError::Invalid("MWS_TENANT_DB_PORT", "must be a valid port number")
            })?),
            Err(_) => None,
        };

        let max_connections: u32 =
            parse_or("MWS_MAX_CONNECTIONS", "10", "must be a positive integer")?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "MWS_MAX_CONNECTIONS",
                "must be a positive integer",
            ));
        }

        let step_timeout_secs: u64 = parse_or(
            "MWS_PROVISION_STEP_TIMEOUT_SECS",
            "60",
            "must be a number of seconds",
        )?;
        let lookup_timeout_ms: u64 = parse_or(
            "MWS_LOOKUP_TIMEOUT_MS",
            "2000",
            "must be a number of milliseconds",
        )?;

        Ok(Self {
            control_plane: ConnectionSpec {
                host,
                port,
                database,
                user,
                password,
                options: BTreeMap::new(),
            },
            tenant_host,
            tenant_port,
            max_connections,
            step_timeout: Duration::from_secs(step_timeout_secs),
            lookup_timeout: Duration::from_millis(lookup_timeout_ms),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, reason))
}

fn password_from_env() -> Result<String, ConfigError> {
    if let Ok(password) = std::env::var("MWS_DB_PASSWORD") {
        return Ok(password);
    }

    let path = PathBuf::from(
        std::env::var("MWS_PASSWD_FILE")
            .map_err(|_| ConfigError::Missing("MWS_DB_PASSWORD or MWS_PASSWD_FILE"))?,
    );
    let contents = std::fs::read_to_string(&path)
        .map_err(|source| ConfigError::PasswordFile { path, source })?;

    Ok(contents.trim_end_matches(['\r', '\n']).to_string())
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    /// The password file could not be read.
    #[error("cannot read password file {}: {source}", path.display())]
    PasswordFile {
        /// Path from `MWS_PASSWD_FILE`.
        path: PathBuf,
        /// The I/O failure.
        source: std::io::Error,
    },

    /// A [`TenancyBuilder`](crate::runtime::TenancyBuilder) is missing a component.
    #[error("{0} is required")]
    Incomplete(&'static str),
}
