// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant identity and connection types.
//!
//! A tenant is identified by a [`TenantKey`], which doubles as the public
//! subdomain of its store. Each tenant is backed by exactly one physical
//! database described by a [`ConnectionSpec`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::error::{Result, TenancyError};

/// Maximum length of a tenant key (the store subdomain column is 25 chars wide).
pub const MAX_TENANT_KEY_LEN: usize = 25;

/// Maximum length of a tenant display name.
pub const MAX_DISPLAY_NAME_LEN: usize = 25;

/// Maximum length of a contact email (RFC 5321 path limit).
pub const MAX_CONTACT_EMAIL_LEN: usize = 254;

/// Validated tenant identifier.
///
/// A key is a single DNS label so that it can be used directly as the
/// subdomain of the tenant's store.
///
/// # Validation Rules
///
/// - Length: 1-25 characters
/// - Characters: lowercase ASCII letters, digits and hyphen
/// - Must start with a letter or digit
/// - Cannot end with a hyphen
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantKey(String);

impl TenantKey {
    /// Parse and validate a tenant key.
    pub fn parse(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if let Err(reason) = validate_key(&key) {
            return Err(TenancyError::InvalidTenantKey { key, reason });
        }
        Ok(Self(key))
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_key(key: &str) -> std::result::Result<(), &'static str> {
    if key.is_empty() {
        return Err("must not be empty");
    }
    if key.len() > MAX_TENANT_KEY_LEN {
        return Err("must be at most 25 characters");
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err("may only contain lowercase letters, digits and '-'");
    }
    if key.starts_with('-') {
        return Err("must start with a letter or digit");
    }
    if key.ends_with('-') {
        return Err("must not end with '-'");
    }
    Ok(())
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantKey {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantKey {
    type Error = TenancyError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<TenantKey> for String {
    fn from(key: TenantKey) -> Self {
        key.0
    }
}

impl AsRef<str> for TenantKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parameters needed to connect to a tenant's physical database.
///
/// Never mutated once registered; a tenant whose backing store changes gets
/// a whole new spec.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    /// Database server host.
    pub host: String,
    /// Database server port.
    pub port: u16,
    /// Physical database name.
    pub database: String,
    /// Login role.
    pub user: String,
    /// Login password.
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Engine runtime parameters applied on connect.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl ConnectionSpec {
    /// Connection options for sqlx.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
            .application_name("mws");

        if self.options.is_empty() {
            options
        } else {
            options.options(self.options.iter())
        }
    }

    /// Same server and credentials, different database.
    pub fn with_database(&self, database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("options", &self.options)
            .finish()
    }
}

/// Lifecycle state of a control-plane tenant record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    /// Database created and recorded, migration or seeding not finished.
    Provisioning,
    /// Fully provisioned and routable.
    Active,
}

impl TenantStatus {
    /// Returns the string representation stored in the control plane.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "active" => Ok(Self::Active),
            _ => Err(format!("Unknown tenant status: {}", s)),
        }
    }
}

/// Control-plane record of a provisioned tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantDescriptor {
    /// Tenant key (also its subdomain).
    pub key: TenantKey,
    /// Store display name.
    pub display_name: String,
    /// Contact email of the store operator.
    pub contact_email: String,
    /// Where the tenant's database lives.
    pub connection: ConnectionSpec,
    /// When provisioning started.
    pub created_at: DateTime<Utc>,
}

/// A request to create a new tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTenant {
    /// Store display name.
    pub name: String,
    /// Requested tenant key.
    pub key: String,
    /// Contact email.
    pub email: String,
}

impl NewTenant {
    /// Create a new tenant request.
    pub fn new(name: impl Into<String>, key: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            email: email.into(),
        }
    }

    /// Validate the request, returning the parsed key, trimmed name and email.
    pub fn validate(&self) -> Result<(TenantKey, String, String)> {
        let key = TenantKey::parse(self.key.clone())?;

        let name = self.name.trim();
        if name.is_empty() {
            return Err(TenancyError::InvalidRequest {
                field: "name",
                message: "must not be empty".to_string(),
            });
        }
        if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(TenancyError::InvalidRequest {
                field: "name",
                message: format!("must be at most {} characters", MAX_DISPLAY_NAME_LEN),
            });
        }

        let email = self.email.trim();
        if !is_plausible_email(email) {
            return Err(TenancyError::InvalidRequest {
                field: "email",
                message: "must be a valid email address".to_string(),
            });
        }
        if email.chars().count() > MAX_CONTACT_EMAIL_LEN {
            return Err(TenancyError::InvalidRequest {
                field: "email",
                message: format!("must be at most {} characters", MAX_CONTACT_EMAIL_LEN),
            });
        }

        Ok((key, name.to_string(), email.to_string()))
    }
}

fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.chars().any(char::is_whitespace)
        && domain
            .split('.')
            .filter(|label| !label.is_empty())
            .count()
            >= 2
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
