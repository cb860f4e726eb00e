// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for mws-tenancy.
//!
//! [`TenancyError`] is what callers of the registry, provisioner and router
//! see. [`BackendError`] is the lower-level failure of a storage backend and
//! is preserved as the `source` of higher-level errors for logging, but never
//! shown to end users (see [`TenancyError::public_message`]).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type using TenancyError.
pub type Result<T> = std::result::Result<T, TenancyError>;

/// A remote step of tenant provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    /// Issuing `CREATE DATABASE`.
    CreateDatabase,
    /// Recording the tenant in the registry and control plane.
    Register,
    /// Running schema migrations against the tenant database.
    Migrate,
    /// Seeding baseline roles and permissions.
    SeedPermissions,
    /// Marking the tenant active.
    Activate,
}

impl ProvisionStep {
    /// Returns the string representation of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateDatabase => "create_database",
            Self::Register => "register",
            Self::Migrate => "migrate",
            Self::SeedPermissions => "seed_permissions",
            Self::Activate => "activate",
        }
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cleanup step of the rollback coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStep {
    /// Deleting the control-plane record.
    DeleteRecord,
    /// Dropping the physical database.
    DropDatabase,
}

impl RollbackStep {
    /// Returns the string representation of the step.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeleteRecord => "delete_record",
            Self::DropDatabase => "drop_database",
        }
    }
}

impl fmt::Display for RollbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a storage backend (control plane or database server).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The physical database already exists.
    #[error("database '{0}' already exists")]
    DatabaseExists(String),

    /// The control plane already holds a record for this key.
    #[error("tenant key '{0}' already recorded")]
    KeyConflict(String),

    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Database operation failed.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Residue left behind by a rollback that could not complete.
///
/// Always requires operator attention: the listed steps did not happen, so
/// a physical database or control-plane row may be orphaned.
#[derive(Debug, Clone, Error)]
#[error(
    "rollback of tenant '{key}' incomplete (database '{database}'): {}",
    describe_failures(.failures)
)]
pub struct RollbackFailure {
    /// Tenant key being rolled back.
    pub key: String,
    /// Physical database named in the rolled-back spec.
    pub database: String,
    /// Steps that failed, with the reason.
    pub failures: Vec<(RollbackStep, String)>,
}

fn describe_failures(failures: &[(RollbackStep, String)]) -> String {
    failures
        .iter()
        .map(|(step, reason)| format!("{}: {}", step, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl RollbackFailure {
    /// Whether the physical database may have been left behind.
    pub fn orphaned_database(&self) -> bool {
        self.failures
            .iter()
            .any(|(step, _)| *step == RollbackStep::DropDatabase)
    }
}

/// Errors surfaced by the tenancy subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TenancyError {
    /// The tenant key is syntactically invalid.
    #[error("invalid tenant key '{key}': {reason}")]
    InvalidTenantKey {
        /// The rejected key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A provisioning request field is invalid.
    #[error("invalid value for '{field}': {message}")]
    InvalidRequest {
        /// The offending field.
        field: &'static str,
        /// The validation error message.
        message: String,
    },

    /// The tenant key is already provisioned (or being provisioned).
    #[error("tenant '{key}' already exists")]
    DuplicateTenant {
        /// The duplicate key.
        key: String,
    },

    /// No active tenant with this key.
    #[error("tenant '{key}' not found")]
    UnknownTenant {
        /// The key that did not resolve.
        key: String,
    },

    /// Provisioning failed; partial state has been rolled back.
    #[error("provisioning of tenant '{key}' failed at {step}: {cause}")]
    Provisioning {
        /// The tenant key.
        key: String,
        /// The step that failed.
        step: ProvisionStep,
        /// The underlying failure.
        #[source]
        cause: BackendError,
        /// Set when cleanup itself failed. Reported separately from the cause.
        rollback: Option<RollbackFailure>,
    },

    /// Cleanup of a tenant failed.
    #[error(transparent)]
    RollbackFailed(#[from] RollbackFailure),

    /// The control plane could not be consulted on a registry miss.
    #[error("routing unavailable for tenant '{key}': {cause}")]
    RoutingUnavailable {
        /// The key being resolved.
        key: String,
        /// The underlying failure.
        #[source]
        cause: BackendError,
    },

    /// Tenant-scoped code ran outside of a routed unit of work.
    #[error("no execution context bound to the current unit of work")]
    Unrouted,

    /// Configuration loading failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A backend operation outside provisioning/routing failed.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl TenancyError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTenantKey { .. } => "INVALID_TENANT_KEY",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::DuplicateTenant { .. } => "DUPLICATE_TENANT",
            Self::UnknownTenant { .. } => "UNKNOWN_TENANT",
            Self::Provisioning { .. } => "TENANT_PROVISIONING_FAILED",
            Self::RollbackFailed(_) => "ROLLBACK_FAILED",
            Self::RoutingUnavailable { .. } => "ROUTING_UNAVAILABLE",
            Self::Unrouted => "UNROUTED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Backend(_) => "BACKEND_ERROR",
        }
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provisioning { .. } | Self::RoutingUnavailable { .. }
        )
    }

    /// Message safe to show to end users.
    ///
    /// Never includes physical database names, hosts or low-level causes.
    /// Unknown tenants read exactly like a subdomain that was never
    /// registered.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidTenantKey { reason, .. } => format!("invalid store address: {}", reason),
            Self::InvalidRequest { field, message } => format!("{} {}", field, message),
            Self::DuplicateTenant { .. } => "this store address is already taken".to_string(),
            Self::UnknownTenant { .. } => "not found".to_string(),
            Self::Provisioning { .. } => "could not create your store, try again later".to_string(),
            Self::RoutingUnavailable { .. } => {
                "service temporarily unavailable, try again later".to_string()
            }
            Self::Unrouted | Self::RollbackFailed(_) | Self::Config(_) | Self::Backend(_) => {
                "internal error".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provisioning_error() -> TenancyError {
        TenancyError::Provisioning {
            key: "acme".to_string(),
            step: ProvisionStep::Migrate,
            cause: BackendError::Other("relation mws_acme_db.users exists".to_string()),
            rollback: None,
        }
    }

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                TenancyError::InvalidTenantKey {
                    key: "-".to_string(),
                    reason: "bad",
                },
                "INVALID_TENANT_KEY",
            ),
            (
                TenancyError::DuplicateTenant {
                    key: "acme".to_string(),
                },
                "DUPLICATE_TENANT",
            ),
            (
                TenancyError::UnknownTenant {
                    key: "acme".to_string(),
                },
                "UNKNOWN_TENANT",
            ),
            (provisioning_error(), "TENANT_PROVISIONING_FAILED"),
            (
                TenancyError::RoutingUnavailable {
                    key: "acme".to_string(),
                    cause: BackendError::Timeout(Duration::from_millis(5)),
                },
                "ROUTING_UNAVAILABLE",
            ),
            (TenancyError::Unrouted, "UNROUTED"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.error_code(), expected, "{:?}", error);
        }
    }

    #[test]
    fn test_public_message_hides_cause() {
        let err = provisioning_error();
        assert!(err.to_string().contains("mws_acme_db"));
        assert_eq!(
            err.public_message(),
            "could not create your store, try again later"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unknown_tenant_reads_like_not_found() {
        let err = TenancyError::UnknownTenant {
            key: "ghost".to_string(),
        };
        assert_eq!(err.public_message(), "not found");
        assert!(!err.public_message().contains("ghost"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rollback_failure_display() {
        let failure = RollbackFailure {
            key: "acme".to_string(),
            database: "mws_acme_db".to_string(),
            failures: vec![
                (RollbackStep::DeleteRecord, "connection refused".to_string()),
                (RollbackStep::DropDatabase, "timed out".to_string()),
            ],
        };
        assert_eq!(
            failure.to_string(),
            "rollback of tenant 'acme' incomplete (database 'mws_acme_db'): \
             delete_record: connection refused; drop_database: timed out"
        );
        assert!(failure.orphaned_database());

        let err: TenancyError = failure.into();
        assert_eq!(err.error_code(), "ROLLBACK_FAILED");
    }

    #[test]
    fn test_provisioning_source_is_cause() {
        use std::error::Error as _;

        let err = provisioning_error();
        let source = err.source().expect("cause should be the source");
        assert!(source.to_string().contains("relation"));
    }
}
