// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Physical database server interfaces and backends.

pub mod memory;
pub mod postgres;

pub use self::memory::{FailPoint, MemoryDatabaseServer};
pub use self::postgres::PostgresServer;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::tenant::ConnectionSpec;

/// Creates and drops whole databases.
#[async_trait]
pub trait DatabaseServer: Send + Sync {
    /// Create an empty database.
    ///
    /// Fails with [`BackendError::DatabaseExists`] if it already exists.
    async fn create_database(&self, name: &str) -> Result<(), BackendError>;

    /// Drop a database. Dropping a missing database succeeds.
    async fn drop_database(&self, name: &str) -> Result<(), BackendError>;

    /// Whether a database with this name exists.
    async fn database_exists(&self, name: &str) -> Result<bool, BackendError>;
}

/// Initializes the contents of a tenant database.
#[async_trait]
pub trait TenantSchema: Send + Sync {
    /// Apply all pending tenant schema migrations.
    async fn migrate(&self, spec: &ConnectionSpec) -> Result<(), BackendError>;

    /// Seed the baseline roles and permissions. Safe to repeat.
    async fn seed_permissions(&self, spec: &ConnectionSpec) -> Result<(), BackendError>;
}

/// Quote an SQL identifier.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Permission codenames granted to the `admin` group.
pub const BASELINE_PERMISSIONS: &[(&str, &str)] = &[
    ("add_service", "Can add service"),
    ("view_service", "Can view service"),
    ("view_admin_service", "Can view service admin"),
    ("change_service", "Can change service"),
    ("delete_service", "Can delete service"),
    ("add_developer", "Can add developer"),
    ("view_developer", "Can view developer"),
    ("view_admin_developer", "Can view developer admin"),
    ("change_developer", "Can change developer"),
    ("delete_developer", "Can delete developer"),
    ("add_client", "Can add client"),
    ("view_client", "Can view client"),
    ("view_admin_client", "Can view client admin"),
    ("change_client", "Can change client"),
    ("delete_client", "Can delete client"),
    ("view_tenant", "Can view tenant"),
    ("change_tenant", "Can change tenant"),
    ("view_package", "Can view package"),
    ("add_package", "Can add package"),
];

/// Name of the group holding every baseline permission.
pub const ADMIN_GROUP: &str = "admin";
