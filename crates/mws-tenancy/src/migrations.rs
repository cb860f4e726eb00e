// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded database migrations.
//!
//! Two independent migration sets are shipped: one for the control-plane
//! database and one applied to every tenant database.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use mws_tenancy::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run_control_plane(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// Control-plane migrator (the `tenants` table).
pub static CONTROL_PLANE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/control-plane");

/// Tenant database migrator (users, permissions, services, packages).
pub static TENANT: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/tenant");

/// Run control-plane migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run_control_plane(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    CONTROL_PLANE.run(pool).await
}
