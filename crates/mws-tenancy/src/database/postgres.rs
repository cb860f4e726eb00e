// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL database server backend.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use super::{ADMIN_GROUP, BASELINE_PERMISSIONS, DatabaseServer, TenantSchema, quote_identifier};
use crate::error::BackendError;
use crate::migrations;
use crate::tenant::ConnectionSpec;

/// `duplicate_database`
const DUPLICATE_DATABASE: &str = "42P04";

/// Creates tenant databases through an administrative pool and initializes
/// them over short-lived single-connection pools.
#[derive(Clone)]
pub struct PostgresServer {
    admin_pool: PgPool,
}

impl PostgresServer {
    /// `admin_pool` must connect as a role allowed to create databases.
    pub fn new(admin_pool: PgPool) -> Self {
        Self { admin_pool }
    }
}

fn map_create_error(err: sqlx::Error, name: &str) -> BackendError {
    match &err {
        sqlx::Error::Database(db)
            if db.code().as_deref() == Some(DUPLICATE_DATABASE) || db.is_unique_violation() =>
        {
            // Concurrent CREATE DATABASE of the same name surfaces as a
            // unique violation on pg_database instead of 42P04.
            BackendError::DatabaseExists(name.to_string())
        }
        _ => BackendError::Sqlx(err),
    }
}

async fn connect(spec: &ConnectionSpec) -> Result<PgPool, BackendError> {
    Ok(PgPoolOptions::new()
        .max_connections(1)
        .connect_with(spec.connect_options())
        .await?)
}

#[async_trait]
impl DatabaseServer for PostgresServer {
    async fn create_database(&self, name: &str) -> Result<(), BackendError> {
        let sql = format!(
            "CREATE DATABASE {} WITH ENCODING 'UTF8'",
            quote_identifier(name)
        );
        sqlx::raw_sql(&sql)
            .execute(&self.admin_pool)
            .await
            .map_err(|e| map_create_error(e, name))?;

        debug!(database = %name, "Database created");
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), BackendError> {
        let sql = format!(
            "DROP DATABASE IF EXISTS {} WITH (FORCE)",
            quote_identifier(name)
        );
        sqlx::raw_sql(&sql).execute(&self.admin_pool).await?;

        debug!(database = %name, "Database dropped");
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, BackendError> {
        let exists: (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(name)
                .fetch_one(&self.admin_pool)
                .await?;

        Ok(exists.0)
    }
}

#[async_trait]
impl TenantSchema for PostgresServer {
    async fn migrate(&self, spec: &ConnectionSpec) -> Result<(), BackendError> {
        let pool = connect(spec).await?;
        let applied = migrations::TENANT.run(&pool).await;
        pool.close().await;
        applied?;

        debug!(database = %spec.database, "Tenant migrations applied");
        Ok(())
    }

    async fn seed_permissions(&self, spec: &ConnectionSpec) -> Result<(), BackendError> {
        let pool = connect(spec).await?;
        let mut tx = pool.begin().await?;

        for (codename, name) in BASELINE_PERMISSIONS {
            sqlx::query(
                r#"
                INSERT INTO permissions (codename, name)
                VALUES ($1, $2)
                ON CONFLICT (codename) DO NOTHING
                "#,
            )
            .bind(*codename)
            .bind(*name)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("INSERT INTO groups (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(ADMIN_GROUP)
            .execute(&mut *tx)
            .await?;

        let codenames: Vec<String> = BASELINE_PERMISSIONS
            .iter()
            .map(|(codename, _)| codename.to_string())
            .collect();

        sqlx::query(
            r#"
            INSERT INTO group_permissions (group_id, permission_id)
            SELECT g.id, p.id
            FROM groups g, permissions p
            WHERE g.name = $1 AND p.codename = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(ADMIN_GROUP)
        .bind(&codenames)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        pool.close().await;

        debug!(database = %spec.database, "Baseline permissions seeded");
        Ok(())
    }
}
