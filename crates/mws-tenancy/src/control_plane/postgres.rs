// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL control-plane store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;

use super::{ControlPlaneStore, TenantRecord};
use crate::error::BackendError;
use crate::tenant::{ConnectionSpec, TenantDescriptor, TenantKey, TenantStatus};

/// Control plane backed by the `tenants` table.
#[derive(Clone)]
pub struct PostgresControlPlane {
    pool: PgPool,
}

impl PostgresControlPlane {
    /// Create a new store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    tenant_key: String,
    display_name: String,
    contact_email: String,
    db_host: String,
    db_port: i32,
    db_name: String,
    db_user: String,
    db_password: String,
    db_options: Json<BTreeMap<String, String>>,
    status: String,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
}

impl TryFrom<TenantRow> for TenantRecord {
    type Error = BackendError;

    fn try_from(row: TenantRow) -> Result<Self, Self::Error> {
        let key = TenantKey::parse(row.tenant_key)
            .map_err(|e| BackendError::Other(format!("corrupt tenant row: {}", e)))?;
        let port = u16::try_from(row.db_port).map_err(|_| {
            BackendError::Other(format!(
                "corrupt tenant row '{}': invalid port {}",
                key, row.db_port
            ))
        })?;
        let status: TenantStatus = row.status.parse().map_err(BackendError::Other)?;

        Ok(TenantRecord {
            descriptor: TenantDescriptor {
                key,
                display_name: row.display_name,
                contact_email: row.contact_email,
                connection: ConnectionSpec {
                    host: row.db_host,
                    port,
                    database: row.db_name,
                    user: row.db_user,
                    password: row.db_password,
                    options: row.db_options.0,
                },
                created_at: row.created_at,
            },
            status,
            activated_at: row.activated_at,
        })
    }
}

const SELECT_TENANT: &str = r#"
    SELECT tenant_key, display_name, contact_email,
           db_host, db_port, db_name, db_user, db_password, db_options,
           status, created_at, activated_at
    FROM tenants
"#;

fn map_insert_error(err: sqlx::Error, key: &TenantKey) -> BackendError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            BackendError::KeyConflict(key.to_string())
        }
        _ => BackendError::Sqlx(err),
    }
}

#[async_trait]
impl ControlPlaneStore for PostgresControlPlane {
    async fn insert_provisioning(&self, descriptor: &TenantDescriptor) -> Result<(), BackendError> {
        let spec = &descriptor.connection;

        sqlx::query(
            r#"
            INSERT INTO tenants (
                tenant_key, display_name, contact_email,
                db_host, db_port, db_name, db_user, db_password, db_options,
                status, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'provisioning', $10)
            "#,
        )
        .bind(descriptor.key.as_str())
        .bind(&descriptor.display_name)
        .bind(&descriptor.contact_email)
        .bind(&spec.host)
        .bind(i32::from(spec.port))
        .bind(&spec.database)
        .bind(&spec.user)
        .bind(&spec.password)
        .bind(Json(&spec.options))
        .bind(descriptor.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_insert_error(e, &descriptor.key))?;

        Ok(())
    }

    async fn mark_active(&self, key: &TenantKey) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET status = 'active', activated_at = NOW()
            WHERE tenant_key = $1 AND status = 'provisioning'
            "#,
        )
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BackendError::Other(format!(
                "tenant '{}' is not awaiting activation",
                key
            )));
        }

        Ok(())
    }

    async fn get_active(&self, key: &TenantKey) -> Result<Option<TenantDescriptor>, BackendError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "{} WHERE tenant_key = $1 AND status = 'active'",
            SELECT_TENANT
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| TenantRecord::try_from(row).map(|record| record.descriptor))
            .transpose()
    }

    async fn get(&self, key: &TenantKey) -> Result<Option<TenantRecord>, BackendError> {
        let row = sqlx::query_as::<_, TenantRow>(&format!(
            "{} WHERE tenant_key = $1",
            SELECT_TENANT
        ))
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(TenantRecord::try_from).transpose()
    }

    async fn delete(&self, key: &TenantKey) -> Result<bool, BackendError> {
        let result = sqlx::query("DELETE FROM tenants WHERE tenant_key = $1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self) -> Result<Vec<TenantDescriptor>, BackendError> {
        let rows = sqlx::query_as::<_, TenantRow>(&format!(
            "{} WHERE status = 'active' ORDER BY tenant_key",
            SELECT_TENANT
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| TenantRecord::try_from(row).map(|record| record.descriptor))
            .collect()
    }

    async fn list_incomplete(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<TenantRecord>, BackendError> {
        let rows = sqlx::query_as::<_, TenantRow>(&format!(
            "{} WHERE status = 'provisioning' AND created_at < $1 ORDER BY created_at",
            SELECT_TENANT
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TenantRecord::try_from).collect()
    }
}
