// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane store interfaces and backends.
//!
//! The control plane is the one always-available database holding the
//! durable list of tenants. Its unique constraint on the tenant key is the
//! authoritative guard against two provisionings of the same key.

pub mod memory;
pub mod postgres;

pub use self::memory::{ControlPlaneOp, MemoryControlPlane};
pub use self::postgres::PostgresControlPlane;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BackendError;
use crate::tenant::{TenantDescriptor, TenantKey, TenantStatus};

/// A control-plane row, in any lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    /// The stored descriptor.
    pub descriptor: TenantDescriptor,
    /// Lifecycle state.
    pub status: TenantStatus,
    /// When the tenant became routable.
    pub activated_at: Option<DateTime<Utc>>,
}

/// Durable tenant store.
///
/// Only [`TenantStatus::Active`] rows are visible to routing. Rows in
/// [`TenantStatus::Provisioning`] exist so that a crash mid-provisioning can
/// be detected and rolled back on the next start.
#[async_trait]
pub trait ControlPlaneStore: Send + Sync {
    /// Insert a descriptor in `provisioning` state.
    ///
    /// Fails with [`BackendError::KeyConflict`] if the key (or the database
    /// name) is already recorded, whatever its status.
    async fn insert_provisioning(&self, descriptor: &TenantDescriptor) -> Result<(), BackendError>;

    /// Flip a `provisioning` row to `active`.
    async fn mark_active(&self, key: &TenantKey) -> Result<(), BackendError>;

    /// Active descriptor for `key`, if any.
    async fn get_active(&self, key: &TenantKey) -> Result<Option<TenantDescriptor>, BackendError>;

    /// Row for `key` in any state.
    async fn get(&self, key: &TenantKey) -> Result<Option<TenantRecord>, BackendError>;

    /// Remove the row for `key`. Returns whether a row was removed.
    async fn delete(&self, key: &TenantKey) -> Result<bool, BackendError>;

    /// Every active tenant, ordered by key.
    async fn list_active(&self) -> Result<Vec<TenantDescriptor>, BackendError>;

    /// Rows still `provisioning` that were created before `created_before`.
    async fn list_incomplete(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<TenantRecord>, BackendError>;
}
