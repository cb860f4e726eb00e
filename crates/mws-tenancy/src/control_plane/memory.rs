// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory control plane for tests and local development.
//!
//! Enforces the same uniqueness rules as the `tenants` table and supports
//! per-operation failure injection and artificial delays.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ControlPlaneStore, TenantRecord};
use crate::error::BackendError;
use crate::tenant::{TenantDescriptor, TenantKey, TenantStatus};

/// Control-plane operation, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlPlaneOp {
    /// [`ControlPlaneStore::insert_provisioning`]
    InsertProvisioning,
    /// [`ControlPlaneStore::mark_active`]
    MarkActive,
    /// [`ControlPlaneStore::get_active`]
    GetActive,
    /// [`ControlPlaneStore::get`]
    Get,
    /// [`ControlPlaneStore::delete`]
    Delete,
    /// [`ControlPlaneStore::list_active`] and [`ControlPlaneStore::list_incomplete`]
    List,
}

/// In-memory control plane.
#[derive(Default)]
pub struct MemoryControlPlane {
    tenants: Mutex<BTreeMap<TenantKey, TenantRecord>>,
    failures: StdMutex<HashSet<ControlPlaneOp>>,
    delays: StdMutex<HashMap<ControlPlaneOp, Duration>>,
    unavailable: AtomicBool,
    get_active_calls: AtomicUsize,
}

impl MemoryControlPlane {
    /// Create an empty control plane.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, op: ControlPlaneOp) {
        lock(&self.failures).insert(op);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Delay every call of `op` by `delay`.
    pub fn delay(&self, op: ControlPlaneOp, delay: Duration) {
        lock(&self.delays).insert(op, delay);
    }

    /// Simulate the control-plane database being unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of [`ControlPlaneStore::get_active`] calls so far.
    pub fn get_active_calls(&self) -> usize {
        self.get_active_calls.load(Ordering::SeqCst)
    }

    /// Number of rows in any state.
    pub async fn len(&self) -> usize {
        self.tenants.lock().await.len()
    }

    /// Whether the store holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.tenants.lock().await.is_empty()
    }

    /// Insert a row directly, bypassing the provisioning flow.
    ///
    /// Used to stage crash-recovery scenarios.
    pub async fn insert_record(&self, record: TenantRecord) {
        self.tenants
            .lock()
            .await
            .insert(record.descriptor.key.clone(), record);
    }

    async fn enter(&self, op: ControlPlaneOp) -> Result<(), BackendError> {
        let delay = lock(&self.delays).get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "control plane unreachable".to_string(),
            ));
        }
        if lock(&self.failures).contains(&op) {
            return Err(BackendError::Other(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl ControlPlaneStore for MemoryControlPlane {
    async fn insert_provisioning(&self, descriptor: &TenantDescriptor) -> Result<(), BackendError> {
        self.enter(ControlPlaneOp::InsertProvisioning).await?;

        let mut tenants = self.tenants.lock().await;
        let database_taken = tenants.values().any(|record| {
            record.descriptor.connection.database == descriptor.connection.database
        });
        if tenants.contains_key(&descriptor.key) || database_taken {
            return Err(BackendError::KeyConflict(descriptor.key.to_string()));
        }

        tenants.insert(
            descriptor.key.clone(),
            TenantRecord {
                descriptor: descriptor.clone(),
                status: TenantStatus::Provisioning,
                activated_at: None,
            },
        );
        Ok(())
    }

    async fn mark_active(&self, key: &TenantKey) -> Result<(), BackendError> {
        self.enter(ControlPlaneOp::MarkActive).await?;

        let mut tenants = self.tenants.lock().await;
        match tenants.get_mut(key) {
            Some(record) if record.status == TenantStatus::Provisioning => {
                record.status = TenantStatus::Active;
                record.activated_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(BackendError::Other(format!(
                "tenant '{}' is not awaiting activation",
                key
            ))),
        }
    }

    async fn get_active(&self, key: &TenantKey) -> Result<Option<TenantDescriptor>, BackendError> {
        self.get_active_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(ControlPlaneOp::GetActive).await?;

        Ok(self
            .tenants
            .lock()
            .await
            .get(key)
            .filter(|record| record.status == TenantStatus::Active)
            .map(|record| record.descriptor.clone()))
    }

    async fn get(&self, key: &TenantKey) -> Result<Option<TenantRecord>, BackendError> {
        self.enter(ControlPlaneOp::Get).await?;
        Ok(self.tenants.lock().await.get(key).cloned())
    }

    async fn delete(&self, key: &TenantKey) -> Result<bool, BackendError> {
        self.enter(ControlPlaneOp::Delete).await?;
        Ok(self.tenants.lock().await.remove(key).is_some())
    }

    async fn list_active(&self) -> Result<Vec<TenantDescriptor>, BackendError> {
        self.enter(ControlPlaneOp::List).await?;

        Ok(self
            .tenants
            .lock()
            .await
            .values()
            .filter(|record| record.status == TenantStatus::Active)
            .map(|record| record.descriptor.clone())
            .collect())
    }

    async fn list_incomplete(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<TenantRecord>, BackendError> {
        self.enter(ControlPlaneOp::List).await?;

        let mut records: Vec<_> = self
            .tenants
            .lock()
            .await
            .values()
            .filter(|record| {
                record.status == TenantStatus::Provisioning
                    && record.descriptor.created_at < created_before
            })
            .cloned()
            .collect();
        records.sort_by_key(|record| record.descriptor.created_at);
        Ok(records)
    }
}
