// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory database server for tests and local development.
//!
//! Tracks which databases exist and how far each has been initialized,
//! without running any SQL.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{DatabaseServer, TenantSchema};
use crate::error::BackendError;
use crate::tenant::ConnectionSpec;

/// Operation of the in-memory server that can be made to fail or stall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    /// [`DatabaseServer::create_database`]
    CreateDatabase,
    /// [`DatabaseServer::drop_database`]
    DropDatabase,
    /// [`TenantSchema::migrate`]
    Migrate,
    /// [`TenantSchema::seed_permissions`]
    SeedPermissions,
}

#[derive(Debug, Clone, Copy, Default)]
struct DatabaseState {
    migrated: bool,
    seeded: bool,
}

/// In-memory database server.
#[derive(Default)]
pub struct MemoryDatabaseServer {
    databases: Mutex<BTreeMap<String, DatabaseState>>,
    failures: StdMutex<HashSet<FailPoint>>,
    delays: StdMutex<HashMap<FailPoint, Duration>>,
}

impl MemoryDatabaseServer {
    /// Create a server with no databases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server whose `point` always fails.
    pub fn failing(point: FailPoint) -> Self {
        let server = Self::new();
        server.fail_on(point);
        server
    }

    /// Make `point` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, point: FailPoint) {
        lock(&self.failures).insert(point);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    /// Delay every call of `point` by `delay`.
    pub fn delay(&self, point: FailPoint, delay: Duration) {
        lock(&self.delays).insert(point, delay);
    }

    /// Whether `name` exists.
    pub async fn exists(&self, name: &str) -> bool {
        self.databases.lock().await.contains_key(name)
    }

    /// Whether `name` exists, is migrated and seeded.
    pub async fn is_initialized(&self, name: &str) -> bool {
        self.databases
            .lock()
            .await
            .get(name)
            .is_some_and(|state| state.migrated && state.seeded)
    }

    /// Names of every existing database.
    pub async fn databases(&self) -> Vec<String> {
        self.databases.lock().await.keys().cloned().collect()
    }

    async fn enter(&self, point: FailPoint) -> Result<(), BackendError> {
        let delay = lock(&self.delays).get(&point).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.failures).contains(&point) {
            return Err(BackendError::Other(format!("injected {:?} failure", point)));
        }
        Ok(())
    }

    async fn update(
        &self,
        spec: &ConnectionSpec,
        apply: impl FnOnce(&mut DatabaseState),
    ) -> Result<(), BackendError> {
        let mut databases = self.databases.lock().await;
        let state = databases.get_mut(&spec.database).ok_or_else(|| {
            BackendError::Unavailable(format!("database '{}' does not exist", spec.database))
        })?;
        apply(state);
        Ok(())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl DatabaseServer for MemoryDatabaseServer {
    async fn create_database(&self, name: &str) -> Result<(), BackendError> {
        self.enter(FailPoint::CreateDatabase).await?;

        let mut databases = self.databases.lock().await;
        if databases.contains_key(name) {
            return Err(BackendError::DatabaseExists(name.to_string()));
        }
        databases.insert(name.to_string(), DatabaseState::default());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<(), BackendError> {
        self.enter(FailPoint::DropDatabase).await?;
        self.databases.lock().await.remove(name);
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool, BackendError> {
        Ok(self.exists(name).await)
    }
}

#[async_trait]
impl TenantSchema for MemoryDatabaseServer {
    async fn migrate(&self, spec: &ConnectionSpec) -> Result<(), BackendError> {
        self.enter(FailPoint::Migrate).await?;
        self.update(spec, |state| state.migrated = true).await
    }

    async fn seed_permissions(&self, spec: &ConnectionSpec) -> Result<(), BackendError> {
        self.enter(FailPoint::SeedPermissions).await?;

        let mut databases = self.databases.lock().await;
        match databases.get_mut(&spec.database) {
            Some(state) if state.migrated => {
                state.seeded = true;
                Ok(())
            }
            Some(_) => Err(BackendError::Other(format!(
                "database '{}' has no permission tables",
                spec.database
            ))),
            None => Err(BackendError::Unavailable(format!(
                "database '{}' does not exist",
                spec.database
            ))),
        }
    }
}
