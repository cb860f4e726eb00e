// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-tenant connection pools for downstream data access.

use dashmap::DashMap;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::tenant::TenantKey;

/// One lazily connected pool per tenant.
#[derive(Debug)]
pub struct TenantPools {
    pools: DashMap<TenantKey, PgPool>,
    max_connections: u32,
}

impl TenantPools {
    /// Pools of at most `max_connections` connections each.
    pub fn new(max_connections: u32) -> Self {
        Self {
            pools: DashMap::new(),
            max_connections,
        }
    }

    /// Pool of the tenant bound in `ctx`.
    ///
    /// Must be called within a tokio runtime.
    pub fn pool(&self, ctx: &ExecutionContext) -> PgPool {
        self.pools
            .entry(ctx.key().clone())
            .or_insert_with(|| {
                debug!(tenant = %ctx.key(), "Creating tenant pool");
                PgPoolOptions::new()
                    .max_connections(self.max_connections)
                    .connect_lazy_with(ctx.connect_options())
            })
            .clone()
    }

    /// Pool of the tenant bound to the current scope.
    pub fn current_pool(&self) -> Result<PgPool> {
        Ok(self.pool(&ExecutionContext::current()?))
    }

    /// Forget the pool of `key`, closing its connections.
    pub async fn evict(&self, key: &TenantKey) {
        if let Some((_, pool)) = self.pools.remove(key) {
            pool.close().await;
            debug!(tenant = %key, "Tenant pool closed");
        }
    }

    /// Number of open pools.
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no pool is open.
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
