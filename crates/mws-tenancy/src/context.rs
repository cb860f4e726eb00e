// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution context: which tenant database the current unit of work uses.
//!
//! The router hands an [`ExecutionContext`] to the handler explicitly. Code
//! that cannot take it as a parameter reads it with
//! [`ExecutionContext::current`], which only sees a context bound by
//! [`ExecutionContext::scope`] around the very future being polled.
//!
//! The binding is per task, not per thread: two requests multiplexed on the
//! same worker thread each see their own context, and the binding is gone
//! once the scoped future completes, fails or is dropped. Tasks spawned
//! from inside a scope do not inherit it; pass the context along instead.

use std::future::Future;
use std::sync::Arc;

use sqlx::postgres::PgConnectOptions;
use tokio::task::futures::TaskLocalFuture;

use crate::error::{Result, TenancyError};
use crate::tenant::{ConnectionSpec, TenantKey};

tokio::task_local! {
    static CURRENT: ExecutionContext;
}

/// The tenant a unit of work is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    key: TenantKey,
    connection: Arc<ConnectionSpec>,
}

impl ExecutionContext {
    /// Bind `key` to `connection`.
    pub fn new(key: TenantKey, connection: Arc<ConnectionSpec>) -> Self {
        Self { key, connection }
    }

    /// Tenant key.
    pub fn key(&self) -> &TenantKey {
        &self.key
    }

    /// Connection spec of the tenant database.
    pub fn connection(&self) -> &ConnectionSpec {
        &self.connection
    }

    /// Shared handle to the connection spec.
    pub fn connection_arc(&self) -> Arc<ConnectionSpec> {
        Arc::clone(&self.connection)
    }

    /// sqlx connect options for the tenant database.
    pub fn connect_options(&self) -> PgConnectOptions {
        self.connection.connect_options()
    }

    /// Run `future` with this context bound for its whole lifetime.
    pub fn scope<F: Future>(self, future: F) -> TaskLocalFuture<ExecutionContext, F> {
        CURRENT.scope(self, future)
    }

    /// Context bound to the currently running scope.
    ///
    /// Fails with [`TenancyError::Unrouted`] outside of any scope.
    pub fn current() -> Result<ExecutionContext> {
        CURRENT
            .try_with(Clone::clone)
            .map_err(|_| TenancyError::Unrouted)
    }

    /// Whether a context is bound to the currently running scope.
    pub fn is_bound() -> bool {
        CURRENT.try_with(|_| ()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn context(key: &str) -> ExecutionContext {
        ExecutionContext::new(
            TenantKey::parse(key).unwrap(),
            Arc::new(ConnectionSpec {
                host: "localhost".to_string(),
                port: 5432,
                database: format!("mws_{}_db", key),
                user: "mws".to_string(),
                password: String::new(),
                options: BTreeMap::new(),
            }),
        )
    }

    #[tokio::test]
    async fn test_unbound_outside_scope() {
        assert!(!ExecutionContext::is_bound());
        assert!(matches!(
            ExecutionContext::current(),
            Err(TenancyError::Unrouted)
        ));
    }

    #[tokio::test]
    async fn test_bound_inside_scope_only() {
        let acme = context("acme");
        let seen = acme
            .clone()
            .scope(async { ExecutionContext::current().unwrap() })
            .await;

        assert_eq!(seen, acme);
        assert!(!ExecutionContext::is_bound());
    }

    #[tokio::test]
    async fn test_cleared_after_error() {
        let result: std::result::Result<(), &str> = context("acme")
            .scope(async {
                assert!(ExecutionContext::is_bound());
                Err("handler failed")
            })
            .await;

        assert!(result.is_err());
        assert!(!ExecutionContext::is_bound());
    }

    #[tokio::test]
    async fn test_nested_scope_restores_outer() {
        let outer = context("outer");
        let inner = context("inner");

        outer
            .clone()
            .scope(async move {
                let seen = inner
                    .clone()
                    .scope(async { ExecutionContext::current().unwrap() })
                    .await;
                assert_eq!(seen, inner);
                assert_eq!(ExecutionContext::current().unwrap(), outer);
            })
            .await;
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit() {
        context("acme")
            .scope(async {
                let bound = tokio::spawn(async { ExecutionContext::is_bound() })
                    .await
                    .unwrap();
                assert!(!bound);
            })
            .await;
    }
}
