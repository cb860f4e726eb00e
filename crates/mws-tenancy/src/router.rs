// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request Router
//!
//! Derives the tenant key of an inbound unit of work from its host name,
//! resolves it through the [`ConnectionRegistry`] and binds the resulting
//! [`ExecutionContext`] around the handler.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::{Result, TenancyError};
use crate::registry::ConnectionRegistry;
use crate::tenant::TenantKey;

/// Anything that names the host it was addressed to.
pub trait UnitOfWork {
    /// Host the unit of work was addressed to, possibly with a port.
    fn host(&self) -> Option<&str>;
}

impl UnitOfWork for str {
    fn host(&self) -> Option<&str> {
        Some(self)
    }
}

impl UnitOfWork for String {
    fn host(&self) -> Option<&str> {
        Some(self.as_str())
    }
}

#[cfg(feature = "http")]
impl UnitOfWork for axum::http::request::Parts {
    fn host(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri.host())
    }
}

#[cfg(feature = "http")]
impl<B> UnitOfWork for axum::http::Request<B> {
    fn host(&self) -> Option<&str> {
        self.headers()
            .get(axum::http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| self.uri().host())
    }
}

/// Tenant key named by the lowest-level label of `host`.
///
/// `acme.example.com:8443` yields `acme`. Returns `None` when that label is
/// not a valid key.
pub fn tenant_key_from_host(host: &str) -> Option<TenantKey> {
    let host = host.trim().split(':').next()?;
    let label = host.split('.').next()?;
    TenantKey::parse(label.to_ascii_lowercase()).ok()
}

/// Binds units of work to their tenant.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    registry: Arc<ConnectionRegistry>,
}

impl RequestRouter {
    /// Route through `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Resolve the execution context of `unit`.
    ///
    /// A host that does not name a valid key is reported exactly like a
    /// valid key nobody registered: [`TenancyError::UnknownTenant`].
    pub async fn route<U: UnitOfWork + ?Sized>(&self, unit: &U) -> Result<ExecutionContext> {
        let host = unit.host().unwrap_or_default();
        let Some(key) = tenant_key_from_host(host) else {
            debug!(host, "Host does not name a tenant");
            return Err(TenancyError::UnknownTenant {
                key: host.to_string(),
            });
        };

        let connection = self.registry.lookup(&key).await?;
        debug!(tenant = %key, "Unit of work routed");
        Ok(ExecutionContext::new(key, connection))
    }

    /// Route `unit` and run `handler` with its context bound.
    ///
    /// The context is passed to `handler` and is also visible through
    /// [`ExecutionContext::current`] until the handler's future finishes.
    pub async fn run<U, F, Fut>(&self, unit: &U, handler: F) -> Result<Fut::Output>
    where
        U: UnitOfWork + ?Sized,
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future,
    {
        let ctx = self.route(unit).await?;
        Ok(ctx.clone().scope(handler(ctx)).await)
    }

    /// Bind `key` explicitly and run `handler`, for administrative work
    /// outside the request path.
    pub async fn enter<F, Fut>(&self, key: &TenantKey, handler: F) -> Result<Fut::Output>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future,
    {
        let connection = self.registry.lookup(key).await?;
        let ctx = ExecutionContext::new(key.clone(), connection);
        debug!(tenant = %key, "Execution context entered");
        Ok(ctx.clone().scope(handler(ctx)).await)
    }

    /// The registry routed through.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
