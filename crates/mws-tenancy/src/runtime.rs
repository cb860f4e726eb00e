// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wiring of the tenancy subsystem.
//!
//! [`Tenancy`] owns one instance of every component and is what the
//! application and the `mws-admin` CLI hold on to.
//!
//! # Example
//!
//! ```rust,ignore
//! use mws_tenancy::{Config, NewTenant, Tenancy};
//!
//! let tenancy = Tenancy::connect(&Config::from_env()?).await?;
//! tenancy.warm_registry().await?;
//!
//! let acme = tenancy
//!     .provision(&NewTenant::new("Acme", "acme", "ops@acme.com"))
//!     .await?;
//!
//! tenancy
//!     .router()
//!     .run("acme.example.com", |ctx| async move {
//!         // every query in here goes to acme's database
//!     })
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::config::{Config, ConfigError};
use crate::control_plane::{ControlPlaneStore, PostgresControlPlane};
use crate::database::{DatabaseServer, PostgresServer, TenantSchema};
use crate::error::{BackendError, Result};
use crate::migrations;
use crate::naming::TenantDatabaseNaming;
use crate::pools::TenantPools;
use crate::provisioner::{Provisioner, RecoveryReport};
use crate::registry::ConnectionRegistry;
use crate::rollback::RollbackCoordinator;
use crate::router::RequestRouter;
use crate::tenant::{ConnectionSpec, NewTenant, TenantDescriptor, TenantKey};

/// Builder for [`Tenancy`].
pub struct TenancyBuilder {
    naming: TenantDatabaseNaming,
    control_plane: Option<Arc<dyn ControlPlaneStore>>,
    server: Option<Arc<dyn DatabaseServer>>,
    schema: Option<Arc<dyn TenantSchema>>,
    step_timeout: Duration,
    lookup_timeout: Duration,
    max_connections: u32,
}

impl std::fmt::Debug for TenancyBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenancyBuilder")
            .field("naming", &self.naming)
            .field("control_plane", &self.control_plane.as_ref().map(|_| "..."))
            .field("server", &self.server.as_ref().map(|_| "..."))
            .field("schema", &self.schema.as_ref().map(|_| "..."))
            .field("step_timeout", &self.step_timeout)
            .field("lookup_timeout", &self.lookup_timeout)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl TenancyBuilder {
    /// Start a builder for tenants named by `naming`.
    pub fn new(naming: TenantDatabaseNaming) -> Self {
        Self {
            naming,
            control_plane: None,
            server: None,
            schema: None,
            step_timeout: Duration::from_secs(60),
            lookup_timeout: Duration::from_millis(2000),
            max_connections: 10,
        }
    }

    /// Set the control-plane store (required).
    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlaneStore>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    /// Set the database server (required).
    pub fn database_server(mut self, server: Arc<dyn DatabaseServer>) -> Self {
        self.server = Some(server);
        self
    }

    /// Set the tenant schema initializer (required).
    pub fn schema(mut self, schema: Arc<dyn TenantSchema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Use one backend as both database server and schema initializer.
    pub fn backend<B>(self, backend: Arc<B>) -> Self
    where
        B: DatabaseServer + TenantSchema + 'static,
    {
        self.database_server(backend.clone()).schema(backend)
    }

    /// Bound on each provisioning and rollback step.
    ///
    /// Default: 60 seconds
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Bound on control-plane lookups on a registry miss.
    ///
    /// Default: 2 seconds
    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Size of each tenant pool.
    ///
    /// Default: 10
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Wire everything together.
    ///
    /// Returns an error if required components are missing.
    pub fn build(self) -> Result<Tenancy> {
        let control_plane = self
            .control_plane
            .ok_or(ConfigError::Incomplete("control plane"))?;
        let server = self
            .server
            .ok_or(ConfigError::Incomplete("database server"))?;
        let schema = self.schema.ok_or(ConfigError::Incomplete("tenant schema"))?;

        let registry = Arc::new(ConnectionRegistry::new(
            control_plane.clone(),
            self.lookup_timeout,
        ));
        let coordinator = Arc::new(RollbackCoordinator::new(
            registry.clone(),
            control_plane.clone(),
            server.clone(),
            self.naming.protected_database(),
            self.step_timeout,
        ));
        let provisioner = Arc::new(Provisioner::new(
            registry.clone(),
            control_plane.clone(),
            server,
            schema.clone(),
            self.naming.clone(),
            coordinator.clone(),
            self.step_timeout,
        ));

        Ok(Tenancy {
            router: RequestRouter::new(registry.clone()),
            registry,
            control_plane,
            provisioner,
            coordinator,
            schema,
            pools: Arc::new(TenantPools::new(self.max_connections)),
            naming: self.naming,
        })
    }
}

/// The tenancy subsystem.
#[derive(Clone)]
pub struct Tenancy {
    registry: Arc<ConnectionRegistry>,
    control_plane: Arc<dyn ControlPlaneStore>,
    router: RequestRouter,
    provisioner: Arc<Provisioner>,
    coordinator: Arc<RollbackCoordinator>,
    schema: Arc<dyn TenantSchema>,
    pools: Arc<TenantPools>,
    naming: TenantDatabaseNaming,
}

impl std::fmt::Debug for Tenancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenancy")
            .field("registry", &self.registry)
            .field("naming", &self.naming)
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl Tenancy {
    /// Create a new builder.
    pub fn builder(naming: TenantDatabaseNaming) -> TenancyBuilder {
        TenancyBuilder::new(naming)
    }

    /// Connect to the control plane described by `config`, apply its
    /// migrations and wire PostgreSQL backends.
    pub async fn connect(config: &Config) -> Result<Self> {
        info!(
            host = %config.control_plane.host,
            port = config.control_plane.port,
            database = %config.control_plane.database,
            "Connecting to control plane"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(config.control_plane.connect_options())
            .await
            .map_err(BackendError::from)?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(BackendError::from)?;

        migrations::run_control_plane(&pool)
            .await
            .map_err(BackendError::from)?;
        info!("Control-plane migrations applied");

        Self::builder(TenantDatabaseNaming::from_config(config))
            .control_plane(Arc::new(PostgresControlPlane::new(pool.clone())))
            .backend(Arc::new(PostgresServer::new(pool)))
            .step_timeout(config.step_timeout)
            .lookup_timeout(config.lookup_timeout)
            .max_connections(config.max_connections)
            .build()
    }

    /// Load every active tenant into the registry.
    pub async fn warm_registry(&self) -> Result<usize> {
        self.registry.warm().await
    }

    /// Provision a new tenant. See [`Provisioner::provision`].
    pub async fn provision(&self, request: &NewTenant) -> Result<TenantDescriptor> {
        self.provisioner.provision(request).await
    }

    /// Remove every trace of `key`, active or not.
    ///
    /// Uses the recorded connection spec when the control plane has one and
    /// the naming convention otherwise.
    pub async fn rollback(&self, key: &TenantKey) -> Result<()> {
        let spec = self.recorded_spec(key).await?;
        self.pools.evict(key).await;
        self.coordinator.rollback(key, &spec).await?;
        Ok(())
    }

    /// Roll back tenants stuck in provisioning. See
    /// [`Provisioner::recover_incomplete`].
    pub async fn recover_incomplete(&self, grace: Duration) -> Result<RecoveryReport> {
        self.provisioner.recover_incomplete(grace).await
    }

    async fn recorded_spec(&self, key: &TenantKey) -> Result<ConnectionSpec> {
        match self.control_plane.get(key).await? {
            Some(record) => Ok(record.descriptor.connection),
            None => Ok(self.naming.spec_for(key)),
        }
    }

    /// A router over this tenancy's registry.
    pub fn router(&self) -> RequestRouter {
        self.router.clone()
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The control-plane store.
    pub fn control_plane(&self) -> &Arc<dyn ControlPlaneStore> {
        &self.control_plane
    }

    /// The provisioner.
    pub fn provisioner(&self) -> &Arc<Provisioner> {
        &self.provisioner
    }

    /// The rollback coordinator.
    pub fn coordinator(&self) -> &Arc<RollbackCoordinator> {
        &self.coordinator
    }

    /// Tenant schema initializer, for re-running migrations or seeding.
    pub fn schema(&self) -> &Arc<dyn TenantSchema> {
        &self.schema
    }

    /// Per-tenant pools for downstream data access.
    pub fn pools(&self) -> &Arc<TenantPools> {
        &self.pools
    }

    /// The naming convention for tenant databases.
    pub fn naming(&self) -> &TenantDatabaseNaming {
        &self.naming
    }
}
