// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tenant provisioning.
//!
//! Turns a validated [`NewTenant`] request into a fully operational tenant:
//!
//! 1. create the physical database
//! 2. register it (registry reservation + `provisioning` control-plane row)
//! 3. run tenant schema migrations
//! 4. seed baseline permissions
//! 5. activate (control-plane row becomes `active`, registry slot routable)
//!
//! Each remote step runs under the configured step timeout; a timeout is
//! treated like any other failure. On failure the compensations pushed so
//! far are unwound and the caller gets [`TenancyError::Provisioning`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{Instrument, error, info, instrument, warn};

use crate::control_plane::ControlPlaneStore;
use crate::database::{DatabaseServer, TenantSchema};
use crate::error::{
    BackendError, ProvisionStep, Result, RollbackFailure, RollbackStep, TenancyError,
};
use crate::naming::TenantDatabaseNaming;
use crate::registry::ConnectionRegistry;
use crate::rollback::{Compensation, CompensationStack, RollbackCoordinator};
use crate::tenant::{NewTenant, TenantDescriptor, TenantKey};

/// Outcome of [`Provisioner::recover_incomplete`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Tenants whose leftovers were removed.
    pub recovered: Vec<TenantKey>,
    /// Tenants whose cleanup failed and need an operator.
    pub failed: Vec<RollbackFailure>,
}

/// Creates tenants.
#[derive(Clone)]
pub struct Provisioner {
    registry: Arc<ConnectionRegistry>,
    control_plane: Arc<dyn ControlPlaneStore>,
    server: Arc<dyn DatabaseServer>,
    schema: Arc<dyn TenantSchema>,
    naming: TenantDatabaseNaming,
    coordinator: Arc<RollbackCoordinator>,
    step_timeout: Duration,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("naming", &self.naming)
            .field("step_timeout", &self.step_timeout)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Create a provisioner.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        control_plane: Arc<dyn ControlPlaneStore>,
        server: Arc<dyn DatabaseServer>,
        schema: Arc<dyn TenantSchema>,
        naming: TenantDatabaseNaming,
        coordinator: Arc<RollbackCoordinator>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            control_plane,
            server,
            schema,
            naming,
            coordinator,
            step_timeout,
        }
    }

    /// Provision a new tenant.
    ///
    /// Fails with [`TenancyError::DuplicateTenant`] if the key is taken,
    /// including when a concurrent call for the same key wins. Such a loser
    /// never touches the winner's database or record.
    ///
    /// The attempt runs on its own task. Dropping the returned future does
    /// not interrupt it: it still completes or rolls back. Only a process
    /// crash leaves a `provisioning` row behind, which
    /// [`recover_incomplete`](Self::recover_incomplete) cleans up.
    pub async fn provision(&self, request: &NewTenant) -> Result<TenantDescriptor> {
        let provisioner = self.clone();
        let request = request.clone();
        let attempt = tokio::spawn(
            async move { provisioner.attempt(&request).await }.in_current_span(),
        );

        match attempt.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(TenancyError::Backend(BackendError::Other(format!(
                "provisioning task cancelled: {}",
                e
            )))),
        }
    }

    #[instrument(skip(self, request), fields(tenant = %request.key))]
    async fn attempt(&self, request: &NewTenant) -> Result<TenantDescriptor> {
        let (key, display_name, contact_email) = request.validate()?;

        if self.registry.contains(&key) {
            warn!("Rejecting provisioning of key already in registry");
            return Err(TenancyError::DuplicateTenant {
                key: key.to_string(),
            });
        }

        let spec = self.naming.spec_for(&key);
        if spec.database == self.naming.protected_database() {
            return Err(TenancyError::InvalidTenantKey {
                key: key.to_string(),
                reason: "collides with the control-plane database",
            });
        }

        info!(database = %spec.database, "Provisioning tenant");

        let descriptor = TenantDescriptor {
            key: key.clone(),
            display_name,
            contact_email,
            connection: spec.clone(),
            created_at: Utc::now(),
        };
        let mut stack = CompensationStack::new(key.clone(), spec.clone());

        match self.bounded(self.server.create_database(&spec.database)).await {
            Ok(()) => stack.push(Compensation::DropDatabase),
            Err(BackendError::DatabaseExists(_)) => {
                warn!(database = %spec.database, "Tenant database already exists");
                return Err(TenancyError::DuplicateTenant {
                    key: key.to_string(),
                });
            }
            Err(cause @ BackendError::Timeout(_)) => {
                // The server may still create it; this attempt cannot tell
                // whether the database is ours to drop.
                let rollback = RollbackFailure {
                    key: key.to_string(),
                    database: spec.database.clone(),
                    failures: vec![(
                        RollbackStep::DropDatabase,
                        "database creation outcome unknown".to_string(),
                    )],
                };
                error!(
                    database = %spec.database,
                    severity = "critical",
                    operator_action_required = true,
                    "Database creation timed out, database may be orphaned"
                );
                return Err(TenancyError::Provisioning {
                    key: key.to_string(),
                    step: ProvisionStep::CreateDatabase,
                    cause,
                    rollback: Some(rollback),
                });
            }
            Err(cause) => {
                return Err(self.fail(stack, ProvisionStep::CreateDatabase, cause).await);
            }
        }

        match tokio::time::timeout(self.step_timeout, self.registry.register(&descriptor)).await {
            Ok(Ok(())) => stack.push(Compensation::ForgetTenant),
            Ok(Err(TenancyError::DuplicateTenant { .. })) => {
                // We created the database, so the conflicting record is stale
                // and not ours; only undo our own database.
                warn!("Control plane holds a record for this key");
                if let Err(failure) = self.coordinator.unwind(stack).await {
                    return Err(TenancyError::RollbackFailed(failure));
                }
                return Err(TenancyError::DuplicateTenant {
                    key: key.to_string(),
                });
            }
            Ok(Err(e)) => {
                // The insert may have committed before failing. Owning the
                // database name means any record with this key is ours.
                stack.push(Compensation::ForgetTenant);
                return Err(self.fail(stack, ProvisionStep::Register, into_cause(e)).await);
            }
            Err(_) => {
                stack.push(Compensation::ForgetTenant);
                let cause = BackendError::Timeout(self.step_timeout);
                return Err(self.fail(stack, ProvisionStep::Register, cause).await);
            }
        }

        if let Err(cause) = self.bounded(self.schema.migrate(&spec)).await {
            return Err(self.fail(stack, ProvisionStep::Migrate, cause).await);
        }

        if let Err(cause) = self.bounded(self.schema.seed_permissions(&spec)).await {
            return Err(self.fail(stack, ProvisionStep::SeedPermissions, cause).await);
        }

        match tokio::time::timeout(self.step_timeout, self.registry.activate(&descriptor)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(self.fail(stack, ProvisionStep::Activate, into_cause(e)).await);
            }
            Err(_) => {
                let cause = BackendError::Timeout(self.step_timeout);
                return Err(self.fail(stack, ProvisionStep::Activate, cause).await);
            }
        }

        info!(database = %spec.database, "Tenant provisioned");
        Ok(descriptor)
    }

    /// Roll back every tenant stuck in `provisioning` for longer than
    /// `grace`, e.g. after a crash mid-provisioning.
    ///
    /// `grace` must exceed the longest provisioning still in flight on any
    /// process, or a live attempt will be torn down under it.
    #[instrument(skip(self))]
    pub async fn recover_incomplete(&self, grace: Duration) -> Result<RecoveryReport> {
        let grace = chrono::Duration::from_std(grace).map_err(|_| TenancyError::InvalidRequest {
            field: "grace",
            message: "is out of range".to_string(),
        })?;
        let incomplete = self.control_plane.list_incomplete(Utc::now() - grace).await?;

        let mut report = RecoveryReport::default();
        for record in incomplete {
            let descriptor = record.descriptor;
            warn!(
                tenant = %descriptor.key,
                database = %descriptor.connection.database,
                created_at = %descriptor.created_at,
                "Rolling back incomplete tenant"
            );

            match self
                .coordinator
                .rollback(&descriptor.key, &descriptor.connection)
                .await
            {
                Ok(()) => report.recovered.push(descriptor.key),
                Err(failure) => report.failed.push(failure),
            }
        }

        info!(
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "Recovery finished"
        );
        Ok(report)
    }

    async fn bounded(
        &self,
        step: impl Future<Output = std::result::Result<(), BackendError>>,
    ) -> std::result::Result<(), BackendError> {
        match tokio::time::timeout(self.step_timeout, step).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.step_timeout)),
        }
    }

    async fn fail(
        &self,
        stack: CompensationStack,
        step: ProvisionStep,
        cause: BackendError,
    ) -> TenancyError {
        let key = stack.key().to_string();
        error!(step = %step, error = %cause, "Provisioning step failed, rolling back");

        let rollback = self.coordinator.unwind(stack).await.err();
        TenancyError::Provisioning {
            key,
            step,
            cause,
            rollback,
        }
    }
}

fn into_cause(err: TenancyError) -> BackendError {
    match err {
        TenancyError::Backend(cause) => cause,
        other => BackendError::Other(other.to_string()),
    }
}
