// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rollback of partially provisioned tenants.
//!
//! Every provisioning step that changes the outside world pushes a matching
//! [`Compensation`] onto a [`CompensationStack`]. On failure the stack is
//! unwound in reverse by the [`RollbackCoordinator`]. Each compensation is
//! attempted regardless of whether earlier ones failed; failures are
//! collected into a [`RollbackFailure`] and logged at the highest severity,
//! because they can leave an orphaned database behind.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument};

use crate::control_plane::ControlPlaneStore;
use crate::database::DatabaseServer;
use crate::error::{BackendError, RollbackFailure, RollbackStep};
use crate::registry::ConnectionRegistry;
use crate::tenant::{ConnectionSpec, TenantKey};

/// Undo action for a completed provisioning step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Drop the physical database created by this attempt.
    DropDatabase,
    /// Remove the registry entry and the control-plane record.
    ForgetTenant,
}

impl Compensation {
    /// Returns the string representation of the compensation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DropDatabase => "drop_database",
            Self::ForgetTenant => "forget_tenant",
        }
    }
}

/// Compensations owed by one provisioning attempt, in push order.
#[derive(Debug, Clone)]
pub struct CompensationStack {
    key: TenantKey,
    spec: ConnectionSpec,
    actions: Vec<Compensation>,
}

impl CompensationStack {
    /// An empty stack for the tenant `key` backed by `spec`.
    pub fn new(key: TenantKey, spec: ConnectionSpec) -> Self {
        Self {
            key,
            spec,
            actions: Vec::new(),
        }
    }

    /// The full stack for a tenant that got as far as registration.
    pub fn full(key: TenantKey, spec: ConnectionSpec) -> Self {
        let mut stack = Self::new(key, spec);
        stack.push(Compensation::DropDatabase);
        stack.push(Compensation::ForgetTenant);
        stack
    }

    /// Record that the step undone by `action` has happened.
    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    /// Pending actions, in push order.
    pub fn actions(&self) -> &[Compensation] {
        &self.actions
    }

    /// Whether nothing needs undoing.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// The tenant key.
    pub fn key(&self) -> &TenantKey {
        &self.key
    }

    /// The connection spec being rolled back.
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }
}

/// Restores the "tenant never existed" state.
pub struct RollbackCoordinator {
    registry: Arc<ConnectionRegistry>,
    control_plane: Arc<dyn ControlPlaneStore>,
    server: Arc<dyn DatabaseServer>,
    protected_database: String,
    step_timeout: Duration,
}

impl std::fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("protected_database", &self.protected_database)
            .field("step_timeout", &self.step_timeout)
            .finish_non_exhaustive()
    }
}

impl RollbackCoordinator {
    /// Create a coordinator.
    ///
    /// `protected_database` is the control-plane database; any attempt to
    /// drop it panics.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        control_plane: Arc<dyn ControlPlaneStore>,
        server: Arc<dyn DatabaseServer>,
        protected_database: impl Into<String>,
        step_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            control_plane,
            server,
            protected_database: protected_database.into(),
            step_timeout,
        }
    }

    /// Remove every trace of `key`: registry entry, control-plane record
    /// and the database named in `spec`.
    ///
    /// Idempotent. Calling it for a tenant that does not exist succeeds.
    pub async fn rollback(
        &self,
        key: &TenantKey,
        spec: &ConnectionSpec,
    ) -> Result<(), RollbackFailure> {
        self.unwind(CompensationStack::full(key.clone(), spec.clone()))
            .await
    }

    /// Run the compensations of `stack` in reverse push order.
    #[instrument(skip(self, stack), fields(tenant = %stack.key, database = %stack.spec.database))]
    pub async fn unwind(&self, stack: CompensationStack) -> Result<(), RollbackFailure> {
        let CompensationStack { key, spec, actions } = stack;
        let mut failures = Vec::new();

        for action in actions.into_iter().rev() {
            match action {
                Compensation::ForgetTenant => {
                    self.registry.unregister(&key);
                    if let Err(e) = self.bounded(self.control_plane.delete(&key)).await {
                        failures.push((RollbackStep::DeleteRecord, e.to_string()));
                    }
                }
                Compensation::DropDatabase => {
                    if spec.database == self.protected_database {
                        panic!(
                            "refusing to drop control-plane database '{}' while rolling back tenant '{}'",
                            spec.database, key
                        );
                    }
                    if let Err(e) = self.bounded(self.server.drop_database(&spec.database)).await {
                        failures.push((RollbackStep::DropDatabase, e.to_string()));
                    }
                }
            }
        }

        if failures.is_empty() {
            info!("Rollback complete");
            return Ok(());
        }

        let failure = RollbackFailure {
            key: key.to_string(),
            database: spec.database.clone(),
            failures,
        };
        for (step, reason) in &failure.failures {
            error!(
                step = %step,
                error = %reason,
                severity = "critical",
                operator_action_required = true,
                "Rollback step failed"
            );
        }
        if failure.orphaned_database() {
            error!(
                severity = "critical",
                operator_action_required = true,
                "Tenant database may be orphaned and needs manual cleanup"
            );
        }

        Err(failure)
    }

    async fn bounded<T>(
        &self,
        step: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.step_timeout, step).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.step_timeout)),
        }
    }
}
