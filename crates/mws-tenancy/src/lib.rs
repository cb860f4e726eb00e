// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MWS Tenancy - Tenant Database Lifecycle and Request Routing
//!
//! Every tenant (store operator) of the MWS application store owns a
//! dedicated PostgreSQL database. This crate provisions those databases,
//! keeps track of where they live, and binds each inbound unit of work to the
//! right one.
//!
//! # Architecture
//!
//! ```text
//!   inbound request ──► RequestRouter ──► ConnectionRegistry ──miss──► ControlPlaneStore
//!                            │                    ▲                         ▲
//!                            ▼                    │ register / activate     │
//!                    ExecutionContext             │                         │
//!                  (task-local, per request)   Provisioner ─── failure ──► RollbackCoordinator
//!                            │                    │                         │
//!                            ▼                    ▼                         ▼
//!                        TenantPools        DatabaseServer / TenantSchema (create, migrate,
//!                                                                    seed, drop)
//! ```
//!
//! # Components
//!
//! | Component | Module | Purpose |
//! |-----------|--------|---------|
//! | Connection Registry | [`registry`] | Concurrent key → connection spec cache over the control plane |
//! | Control-Plane Store | [`control_plane`] | Durable `tenants` table; its unique key is the final word on duplicates |
//! | Provisioner | [`provisioner`] | Create → register → migrate → seed → activate |
//! | Rollback Coordinator | [`rollback`] | Compensation stack undoing partial provisioning |
//! | Request Router | [`router`] | Host → tenant key → bound [`ExecutionContext`] |
//!
//! # Tenant Lifecycle
//!
//! A control-plane row is written in `provisioning` state right after the
//! database is created, so a crash before activation is detectable on the
//! next start ([`Provisioner::recover_incomplete`]). Only `active` tenants
//! resolve on lookup; a half-provisioned tenant is never routable.
//!
//! # Configuration
//!
//! See [`Config::from_env`] for the environment variables read by
//! [`Tenancy::connect`] and the `mws-admin` binary.

#![deny(missing_docs)]

/// Configuration loading from environment variables.
pub mod config;

/// Execution context bound to a unit of work.
pub mod context;

/// Control-plane store trait and backends.
pub mod control_plane;

/// Database server and tenant schema traits and backends.
pub mod database;

/// Error types.
pub mod error;

/// axum middleware and extractor.
#[cfg(feature = "http")]
pub mod http;

/// Embedded migrations.
pub mod migrations;

/// Tenant database naming convention.
pub mod naming;

/// Per-tenant connection pools.
pub mod pools;

/// Tenant provisioning.
pub mod provisioner;

/// Connection registry.
pub mod registry;

/// Rollback coordinator and compensation stack.
pub mod rollback;

/// Request router.
pub mod router;

/// Component wiring.
pub mod runtime;

/// Tenant identity and connection types.
pub mod tenant;

pub use config::{Config, ConfigError};
pub use context::ExecutionContext;
pub use control_plane::{ControlPlaneStore, MemoryControlPlane, PostgresControlPlane, TenantRecord};
pub use database::{DatabaseServer, MemoryDatabaseServer, PostgresServer, TenantSchema};
pub use error::{BackendError, ProvisionStep, Result, RollbackFailure, RollbackStep, TenancyError};
pub use naming::TenantDatabaseNaming;
pub use pools::TenantPools;
pub use provisioner::{Provisioner, RecoveryReport};
pub use registry::ConnectionRegistry;
pub use rollback::{Compensation, CompensationStack, RollbackCoordinator};
pub use router::{RequestRouter, UnitOfWork, tenant_key_from_host};
pub use runtime::{Tenancy, TenancyBuilder};
pub use tenant::{ConnectionSpec, NewTenant, TenantDescriptor, TenantKey, TenantStatus};
