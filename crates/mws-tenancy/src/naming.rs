// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic mapping from tenant key to physical database.

use crate::config::Config;
use crate::tenant::{ConnectionSpec, TenantKey};

const DATABASE_PREFIX: &str = "mws_";
const DATABASE_SUFFIX: &str = "_db";

/// Derives the [`ConnectionSpec`] of a tenant from its key.
///
/// Database names are `mws_<key>_db` with `-` replaced by `_`. Keys never
/// contain `_`, so the mapping is injective and no two tenants share a
/// database.
#[derive(Debug, Clone)]
pub struct TenantDatabaseNaming {
    template: ConnectionSpec,
}

impl TenantDatabaseNaming {
    /// Use the server, credentials and options of `template` for every tenant.
    ///
    /// `template.database` is the control-plane database and is never
    /// produced by [`spec_for`](Self::spec_for).
    pub fn new(template: ConnectionSpec) -> Self {
        Self { template }
    }

    /// Tenant databases live next to the control plane unless
    /// `MWS_TENANT_DB_HOST`/`MWS_TENANT_DB_PORT` say otherwise.
    pub fn from_config(config: &Config) -> Self {
        let mut template = config.control_plane.clone();
        if let Some(host) = &config.tenant_host {
            template.host = host.clone();
        }
        if let Some(port) = config.tenant_port {
            template.port = port;
        }
        Self { template }
    }

    /// Physical database name for `key`.
    pub fn database_name(key: &TenantKey) -> String {
        format!(
            "{}{}{}",
            DATABASE_PREFIX,
            key.as_str().replace('-', "_"),
            DATABASE_SUFFIX
        )
    }

    /// Full connection spec for `key`.
    pub fn spec_for(&self, key: &TenantKey) -> ConnectionSpec {
        self.template.with_database(Self::database_name(key))
    }

    /// The control-plane database name. Never provisioned or dropped.
    pub fn protected_database(&self) -> &str {
        &self.template.database
    }
}
