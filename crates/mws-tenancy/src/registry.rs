// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connection Registry
//!
//! Process-local, concurrency-safe map from tenant key to connection spec.
//! Acts as a write-through cache over the [`ControlPlaneStore`]: misses are
//! resolved against the control plane under a short timeout.
//!
//! A key registered by an in-flight provisioning is held in a reserved slot.
//! Reserved slots block a second registration of the same key in this
//! process but never resolve on lookup, so a tenant is only routable once
//! [`activate`](ConnectionRegistry::activate) has run.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::control_plane::ControlPlaneStore;
use crate::error::{BackendError, Result, TenancyError};
use crate::tenant::{ConnectionSpec, TenantDescriptor, TenantKey};

#[derive(Debug, Clone)]
enum Slot {
    Reserved,
    Active(Arc<ConnectionSpec>),
}

/// A reserved slot, released on drop unless kept.
///
/// Releases the reservation when a registration fails or its future is
/// dropped before the control plane answered.
struct Reservation<'a> {
    slots: &'a DashMap<TenantKey, Slot>,
    key: &'a TenantKey,
    held: bool,
}

impl<'a> Reservation<'a> {
    fn new(slots: &'a DashMap<TenantKey, Slot>, key: &'a TenantKey) -> Self {
        Self {
            slots,
            key,
            held: true,
        }
    }

    fn keep(mut self) {
        self.held = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.slots.remove_if(self.key, |_, slot| matches!(slot, Slot::Reserved));
        }
    }
}

/// Registry of tenant connection specs.
pub struct ConnectionRegistry {
    slots: DashMap<TenantKey, Slot>,
    control_plane: Arc<dyn ControlPlaneStore>,
    lookup_timeout: Duration,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("slots", &self.slots.len())
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry over `control_plane`.
    pub fn new(control_plane: Arc<dyn ControlPlaneStore>, lookup_timeout: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            control_plane,
            lookup_timeout,
        }
    }

    /// Reserve `descriptor.key` and record it in the control plane as
    /// provisioning.
    ///
    /// The control plane's unique constraint decides between concurrent
    /// registrations across processes; the local reservation only rejects
    /// duplicates within this process early. Either way the loser gets
    /// [`TenancyError::DuplicateTenant`].
    pub async fn register(&self, descriptor: &TenantDescriptor) -> Result<()> {
        let key = &descriptor.key;

        let reservation = match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => {
                warn!(tenant = %key, "Rejecting registration of key already in registry");
                return Err(TenancyError::DuplicateTenant {
                    key: key.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Slot::Reserved);
                Reservation::new(&self.slots, key)
            }
        };

        match self.control_plane.insert_provisioning(descriptor).await {
            Ok(()) => {
                reservation.keep();
                info!(
                    tenant = %key,
                    database = %descriptor.connection.database,
                    "Tenant registered"
                );
                Ok(())
            }
            Err(BackendError::KeyConflict(_)) => {
                warn!(tenant = %key, "Control plane already holds this key");
                Err(TenancyError::DuplicateTenant {
                    key: key.to_string(),
                })
            }
            Err(e) => Err(TenancyError::Backend(e)),
        }
    }

    /// Mark a registered tenant active, making it routable.
    pub async fn activate(&self, descriptor: &TenantDescriptor) -> Result<()> {
        self.control_plane.mark_active(&descriptor.key).await?;
        self.slots.insert(
            descriptor.key.clone(),
            Slot::Active(Arc::new(descriptor.connection.clone())),
        );

        info!(tenant = %descriptor.key, "Tenant activated");
        Ok(())
    }

    /// Resolve the connection spec of an active tenant.
    ///
    /// Falls back to the control plane on a miss and caches the result.
    /// Fails with [`TenancyError::UnknownTenant`] if the tenant is not
    /// active anywhere, and with [`TenancyError::RoutingUnavailable`] if the
    /// control plane cannot answer within the lookup timeout.
    pub async fn lookup(&self, key: &TenantKey) -> Result<Arc<ConnectionSpec>> {
        if let Some(slot) = self.slots.get(key) {
            return match slot.value() {
                Slot::Active(spec) => {
                    debug!(tenant = %key, "Registry hit");
                    Ok(Arc::clone(spec))
                }
                Slot::Reserved => Err(TenancyError::UnknownTenant {
                    key: key.to_string(),
                }),
            };
        }

        debug!(tenant = %key, "Registry miss, consulting control plane");
        let descriptor = match tokio::time::timeout(
            self.lookup_timeout,
            self.control_plane.get_active(key),
        )
        .await
        {
            Ok(Ok(Some(descriptor))) => descriptor,
            Ok(Ok(None)) => {
                return Err(TenancyError::UnknownTenant {
                    key: key.to_string(),
                });
            }
            Ok(Err(cause)) => {
                warn!(tenant = %key, error = %cause, "Control plane lookup failed");
                return Err(TenancyError::RoutingUnavailable {
                    key: key.to_string(),
                    cause,
                });
            }
            Err(_) => {
                warn!(
                    tenant = %key,
                    timeout = ?self.lookup_timeout,
                    "Control plane lookup timed out"
                );
                return Err(TenancyError::RoutingUnavailable {
                    key: key.to_string(),
                    cause: BackendError::Timeout(self.lookup_timeout),
                });
            }
        };

        let spec = Arc::new(descriptor.connection);
        match self.slots.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(Slot::Active(Arc::clone(&spec)));
                debug!(tenant = %key, "Registry populated from control plane");
                Ok(spec)
            }
            Entry::Occupied(slot) => match slot.get() {
                Slot::Active(cached) => Ok(Arc::clone(cached)),
                Slot::Reserved => Ok(spec),
            },
        }
    }

    /// Remove the mapping for `key`. No-op if absent.
    pub fn unregister(&self, key: &TenantKey) {
        if self.slots.remove(key).is_some() {
            info!(tenant = %key, "Tenant unregistered");
        }
    }

    /// Whether `key` is registered or reserved in this process.
    ///
    /// Advisory only: a `false` says nothing about other processes.
    pub fn contains(&self, key: &TenantKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Load every active tenant from the control plane. Returns how many
    /// were added.
    pub async fn warm(&self) -> Result<usize> {
        let descriptors = self.control_plane.list_active().await?;

        let mut added = 0;
        for descriptor in descriptors {
            if let Entry::Vacant(slot) = self.slots.entry(descriptor.key) {
                slot.insert(Slot::Active(Arc::new(descriptor.connection)));
                added += 1;
            }
        }

        info!(tenants = added, "Registry warmed from control plane");
        Ok(added)
    }

    /// Number of slots, reserved or active.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::MemoryControlPlane;
    use crate::control_plane::memory::ControlPlaneOp;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn descriptor(key: &str) -> TenantDescriptor {
        TenantDescriptor {
            key: TenantKey::parse(key).unwrap(),
            display_name: key.to_string(),
            contact_email: format!("ops@{}.com", key),
            connection: ConnectionSpec {
                host: "localhost".to_string(),
                port: 5432,
                database: format!("mws_{}_db", key),
                user: "mws".to_string(),
                password: "secret".to_string(),
                options: BTreeMap::new(),
            },
            created_at: Utc::now(),
        }
    }

    fn registry() -> (Arc<MemoryControlPlane>, ConnectionRegistry) {
        let store = Arc::new(MemoryControlPlane::new());
        let registry = ConnectionRegistry::new(store.clone(), Duration::from_millis(50));
        (store, registry)
    }

    #[tokio::test]
    async fn test_reserved_tenant_is_not_routable() {
        let (_store, registry) = registry();
        let acme = descriptor("acme");

        registry.register(&acme).await.unwrap();
        assert!(registry.contains(&acme.key));
        assert!(matches!(
            registry.lookup(&acme.key).await,
            Err(TenancyError::UnknownTenant { .. })
        ));

        registry.activate(&acme).await.unwrap();
        let spec = registry.lookup(&acme.key).await.unwrap();
        assert_eq!(*spec, acme.connection);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (_store, registry) = registry();
        let acme = descriptor("acme");

        registry.register(&acme).await.unwrap();
        let err = registry.register(&acme).await.unwrap_err();
        assert!(matches!(err, TenancyError::DuplicateTenant { .. }));
    }

    #[tokio::test]
    async fn test_control_plane_conflict_releases_reservation() {
        let (store, registry) = registry();
        let acme = descriptor("acme");
        store.insert_provisioning(&acme).await.unwrap();

        let err = registry.register(&acme).await.unwrap_err();
        assert!(matches!(err, TenancyError::DuplicateTenant { .. }));
        assert!(!registry.contains(&acme.key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_registration_releases_reservation() {
        let (store, registry) = registry();
        let acme = descriptor("acme");
        store.delay(ControlPlaneOp::InsertProvisioning, Duration::from_secs(1));

        let dropped =
            tokio::time::timeout(Duration::from_millis(10), registry.register(&acme)).await;
        assert!(dropped.is_err());
        assert!(!registry.contains(&acme.key));
        assert!(store.is_empty().await);

        registry.register(&acme).await.unwrap();
        assert!(registry.contains(&acme.key));
    }

    #[tokio::test]
    async fn test_failed_registration_releases_reservation() {
        let (store, registry) = registry();
        let acme = descriptor("acme");
        store.fail_on(ControlPlaneOp::InsertProvisioning);

        let err = registry.register(&acme).await.unwrap_err();
        assert!(matches!(err, TenancyError::Backend(_)));
        assert!(!registry.contains(&acme.key));
    }

    #[tokio::test]
    async fn test_miss_populates_cache() {
        let (store, registry) = registry();
        let acme = descriptor("acme");
        store.insert_provisioning(&acme).await.unwrap();
        store.mark_active(&acme.key).await.unwrap();

        registry.lookup(&acme.key).await.unwrap();
        registry.lookup(&acme.key).await.unwrap();
        assert_eq!(store.get_active_calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let (_store, registry) = registry();
        let err = registry
            .lookup(&TenantKey::parse("ghost").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::UnknownTenant { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_control_plane_down_is_routing_unavailable() {
        let (store, registry) = registry();
        store.set_unavailable(true);

        let err = registry
            .lookup(&TenantKey::parse("acme").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TenancyError::RoutingUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_control_plane_times_out() {
        let (store, registry) = registry();
        store.delay(ControlPlaneOp::GetActive, Duration::from_secs(30));

        let err = registry
            .lookup(&TenantKey::parse("acme").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TenancyError::RoutingUnavailable {
                cause: BackendError::Timeout(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let (_store, registry) = registry();
        let acme = descriptor("acme");
        registry.register(&acme).await.unwrap();

        registry.unregister(&acme.key);
        registry.unregister(&acme.key);
        assert!(!registry.contains(&acme.key));
    }

    #[tokio::test]
    async fn test_warm_loads_only_active() {
        let (store, registry) = registry();
        let acme = descriptor("acme");
        let pending = descriptor("pending");
        store.insert_provisioning(&acme).await.unwrap();
        store.mark_active(&acme.key).await.unwrap();
        store.insert_provisioning(&pending).await.unwrap();

        assert_eq!(registry.warm().await.unwrap(), 1);
        assert!(registry.contains(&acme.key));
        assert!(!registry.contains(&pending.key));
    }
}
