// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request routing and execution-context isolation.

mod common;

use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use common::{MemoryHarness, request};
use mws_tenancy::control_plane::ControlPlaneOp;
use mws_tenancy::database::FailPoint;
use mws_tenancy::{
    BackendError, ExecutionContext, TenancyError, TenantDescriptor, TenantKey, TenantRecord,
    TenantStatus,
};

const TENANTS: usize = 8;

async fn provision_shops(harness: &MemoryHarness) {
    for i in 0..TENANTS {
        harness
            .tenancy
            .provision(&request(&format!("shop-{}", i)))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_known_and_unknown_hosts() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();
    let router = harness.tenancy.router();

    let database = router
        .run("acme.example.com", |ctx| async move {
            let current = ExecutionContext::current().unwrap();
            assert_eq!(current.key(), ctx.key());
            current.connection().database.clone()
        })
        .await
        .unwrap();
    assert_eq!(database, "mws_acme_db");

    let err = router
        .run("unknown.example.com", |_| async { unreachable!() })
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::UnknownTenant { .. }));
    assert_eq!(err.public_message(), "not found");

    // Malformed hosts look exactly like unregistered ones
    let err = router.route("bad_label.example.com").await.unwrap_err();
    assert!(matches!(err, TenancyError::UnknownTenant { .. }));
    assert_eq!(err.public_message(), "not found");

    assert!(!ExecutionContext::is_bound());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contexts_never_leak_between_interleaved_requests() {
    let harness = MemoryHarness::new();
    provision_shops(&harness).await;

    let handles = (0..400).map(|i| {
        let router = harness.tenancy.router();
        tokio::spawn(async move {
            let shop = i % TENANTS;
            let host = format!("shop-{}.example.com:8443", shop);
            let expected = format!("shop-{}", shop);

            let database = router
                .run(&host, |ctx| async move {
                    for round in 0..5 {
                        if (i + round) % 3 == 0 {
                            tokio::time::sleep(Duration::from_millis(1)).await;
                        } else {
                            tokio::task::yield_now().await;
                        }
                        let current = ExecutionContext::current().unwrap();
                        assert_eq!(current.key(), ctx.key());
                        assert_eq!(current.key().as_str(), expected);
                    }
                    ExecutionContext::current()
                        .unwrap()
                        .connection()
                        .database
                        .clone()
                })
                .await
                .unwrap();

            assert!(!ExecutionContext::is_bound());
            (shop, database)
        })
    });

    for joined in join_all(handles).await {
        let (shop, database) = joined.unwrap();
        assert_eq!(database, format!("mws_shop_{}_db", shop));
    }
}

#[tokio::test]
async fn test_spawned_tasks_do_not_inherit_context() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();

    let (inherited, propagated) = harness
        .tenancy
        .router()
        .run("acme.example.com", |ctx| async move {
            let inherited = tokio::spawn(async { ExecutionContext::is_bound() })
                .await
                .unwrap();

            // Explicit propagation works
            let propagated = tokio::spawn(ctx.clone().scope(async {
                ExecutionContext::current().unwrap().key().to_string()
            }))
            .await
            .unwrap();

            (inherited, propagated)
        })
        .await
        .unwrap();

    assert!(!inherited);
    assert_eq!(propagated, "acme");
}

#[tokio::test]
async fn test_context_unbound_after_handler_error() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();

    let result: Result<(), &str> = harness
        .tenancy
        .router()
        .run("acme.example.com", |_| async { Err("handler failed") })
        .await
        .unwrap();

    assert_eq!(result, Err("handler failed"));
    assert!(!ExecutionContext::is_bound());
    assert!(matches!(
        ExecutionContext::current(),
        Err(TenancyError::Unrouted)
    ));
}

#[tokio::test]
async fn test_enter_binds_explicit_key() {
    let harness = MemoryHarness::new();
    let acme = harness.tenancy.provision(&request("acme")).await.unwrap();
    let router = harness.tenancy.router();

    let bound = router
        .enter(&acme.key, |_| async {
            ExecutionContext::current().unwrap().key().clone()
        })
        .await
        .unwrap();
    assert_eq!(bound, acme.key);

    let ghost = TenantKey::parse("ghost").unwrap();
    assert!(matches!(
        router.enter(&ghost, |_| async {}).await,
        Err(TenancyError::UnknownTenant { .. })
    ));
}

#[tokio::test]
async fn test_cold_registry_resolves_from_control_plane() {
    let harness = MemoryHarness::new();
    provision_shops(&harness).await;

    let sibling = harness.sibling();
    assert!(sibling.tenancy.registry().is_empty());

    let calls = harness.store.get_active_calls();
    let ctx = sibling.tenancy.router().route("shop-3.example.com").await.unwrap();
    assert_eq!(ctx.connection().database, "mws_shop_3_db");
    assert_eq!(harness.store.get_active_calls(), calls + 1);

    // Cached now
    sibling.tenancy.router().route("shop-3.example.com").await.unwrap();
    assert_eq!(harness.store.get_active_calls(), calls + 1);
}

#[tokio::test]
async fn test_warm_registry_survives_control_plane_outage() {
    let harness = MemoryHarness::new();
    provision_shops(&harness).await;

    let sibling = harness.sibling();
    assert_eq!(sibling.tenancy.warm_registry().await.unwrap(), TENANTS);

    harness.store.set_unavailable(true);
    for i in 0..TENANTS {
        sibling
            .tenancy
            .router()
            .route(format!("shop-{}.example.com", i).as_str())
            .await
            .unwrap();
    }

    // Misses cannot be answered while the control plane is down
    let err = sibling
        .tenancy
        .router()
        .route("newcomer.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::RoutingUnavailable { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_outage_is_not_reported_as_unknown_tenant() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();

    let sibling = harness.sibling();
    harness.store.fail_on(ControlPlaneOp::GetActive);

    let err = sibling
        .tenancy
        .router()
        .route("acme.example.com")
        .await
        .unwrap_err();
    assert!(matches!(err, TenancyError::RoutingUnavailable { .. }));
    assert_eq!(
        err.public_message(),
        "service temporarily unavailable, try again later"
    );

    harness.store.clear_failures();
    sibling.tenancy.router().route("acme.example.com").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_slow_control_plane_times_out() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();

    let sibling = harness.sibling();
    harness
        .store
        .delay(ControlPlaneOp::GetActive, Duration::from_secs(10));

    match sibling.tenancy.router().route("acme.example.com").await {
        Err(TenancyError::RoutingUnavailable { cause, .. }) => {
            assert!(matches!(cause, BackendError::Timeout(_)));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // The warm process is unaffected
    harness.tenancy.router().route("acme.example.com").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_tenant_not_routable_until_activated() {
    let harness = MemoryHarness::new();
    harness
        .server
        .delay(FailPoint::Migrate, Duration::from_secs(1));

    let tenancy = harness.tenancy.clone();
    let provisioning = tokio::spawn(async move { tenancy.provision(&request("acme")).await });

    let key = TenantKey::parse("acme").unwrap();
    while !harness.tenancy.registry().contains(&key) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let router = harness.tenancy.router();
    assert!(matches!(
        router.route("acme.example.com").await,
        Err(TenancyError::UnknownTenant { .. })
    ));
    assert!(matches!(
        harness.sibling().tenancy.router().route("acme.example.com").await,
        Err(TenancyError::UnknownTenant { .. })
    ));

    provisioning.await.unwrap().unwrap();
    router.route("acme.example.com").await.unwrap();
}

#[tokio::test]
async fn test_provisioning_rows_never_resolve() {
    let harness = MemoryHarness::new();
    let key = TenantKey::parse("halfway").unwrap();
    harness
        .store
        .insert_record(TenantRecord {
            descriptor: TenantDescriptor {
                connection: harness.tenancy.naming().spec_for(&key),
                key: key.clone(),
                display_name: "Halfway".to_string(),
                contact_email: "ops@halfway.example.com".to_string(),
                created_at: Utc::now(),
            },
            status: TenantStatus::Provisioning,
            activated_at: None,
        })
        .await;

    assert!(matches!(
        harness.tenancy.router().route("halfway.example.com").await,
        Err(TenancyError::UnknownTenant { .. })
    ));
    assert_eq!(harness.tenancy.warm_registry().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rolled_back_tenant_stops_routing() {
    let harness = MemoryHarness::new();
    let acme = harness.tenancy.provision(&request("acme")).await.unwrap();
    harness.tenancy.router().route("acme.example.com").await.unwrap();

    harness.tenancy.rollback(&acme.key).await.unwrap();

    assert!(matches!(
        harness.tenancy.router().route("acme.example.com").await,
        Err(TenancyError::UnknownTenant { .. })
    ));
}
