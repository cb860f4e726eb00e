// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP routing through the axum middleware.

#![cfg(feature = "http")]

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use serde_json::Value;
use tower::ServiceExt;

use common::{MemoryHarness, request};
use mws_tenancy::ExecutionContext;
use mws_tenancy::http::route_tenant;

async fn whoami(ctx: ExecutionContext) -> String {
    let bound = ExecutionContext::current()
        .map(|current| current.key().to_string())
        .unwrap_or_default();
    format!("{} {} {}", ctx.key(), bound, ctx.connection().database)
}

fn app(harness: &MemoryHarness) -> Router {
    Router::new()
        .route("/whoami", get(whoami))
        .layer(from_fn_with_state(harness.tenancy.router(), route_tenant))
}

fn get_request(host: &str) -> Request<Body> {
    Request::builder()
        .uri("/whoami")
        .header(header::HOST, host)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_request_reaches_its_tenant() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();
    harness.tenancy.provision(&request("globex")).await.unwrap();

    let response = app(&harness)
        .oneshot(get_request("acme.example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "acme acme mws_acme_db");

    let response = app(&harness)
        .oneshot(get_request("globex.example.com:8443"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "globex globex mws_globex_db");
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();

    let response = app(&harness)
        .oneshot(get_request("unknown.example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"], "UNKNOWN_TENANT");
    assert_eq!(body["message"], "not found");
    assert!(!body.to_string().contains("mws_"));
}

#[tokio::test]
async fn test_control_plane_outage_is_service_unavailable() {
    let harness = MemoryHarness::new();
    harness.tenancy.provision(&request("acme")).await.unwrap();
    let sibling = harness.sibling();
    harness.store.set_unavailable(true);

    let response = app(&sibling)
        .oneshot(get_request("acme.example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"], "ROUTING_UNAVAILABLE");
}

#[tokio::test]
async fn test_extractor_without_middleware_is_server_error() {
    let app = Router::new().route("/whoami", get(whoami));

    let response = app.oneshot(get_request("acme.example.com")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"], "UNROUTED");
    assert_eq!(body["message"], "internal error");
}
