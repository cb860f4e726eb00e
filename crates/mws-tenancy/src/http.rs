// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! axum integration.
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/services", get(list_services))
//!     .layer(axum::middleware::from_fn_with_state(tenancy.router(), route_tenant));
//!
//! async fn list_services(ctx: ExecutionContext) -> impl IntoResponse { ... }
//! ```

use axum::Json;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{error, warn};

use crate::context::ExecutionContext;
use crate::error::TenancyError;
use crate::router::{RequestRouter, UnitOfWork};

/// Seconds clients are asked to wait before retrying a 503.
const RETRY_AFTER_SECS: &str = "5";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl TenancyError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownTenant { .. } => StatusCode::NOT_FOUND,
            Self::DuplicateTenant { .. } => StatusCode::CONFLICT,
            Self::InvalidTenantKey { .. } | Self::InvalidRequest { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Provisioning { .. } | Self::RoutingUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Unrouted | Self::RollbackFailed(_) | Self::Config(_) | Self::Backend(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for TenancyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!(code = self.error_code(), error = %self, "Request failed");
        } else if status.is_server_error() {
            error!(code = self.error_code(), error = %self, "Request failed");
        }

        let body = ErrorBody {
            error: self.error_code(),
            message: self.public_message(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

/// Middleware routing every request to its tenant.
///
/// Use with [`axum::middleware::from_fn_with_state`]. The resolved
/// [`ExecutionContext`] is added to the request extensions and bound for
/// the rest of the stack. Unroutable requests are answered directly.
pub async fn route_tenant(
    State(router): State<RequestRouter>,
    mut request: Request,
    next: Next,
) -> Response {
    let host = request.host().unwrap_or_default().to_string();

    let ctx = match router.route(host.as_str()).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_response(),
    };

    request.extensions_mut().insert(ctx.clone());
    ctx.scope(next.run(request)).await
}

impl<S: Send + Sync> FromRequestParts<S> for ExecutionContext {
    type Rejection = TenancyError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<ExecutionContext>()
            .cloned()
            .ok_or(TenancyError::Unrouted)
    }
}
