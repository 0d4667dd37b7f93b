//! Route table and the readiness gate in front of the operational endpoints.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use tracing::warn;

use crate::credentials::CredentialStore;
use crate::frpc::FrpcSupervisor;
use crate::server::handlers;
use crate::server::response::ApiResponse;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<FrpcSupervisor>,
    pub credentials: Arc<CredentialStore>,
}

/// Build the full route table. `/api/info` and `/api/configure` are always
/// reachable; everything else sits behind the readiness gate.
pub fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/verify", get(handlers::verify))
        .route("/api/reload", post(handlers::reload))
        .route("/api/restart", post(handlers::restart))
        .route("/api/tunnel", post(handlers::tunnel_create))
        .route("/api/tunnel/{name}", delete(handlers::tunnel_delete))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_ready));

    Router::new()
        .route("/api/info", get(handlers::info))
        .route("/api/configure", put(handlers::configure))
        .merge(gated)
        .with_state(state)
}

/// Operational endpoints need credentials on disk and a live child, checked
/// in that order so the caller learns the earliest missing precondition.
async fn require_ready(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.credentials.is_configured() {
        warn!("request rejected, daemon not configured");
        return ApiResponse::error(
            StatusCode::UNAUTHORIZED,
            "tfarmd not configured. run `tfarmd configure`",
        )
        .into_response();
    }
    if !state.supervisor.is_running() {
        warn!("request rejected, frpc not running");
        return ApiResponse::error(
            StatusCode::UNAUTHORIZED,
            "frpc not running. check tfarm server logs for more information",
        )
        .into_response();
    }
    next.run(request).await
}
