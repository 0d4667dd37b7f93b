//! API endpoint handlers. Every handler replies with the
//! [`ApiResponse`] envelope; error bodies carry operator-facing messages and
//! the detail goes to the log.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;
use tracing::{error, info};

use crate::credentials::Credentials;
use crate::frpc::config;
use crate::frpc::tunnels::{self, TunnelError, TunnelRequest};
use crate::server::response::ApiResponse;
use crate::server::routes::AppState;

#[derive(Debug, Serialize)]
struct ServerInfo {
    version: &'static str,
}

/// GET /api/info. Reachable without configuration so clients can probe the
/// daemon before enrolling.
pub async fn info() -> (StatusCode, Json<ApiResponse>) {
    let info = ServerInfo {
        version: env!("CARGO_PKG_VERSION"),
    };
    match serde_json::to_string(&info) {
        Ok(body) => ApiResponse::success(body),
        Err(e) => {
            error!(error = %e, "failed to serialize server info");
            ApiResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to serialize server info",
            )
        }
    }
}

/// PUT /api/configure. Persists credentials, writes the optional upstream
/// TLS material and restarts the child so the new identity takes effect.
pub async fn configure(
    State(state): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> (StatusCode, Json<ApiResponse>) {
    if let Err(e) = credentials.validate() {
        return ApiResponse::error(StatusCode::BAD_REQUEST, e.to_string());
    }

    if let Err(e) = state.credentials.write(&credentials).await {
        error!(error = %e, "failed to persist credentials");
        return ApiResponse::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to persist credentials",
        );
    }

    if credentials.has_tls_material() {
        if let Err(e) = config::write_upstream_tls_files(state.supervisor.work_dir(), &credentials)
        {
            error!(error = %e, "failed to write upstream TLS files");
            return ApiResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to write upstream TLS files",
            );
        }
    }

    // Restart re-reads the credentials, re-signs the config and relaunches.
    if let Err(e) = state.supervisor.restart(&state.credentials).await {
        error!(error = %e, "failed to restart frpc");
        return ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "failed to restart frpc");
    }

    info!(client_id = %credentials.client_id, "daemon configured");
    ApiResponse::success("tfarmd configured")
}

/// GET /api/status.
pub async fn status(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse>) {
    match state.supervisor.status().await {
        Ok(table) => ApiResponse::success(table),
        Err(e) => {
            error!(error = %e, "failed to get frpc status");
            ApiResponse::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to get frpc status",
            )
        }
    }
}

/// GET /api/verify.
pub async fn verify(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse>) {
    match state.supervisor.output("verify").await {
        Ok(_) => ApiResponse::success("frpc configuration verified"),
        Err(e) => {
            error!(error = %e, "failed to verify");
            ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "failed to verify")
        }
    }
}

/// POST /api/reload.
pub async fn reload(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse>) {
    match state.supervisor.output("reload").await {
        Ok(_) => ApiResponse::success("frpc configuration reloaded"),
        Err(e) => {
            error!(error = %e, "failed to reload");
            ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "failed to reload")
        }
    }
}

/// POST /api/restart.
pub async fn restart(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse>) {
    match state.supervisor.restart(&state.credentials).await {
        Ok(()) => ApiResponse::success("frpc restarted"),
        Err(e) => {
            error!(error = %e, "failed to restart");
            ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "failed to restart")
        }
    }
}

/// POST /api/tunnel.
pub async fn tunnel_create(
    State(state): State<AppState>,
    Json(request): Json<TunnelRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    match tunnels::create(&state.supervisor, &request).await {
        Ok(()) => {
            info!(name = %request.name, "tunnel created");
            ApiResponse::success("tunnel created")
        }
        Err(e) => tunnel_error(e, "failed to create tunnel"),
    }
}

/// DELETE /api/tunnel/{name}.
pub async fn tunnel_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match tunnels::delete(&state.supervisor, &name).await {
        Ok(()) => {
            info!(name = %name, "tunnel deleted");
            ApiResponse::success("tunnel deleted")
        }
        Err(e) => tunnel_error(e, "failed to delete tunnel"),
    }
}

/// Map tunnel errors to status codes; caller mistakes keep their message,
/// internal failures get the generic one.
fn tunnel_error(err: TunnelError, fallback: &str) -> (StatusCode, Json<ApiResponse>) {
    error!(error = %err, "{fallback}");
    match err {
        TunnelError::Conflict(_) => ApiResponse::error(StatusCode::CONFLICT, err.to_string()),
        TunnelError::NotFound(_) => ApiResponse::error(StatusCode::NOT_FOUND, err.to_string()),
        TunnelError::InvalidType(_)
        | TunnelError::InvalidName(_)
        | TunnelError::MissingRemotePort => {
            ApiResponse::error(StatusCode::BAD_REQUEST, err.to_string())
        }
        TunnelError::Io(_) | TunnelError::Frpc(_) => {
            ApiResponse::error(StatusCode::INTERNAL_SERVER_ERROR, fallback)
        }
    }
}
