use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use burrow_control::TunnelAgent;
use burrow_server_backend::open_tunnel;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::models::*;
use crate::AppState;

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Relay is running", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now(),
        uptime: state.uptime(),
    })
}

/// Relay status
#[utoipa::path(
    get,
    path = "/api/status",
    responses(
        (status = 200, description = "Relay status", body = StatusResponse)
    ),
    tag = "system"
)]
pub async fn relay_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let stats = state.registry.stats();
    Json(StatusResponse {
        tunnels: stats.tunnel_count,
        connected_sockets: stats.total_connected_sockets,
        uptime: state.uptime(),
        timestamp: chrono::Utc::now(),
        version: state.config.version.clone(),
    })
}

/// List all tunnels
#[utoipa::path(
    get,
    path = "/api/tunnels",
    responses(
        (status = 200, description = "List of tunnels", body = Vec<TunnelSummary>)
    ),
    tag = "tunnels"
)]
pub async fn list_tunnels(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<Vec<TunnelSummary>> {
    debug!("Listing tunnels");

    let host = request_host(&headers);
    let tunnels = state
        .registry
        .list_clients()
        .iter()
        .map(|agent| summarize(&state, agent, host))
        .collect();

    Json(tunnels)
}

fn summarize(state: &AppState, agent: &TunnelAgent, host: &str) -> TunnelSummary {
    let stats = agent.stats();
    TunnelSummary {
        id: agent.client_id().to_string(),
        url: state.public_url(agent.client_id().as_str(), host),
        connected_sockets: stats.connected_sockets,
        state: stats.state.to_string(),
        created_at: agent.created_at(),
    }
}

/// Status of one tunnel
#[utoipa::path(
    get,
    path = "/api/tunnels/{id}/status",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Tunnel status", body = TunnelStatusResponse),
        (status = 404, description = "Tunnel not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelStatusResponse>, ApiError> {
    let agent = state.registry.require_client(&id)?;
    let stats = agent.stats();

    Ok(Json(TunnelStatusResponse {
        connected_sockets: stats.connected_sockets,
        state: stats.state.to_string(),
    }))
}

/// Remove a tunnel immediately
#[utoipa::path(
    delete,
    path = "/api/tunnels/{id}",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 204, description = "Tunnel removed"),
        (status = 404, description = "Tunnel not found", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.registry.remove_client(&id) {
        Some(_) => {
            info!(client_id = %id, "Tunnel removed via API");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::NotFound(id)),
    }
}

/// Create a tunnel with a random identity (`/?new`), or redirect to the landing page
#[utoipa::path(
    get,
    path = "/",
    params(
        ("new" = Option<String>, Query, description = "Present to create a tunnel with a random id")
    ),
    responses(
        (status = 200, description = "Tunnel created", body = CreateTunnelResponse),
        (status = 302, description = "Redirect to the landing page"),
        (status = 503, description = "Tunnel capacity exceeded", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn root(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if !params.contains_key("new") {
        let mut response = StatusCode::FOUND.into_response();
        let location = HeaderValue::from_str(&state.config.landing)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        response.headers_mut().insert(header::LOCATION, location);
        return Ok(response);
    }

    debug!("Creating tunnel with random id");
    let created = create_tunnel(&state, None, request_host(&headers)).await?;
    Ok(Json(created).into_response())
}

/// Create a tunnel with the requested identity
#[utoipa::path(
    get,
    path = "/{id}",
    params(
        ("id" = String, Path, description = "Requested tunnel ID (subdomain)")
    ),
    responses(
        (status = 200, description = "Tunnel created", body = CreateTunnelResponse),
        (status = 403, description = "Invalid subdomain", body = ErrorResponse),
        (status = 409, description = "Subdomain in use", body = ErrorResponse),
        (status = 503, description = "Tunnel capacity exceeded", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn create_named_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CreateTunnelResponse>, ApiError> {
    debug!(client_id = %id, "Creating named tunnel");
    let created = create_tunnel(&state, Some(&id), request_host(&headers)).await?;
    Ok(Json(created))
}

async fn create_tunnel(
    state: &AppState,
    requested: Option<&str>,
    host: &str,
) -> Result<CreateTunnelResponse, ApiError> {
    let info = open_tunnel(&state.registry, requested, &state.backend).await?;
    let id = info.id.to_string();

    Ok(CreateTunnelResponse {
        url: state.public_url(&id, host),
        id,
        port: info.port,
        max_conn_count: info.max_conn_count,
    })
}

fn request_host(headers: &HeaderMap) -> &str {
    headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
}
