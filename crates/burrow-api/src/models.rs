//! API request and response types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds since the relay started
    pub uptime: f64,
}

/// Relay status
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    /// Registered tunnels
    pub tunnels: usize,
    /// Backend connections held across all tunnels
    pub connected_sockets: usize,
    /// Seconds since the relay started
    pub uptime: f64,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Tunnel summary
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelSummary {
    pub id: String,
    /// Public URL of the tunnel
    pub url: String,
    pub connected_sockets: usize,
    /// One of `initial`, `online`, `offline`, `removed`
    pub state: String,
    pub created_at: DateTime<Utc>,
}

/// Status of a single tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelStatusResponse {
    pub connected_sockets: usize,
    pub state: String,
}

/// A newly created tunnel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateTunnelResponse {
    pub id: String,
    /// TCP port the tunnel client dials backend connections to
    pub port: u16,
    /// Number of backend connections the client may open
    pub max_conn_count: usize,
    /// Public URL of the tunnel
    pub url: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
