//! Relay status and tunnel creation API
//!
//! Served for requests addressed to the relay's own host (no tunnel
//! subdomain). Tunnel clients call `GET /{id}` or `GET /?new` to open a tunnel
//! and learn the port to dial backend connections to.

pub mod error;
pub mod handlers;
pub mod models;

use axum::{
    http::{header, HeaderName, Method},
    routing::get,
    Json, Router,
};
use burrow_control::TunnelRegistry;
use burrow_server_backend::BackendListenerConfig;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

pub use error::ApiError;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<TunnelRegistry>,
    pub backend: BackendListenerConfig,
    pub config: ApiConfig,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        backend: BackendListenerConfig,
        config: ApiConfig,
    ) -> Self {
        Self {
            registry,
            backend,
            config,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the state was created
    pub fn uptime(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// `<schema>://<id>.<host>`
    pub fn public_url(&self, id: &str, host: &str) -> String {
        let schema = if self.config.secure { "https" } else { "http" };
        format!("{}://{}.{}", schema, id, host)
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Burrow Relay API",
        version = "0.1.0",
        description = "Tunnel creation and status endpoints of the burrow relay"
    ),
    paths(
        handlers::health_check,
        handlers::relay_status,
        handlers::list_tunnels,
        handlers::tunnel_status,
        handlers::delete_tunnel,
        handlers::root,
        handlers::create_named_tunnel,
    ),
    components(
        schemas(
            models::HealthResponse,
            models::StatusResponse,
            models::TunnelSummary,
            models::TunnelStatusResponse,
            models::CreateTunnelResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "tunnels", description = "Tunnel creation and management endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Advertise `https` tunnel URLs
    pub secure: bool,
    /// Where `GET /` redirects
    pub landing: String,
    /// Reported by `/api/status`
    pub version: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            secure: false,
            landing: "https://localtunnel.github.io/www/".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// API router builder
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(
        config: ApiConfig,
        registry: Arc<TunnelRegistry>,
        backend: BackendListenerConfig,
    ) -> Self {
        Self {
            state: Arc::new(AppState::new(registry, backend, config)),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();

        let router = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/api/status", get(handlers::relay_status))
            .route("/api/tunnels", get(handlers::list_tunnels))
            .route("/api/tunnels/{id}", axum::routing::delete(handlers::delete_tunnel))
            .route("/api/tunnels/{id}/status", get(handlers::tunnel_status))
            .route(
                "/api/openapi.json",
                get(move || {
                    let doc = api_doc.clone();
                    async move { Json(doc) }
                }),
            )
            .route("/", get(handlers::root))
            .route("/{id}", get(handlers::create_named_tunnel))
            .with_state(self.state.clone());

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::CONTENT_TYPE,
                header::AUTHORIZATION,
                HeaderName::from_static("x-requested-with"),
            ]);

        router.layer(TraceLayer::new_for_http()).layer(cors)
    }
}
