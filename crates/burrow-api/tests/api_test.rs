//! Integration tests for the relay API

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use burrow_api::{models::*, ApiConfig, ApiServer};
use burrow_control::{BackendConnection, RegistryConfig, TunnelRegistry};
use burrow_server_backend::BackendListenerConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tower::ServiceExt; // For `oneshot` method

/// Helper to create a test API router over a fresh registry
fn create_test_app(config: RegistryConfig) -> (Router, Arc<TunnelRegistry>) {
    let registry = Arc::new(TunnelRegistry::new(config));
    let backend = BackendListenerConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    let api_config = ApiConfig {
        landing: "https://example.org/landing".to_string(),
        ..ApiConfig::default()
    };

    let server = ApiServer::new(api_config, registry.clone(), backend);
    (server.build_router(), registry)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("host", "relay.test:3000")
        .body(Body::empty())
        .unwrap()
}

async fn json_body<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

// ============================================================================
// System endpoints
// ============================================================================

#[tokio::test]
async fn test_health() {
    let (app, _registry) = create_test_app(RegistryConfig::default());

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let health: HealthResponse = json_body(response).await;
    assert_eq!(health.status, "ok");
    assert!(health.uptime >= 0.0);
}

#[tokio::test]
async fn test_status_counts_tunnels() {
    let (app, registry) = create_test_app(RegistryConfig::default());
    registry.create_client(Some("first")).unwrap();
    registry.create_client(Some("second")).unwrap();

    let (local, _remote) = tokio::io::duplex(64);
    registry
        .get_client("first")
        .unwrap()
        .register_backend_connection(BackendConnection::new(local))
        .unwrap();

    let response = app.oneshot(get("/api/status")).await.unwrap();
    let status: StatusResponse = json_body(response).await;
    assert_eq!(status.tunnels, 2);
    assert_eq!(status.connected_sockets, 1);
}

#[tokio::test]
async fn test_openapi_document() {
    let (app, _registry) = create_test_app(RegistryConfig::default());

    let response = app.oneshot(get("/api/openapi.json")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let doc: serde_json::Value = json_body(response).await;
    assert_eq!(doc["info"]["title"], "Burrow Relay API");
}

#[tokio::test]
async fn test_cors_headers() {
    let (app, _registry) = create_test_app(RegistryConfig::default());

    let request = Request::builder()
        .uri("/health")
        .header("host", "relay.test")
        .header("origin", "https://somewhere.example")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "*"
    );
}

// ============================================================================
// Tunnel creation
// ============================================================================

#[tokio::test]
async fn test_root_redirects_to_landing() {
    let (app, _registry) = create_test_app(RegistryConfig::default());

    let response = app.oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "https://example.org/landing");
}

#[tokio::test]
async fn test_create_random_tunnel() {
    let (app, registry) = create_test_app(RegistryConfig::default());

    let response = app.oneshot(get("/?new")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let created: CreateTunnelResponse = json_body(response).await;
    assert_eq!(created.max_conn_count, 10);
    assert_ne!(created.port, 0);
    assert_eq!(created.url, format!("http://{}.relay.test:3000", created.id));
    assert!(registry.get_client(&created.id).is_some());
}

#[tokio::test]
async fn test_create_named_tunnel() {
    let (app, registry) = create_test_app(RegistryConfig::new().with_max_sockets(4));

    let response = app.clone().oneshot(get("/my-app")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let created: CreateTunnelResponse = json_body(response).await;
    assert_eq!(created.id, "my-app");
    assert_eq!(created.max_conn_count, 4);
    assert_eq!(created.url, "http://my-app.relay.test:3000");

    // Tunnel client dials in
    tokio::net::TcpStream::connect(("127.0.0.1", created.port))
        .await
        .unwrap();
    assert!(registry.has_client("my-app"));

    // Same id again is refused
    let response = app.oneshot(get("/my-app")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_invalid_subdomain_is_forbidden() {
    let (app, registry) = create_test_app(RegistryConfig::default());

    for uri in ["/ab", "/-bad-", "/Upper", "/admin"] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);

        let error: ErrorResponse = json_body(response).await;
        assert!(error.message.starts_with("Invalid subdomain"));
    }
    assert_eq!(registry.stats().tunnel_count, 0);
}

#[tokio::test]
async fn test_capacity_exceeded() {
    let (app, _registry) = create_test_app(RegistryConfig::new().with_max_tunnels(Some(1)));

    let response = app.clone().oneshot(get("/first")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/?new")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ============================================================================
// Tunnel inspection
// ============================================================================

#[tokio::test]
async fn test_list_and_status() {
    let (app, registry) = create_test_app(RegistryConfig::default());
    registry.create_client(Some("demo")).unwrap();

    let response = app.clone().oneshot(get("/api/tunnels")).await.unwrap();
    let tunnels: Vec<TunnelSummary> = json_body(response).await;
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].id, "demo");
    assert_eq!(tunnels[0].state, "initial");
    assert_eq!(tunnels[0].url, "http://demo.relay.test:3000");

    let response = app
        .clone()
        .oneshot(get("/api/tunnels/demo/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: TunnelStatusResponse = json_body(response).await;
    assert_eq!(status.connected_sockets, 0);

    let response = app
        .oneshot(get("/api/tunnels/ghost/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_tunnel() {
    let (app, registry) = create_test_app(RegistryConfig::default());
    registry.create_client(Some("demo")).unwrap();

    let delete = |uri: &str| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("host", "relay.test")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(delete("/api/tunnels/demo")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!registry.has_client("demo"));

    let response = app.oneshot(delete("/api/tunnels/demo")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
