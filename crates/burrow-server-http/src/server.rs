//! Public HTTP listener
//!
//! Accepts public HTTP/1.1 connections, routes each request by its `Host`
//! header and forwards it through the addressed tunnel. Requests for the
//! relay's own host go to the API router.

use crate::forwarder::{is_upgrade_request, ForwarderConfig, RequestForwarder};
use axum::body::Body;
use burrow_control::TunnelRegistry;
use burrow_router::HostRouter;
use hyper::body::Incoming;
use hyper::header::{CONNECTION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

/// HTTP server errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port (--port / --address)")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

/// Per-request routing shared by every public connection
struct RelayService {
    registry: Arc<TunnelRegistry>,
    router: HostRouter,
    forwarder: RequestForwarder,
    api: Option<axum::Router>,
}

impl RelayService {
    async fn handle(&self, request: Request<Incoming>) -> Response<Body> {
        let host = match HostRouter::extract_host(request.headers()) {
            Ok(host) => host.to_string(),
            Err(e) => {
                debug!("Rejecting request: {}", e);
                return close_after(text_response(
                    StatusCode::BAD_REQUEST,
                    "Host header is required",
                ));
            }
        };

        let Some(client_id) = self.router.client_id(&host) else {
            return self.handle_api(request).await;
        };

        let upgrade = is_upgrade_request(&request);
        let Some(agent) = self.registry.get_client(&client_id) else {
            debug!(client_id = %client_id, host = %host, "No tunnel for host");
            let response = text_response(StatusCode::NOT_FOUND, "404");
            return if upgrade { close_after(response) } else { response };
        };

        let result = if upgrade {
            self.forwarder.forward_upgrade(&agent, request).await
        } else {
            self.forwarder.forward_http(&agent, request).await
        };

        match result {
            Ok(response) => response.map(Body::new),
            Err(e) => {
                warn!(client_id = %client_id, "Forwarding failed: {}", e);
                let response = text_response(e.status_code(), &e.to_string());
                if upgrade {
                    close_after(response)
                } else {
                    response
                }
            }
        }
    }

    async fn handle_api(&self, request: Request<Incoming>) -> Response<Body> {
        match &self.api {
            Some(api) => match api.clone().oneshot(request).await {
                Ok(response) => response,
                Err(never) => match never {},
            },
            None => text_response(StatusCode::NOT_FOUND, "404"),
        }
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn close_after(mut response: Response<Body>) -> Response<Body> {
    response
        .headers_mut()
        .insert(CONNECTION, hyper::header::HeaderValue::from_static("close"));
    response
}

/// Public HTTP server
pub struct HttpServer {
    config: HttpServerConfig,
    registry: Arc<TunnelRegistry>,
    router: HostRouter,
    forwarder: RequestForwarder,
    api: Option<axum::Router>,
}

impl HttpServer {
    /// The forwarder waits for backend connections as long as the registry's
    /// `acquire_timeout`
    pub fn new(config: HttpServerConfig, registry: Arc<TunnelRegistry>) -> Self {
        let forwarder = RequestForwarder::new(ForwarderConfig::from(registry.config()));
        Self {
            config,
            registry,
            router: HostRouter::default(),
            forwarder,
            api: None,
        }
    }

    pub fn with_router(mut self, router: HostRouter) -> Self {
        self.router = router;
        self
    }

    /// Serve requests without a tunnel subdomain with `api`
    pub fn with_api(mut self, api: axum::Router) -> Self {
        self.api = Some(api);
        self
    }

    /// Bind the configured address and serve until the task is cancelled
    pub async fn start(&self) -> Result<(), HttpServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| HttpServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })?;
        self.serve(listener).await
    }

    /// Serve connections accepted from `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HttpServerError> {
        let local_addr = listener.local_addr()?;
        info!("HTTP server listening on {}", local_addr);

        let service = Arc::new(RelayService {
            registry: self.registry.clone(),
            router: self.router.clone(),
            forwarder: self.forwarder.clone(),
            api: self.api.clone(),
        });

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Accepted public connection from {}", peer_addr);
                    let service = service.clone();

                    tokio::spawn(async move {
                        let handler = service_fn(move |request| {
                            let service = service.clone();
                            async move { Ok::<_, Infallible>(service.handle(request).await) }
                        });

                        if let Err(e) = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), handler)
                            .with_upgrades()
                            .await
                        {
                            debug!("Public connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}
