//! Request forwarding over pooled backend connections
//!
//! Every request claims one backend connection and speaks HTTP/1.1 to the
//! tunnel client over it. Bodies stream in both directions frame by frame; the
//! connection is owned by the hyper client task and discarded when that task
//! ends, whichever way it ends.

use burrow_control::{
    PoolError, PooledConnection, RegistryConfig, TunnelAgent, DEFAULT_ACQUIRE_TIMEOUT,
};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Request forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("No backend connection available within {0:?}")]
    NoAvailableConnection(Duration),

    #[error("Backend connection failed: {0}")]
    UpstreamReset(#[source] hyper::Error),

    #[error("Tunnel is not connected")]
    Disconnected,
}

impl ForwardError {
    /// Status returned to the public client
    pub fn status_code(&self) -> StatusCode {
        match self {
            ForwardError::NoAvailableConnection(_) => StatusCode::GATEWAY_TIMEOUT,
            ForwardError::UpstreamReset(_) | ForwardError::Disconnected => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<PoolError> for ForwardError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoAvailableConnection(timeout) => ForwardError::NoAvailableConnection(timeout),
            PoolError::Closed | PoolError::PoolFull { .. } | PoolError::CapacityExceeded { .. } => {
                ForwardError::Disconnected
            }
        }
    }
}

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// How long a request waits for a backend connection
    pub acquire_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

impl From<&RegistryConfig> for ForwarderConfig {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            acquire_timeout: config.acquire_timeout,
        }
    }
}

/// Forwards public requests through a tunnel agent
#[derive(Debug, Clone, Default)]
pub struct RequestForwarder {
    config: ForwarderConfig,
}

impl RequestForwarder {
    pub fn new(config: ForwarderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Forward a plain HTTP request and return the backend's response
    ///
    /// The response body streams from the backend connection as the caller
    /// reads it.
    pub async fn forward_http<B>(
        &self,
        agent: &TunnelAgent,
        request: Request<B>,
    ) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let conn = self.acquire(agent).await?;
        let conn_id = conn.id();
        let client_id = agent.client_id().clone();

        trace!(client_id = %client_id, conn_id, method = %request.method(), uri = %request.uri(), "Forwarding request");

        let (mut sender, connection) = http1::handshake(TokioIo::new(conn))
            .await
            .map_err(ForwardError::UpstreamReset)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(client_id = %client_id, conn_id, "Backend connection ended: {}", e);
            }
        });

        let response = sender.send_request(request).await.map_err(|e| {
            warn!(client_id = %agent.client_id(), conn_id, "Backend request failed: {}", e);
            ForwardError::UpstreamReset(e)
        })?;

        Ok(response)
    }

    /// Forward a protocol upgrade request (e.g. WebSocket)
    ///
    /// When the backend switches protocols, the public connection and the
    /// backend connection are spliced together until either side closes. Any
    /// other response is returned as is.
    pub async fn forward_upgrade<B>(
        &self,
        agent: &TunnelAgent,
        mut request: Request<B>,
    ) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let public_upgrade = hyper::upgrade::on(&mut request);

        let conn = self.acquire(agent).await?;
        let conn_id = conn.id();
        let client_id = agent.client_id().clone();

        let (mut sender, connection) = http1::handshake(TokioIo::new(conn))
            .await
            .map_err(ForwardError::UpstreamReset)?;

        tokio::spawn({
            let client_id = client_id.clone();
            async move {
                if let Err(e) = connection.with_upgrades().await {
                    debug!(client_id = %client_id, conn_id, "Backend connection ended: {}", e);
                }
            }
        });

        let mut response = sender.send_request(request).await.map_err(|e| {
            warn!(client_id = %client_id, conn_id, "Backend upgrade request failed: {}", e);
            ForwardError::UpstreamReset(e)
        })?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            debug!(
                client_id = %client_id,
                conn_id,
                status = %response.status(),
                "Backend declined upgrade"
            );
            return Ok(response);
        }

        let backend_upgrade = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            let (public, backend) = match tokio::try_join!(public_upgrade, backend_upgrade) {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(client_id = %client_id, conn_id, "Upgrade did not complete: {}", e);
                    return;
                }
            };

            let mut public = TokioIo::new(public);
            let mut backend = TokioIo::new(backend);
            match tokio::io::copy_bidirectional(&mut public, &mut backend).await {
                Ok((to_backend, to_public)) => {
                    debug!(
                        client_id = %client_id,
                        conn_id,
                        to_backend,
                        to_public,
                        "Upgraded session closed"
                    );
                }
                Err(e) => {
                    debug!(client_id = %client_id, conn_id, "Upgraded session failed: {}", e);
                }
            }
        });

        Ok(response)
    }

    async fn acquire(&self, agent: &TunnelAgent) -> Result<PooledConnection, ForwardError> {
        agent
            .acquire_backend_connection(self.config.acquire_timeout)
            .await
            .map_err(|e| {
                warn!(client_id = %agent.client_id(), "Could not claim backend connection: {}", e);
                ForwardError::from(e)
            })
    }
}

/// Whether `request` asks for a protocol upgrade
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    let connection_upgrade = request
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && request.headers().contains_key(hyper::header::UPGRADE)
}
