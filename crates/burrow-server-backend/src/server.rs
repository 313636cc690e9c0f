//! Backend listener implementation
//!
//! Listens on an ephemeral port for one tunnel and registers every accepted
//! socket with that tunnel's agent.

use burrow_control::{BackendConnection, PoolError, RegistryError, TunnelAgent, TunnelRegistry};
use burrow_proto::ClientId;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BackendListenerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check that {address} is an address of this host\n  • Try a different --backend-address")]
    BindError { address: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct BackendListenerConfig {
    /// Address tunnel clients dial in to; the port is always ephemeral
    pub bind_ip: IpAddr,
}

impl Default for BackendListenerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// What a tunnel client needs to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelInfo {
    pub id: ClientId,
    pub port: u16,
    pub max_conn_count: usize,
}

pub struct BackendListener {
    agent: Arc<TunnelAgent>,
    listener: TcpListener,
}

impl BackendListener {
    pub async fn bind(
        config: &BackendListenerConfig,
        agent: Arc<TunnelAgent>,
    ) -> Result<Self, BackendListenerError> {
        let bind_addr = SocketAddr::new(config.bind_ip, 0);
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| BackendListenerError::BindError {
                address: config.bind_ip.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self { agent, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BackendListenerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept backend connections until the tunnel is removed
    pub async fn run(self) {
        let client_id = self.agent.client_id().clone();
        if let Ok(addr) = self.listener.local_addr() {
            info!(client_id = %client_id, "Backend listener on {}", addr);
        }

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(client_id = %client_id, "Failed to accept backend connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(client_id = %client_id, "Failed to set TCP_NODELAY: {}", e);
            }

            let conn = BackendConnection::new(stream).with_peer_addr(peer_addr);
            let conn_id = conn.id();
            match self.agent.register_backend_connection(conn) {
                Ok(()) => {
                    debug!(client_id = %client_id, conn_id, %peer_addr, "Backend connection registered");
                }
                Err(PoolError::Closed) => {
                    debug!(client_id = %client_id, "Tunnel removed, stopping backend listener");
                    break;
                }
                Err(e) => {
                    warn!(client_id = %client_id, %peer_addr, "Rejected backend connection: {}", e);
                }
            }
        }
    }
}

/// Create a tunnel and start its backend listener
///
/// The listener task is tracked by the registry and aborted when the tunnel is
/// removed. If the listener cannot bind, the tunnel is rolled back.
pub async fn open_tunnel(
    registry: &TunnelRegistry,
    requested: Option<&str>,
    config: &BackendListenerConfig,
) -> Result<TunnelInfo, BackendListenerError> {
    let client = registry.create_client(requested)?;
    let id = client.client_id;
    let agent = registry.require_client(id.as_str())?;

    let listener = match BackendListener::bind(config, agent.clone()).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(client_id = %id, "Rolling back tunnel: {}", e);
            registry.remove_agent(&agent);
            return Err(e);
        }
    };

    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            registry.remove_agent(&agent);
            return Err(e);
        }
    };

    registry.track_task(&agent, tokio::spawn(listener.run()));

    info!(client_id = %id, port, max_conn_count = client.max_sockets, "Tunnel opened");
    Ok(TunnelInfo {
        id,
        port,
        max_conn_count: client.max_sockets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_control::RegistryConfig;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn loopback() -> BackendListenerConfig {
        BackendListenerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_dial_in_registers_connections() {
        let registry = TunnelRegistry::default();
        let info = open_tunnel(&registry, Some("demo"), &loopback())
            .await
            .unwrap();

        assert_eq!(info.id.as_str(), "demo");
        assert_eq!(info.max_conn_count, 10);
        assert_ne!(info.port, 0);

        let _first = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let _second = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();

        let agent = registry.get_client("demo").unwrap();
        eventually(|| agent.stats().idle == 2).await;
        assert_eq!(registry.stats().total_connected_sockets, 2);
    }

    #[tokio::test]
    async fn test_connections_beyond_limit_are_closed() {
        let registry = TunnelRegistry::new(RegistryConfig::new().with_max_sockets(1));
        let info = open_tunnel(&registry, None, &loopback()).await.unwrap();
        assert_eq!(info.max_conn_count, 1);

        let _kept = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let agent = registry.get_client(info.id.as_str()).unwrap();
        eventually(|| agent.stats().idle == 1).await;

        let mut rejected = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), rejected.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(agent.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_removal_stops_listener() {
        let registry = TunnelRegistry::default();
        let info = open_tunnel(&registry, Some("demo"), &loopback())
            .await
            .unwrap();

        registry.remove_client("demo");

        let port = info.port;
        tokio::time::timeout(Duration::from_secs(5), async move {
            while TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener still accepting");
    }

    #[tokio::test]
    async fn test_taken_identity_is_reported() {
        let registry = TunnelRegistry::default();
        open_tunnel(&registry, Some("demo"), &loopback())
            .await
            .unwrap();

        let err = open_tunnel(&registry, Some("demo"), &loopback())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackendListenerError::Registry(RegistryError::IdentifierTaken(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_failure_rolls_back_tunnel() {
        let registry = TunnelRegistry::default();
        // TEST-NET-3, never assigned to a local interface
        let config = BackendListenerConfig {
            bind_ip: "203.0.113.7".parse().unwrap(),
        };

        let err = open_tunnel(&registry, Some("demo"), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendListenerError::BindError { .. }));
        assert!(registry.get_client("demo").is_none());
        assert_eq!(registry.stats().tunnel_count, 0);
    }
}
