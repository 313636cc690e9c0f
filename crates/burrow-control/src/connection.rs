//! Backend connections supplied by the private side of a tunnel

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};

/// Any duplex byte stream usable as a backend connection
///
/// Implemented for every `AsyncRead + AsyncWrite` stream, so TCP sockets and
/// in-memory pipes are accepted alike.
pub trait BackendStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BackendStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// An idle backend connection, not yet claimed by a request
///
/// Each connection serves exactly one forwarded request or upgraded session and
/// is closed afterwards.
pub struct BackendConnection {
    id: u64,
    pub(crate) stream: Box<dyn BackendStream>,
    peer_addr: Option<SocketAddr>,
}

impl BackendConnection {
    pub fn new<S: BackendStream>(stream: S) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            stream: Box::new(stream),
            peer_addr: None,
        }
    }

    /// Record the remote address the connection was accepted from
    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    /// Process-unique connection id (for logging)
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

impl fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (a, _a_peer) = tokio::io::duplex(64);
        let (b, _b_peer) = tokio::io::duplex(64);

        let first = BackendConnection::new(a);
        let second = BackendConnection::new(b);

        assert_ne!(first.id(), second.id());
        assert!(first.peer_addr().is_none());
    }

    #[tokio::test]
    async fn test_peer_addr() {
        let (a, _peer) = tokio::io::duplex(64);
        let addr: SocketAddr = "10.1.2.3:4567".parse().unwrap();

        let conn = BackendConnection::new(a).with_peer_addr(addr);
        assert_eq!(conn.peer_addr(), Some(addr));
    }
}
