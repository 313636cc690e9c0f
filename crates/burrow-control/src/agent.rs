//! Tunnel agent: lifecycle state plus the connection pool of one tunnel

use crate::connection::BackendConnection;
use crate::pool::{ConnectionPool, PoolError, PooledConnection};
use burrow_proto::ClientId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Lifecycle of a tunnel
///
/// ```text
/// initial --connection--> online --no connections for grace--> offline
/// offline --connection--> online
/// initial --grace without any connection--> offline
/// offline --removal grace--> removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Initial,
    Online,
    Offline,
    Removed,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Initial => "initial",
            AgentState::Online => "online",
            AgentState::Offline => "offline",
            AgentState::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AgentStats {
    pub connected_sockets: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub max_sockets: usize,
    pub state: AgentState,
}

struct Lifecycle {
    state: AgentState,
    offline_since: Option<Instant>,
}

/// The relay-side representative of one tunnel client
pub struct TunnelAgent {
    client_id: ClientId,
    pool: ConnectionPool,
    lifecycle: Mutex<Lifecycle>,
    created_at: DateTime<Utc>,
}

impl TunnelAgent {
    /// Create a standalone agent
    pub fn new(client_id: ClientId, max_sockets: usize) -> Self {
        Self::with_shared_counter(client_id, max_sockets, Arc::new(AtomicUsize::new(0)), None)
    }

    /// Create an agent whose connections also count toward a relay-wide total
    pub fn with_shared_counter(
        client_id: ClientId,
        max_sockets: usize,
        total_sockets: Arc<AtomicUsize>,
        max_total: Option<usize>,
    ) -> Self {
        let pool = ConnectionPool::with_shared_counter(
            client_id.as_str(),
            max_sockets,
            total_sockets,
            max_total,
        );
        Self {
            client_id,
            pool,
            lifecycle: Mutex::new(Lifecycle {
                state: AgentState::Initial,
                offline_since: None,
            }),
            created_at: Utc::now(),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn max_sockets(&self) -> usize {
        self.pool.max_sockets()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> AgentState {
        self.lifecycle().state
    }

    /// Accept a connection dialed in by the tunnel client
    pub fn register_backend_connection(&self, conn: BackendConnection) -> Result<(), PoolError> {
        // Held across the registration so an offline decision cannot interleave
        let mut lifecycle = self.lifecycle();
        self.pool.register(conn)?;

        match lifecycle.state {
            AgentState::Initial | AgentState::Offline => {
                info!(
                    client_id = %self.client_id,
                    previous = %lifecycle.state,
                    "Tunnel online"
                );
                lifecycle.state = AgentState::Online;
                lifecycle.offline_since = None;
            }
            AgentState::Online | AgentState::Removed => {}
        }
        Ok(())
    }

    /// Claim a backend connection for one request
    pub async fn acquire_backend_connection(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection, PoolError> {
        self.pool.acquire(timeout).await
    }

    /// Close a claimed connection
    ///
    /// Equivalent to dropping it; the slot is released exactly once either way.
    pub fn discard(&self, conn: PooledConnection) {
        debug!(
            client_id = %self.client_id,
            conn_id = conn.id(),
            "Discarding backend connection"
        );
        drop(conn);
    }

    /// Transition to offline once the tunnel has held no connections for `grace`
    ///
    /// Returns true when this call performed the transition.
    pub fn mark_offline_if_idle_expired(&self, grace: Duration) -> bool {
        let mut lifecycle = self.lifecycle();
        if !matches!(lifecycle.state, AgentState::Initial | AgentState::Online) {
            return false;
        }
        if self.pool.stats().connected() > 0 {
            return false;
        }
        if self.pool.last_activity().elapsed() < grace {
            return false;
        }

        lifecycle.state = AgentState::Offline;
        lifecycle.offline_since = Some(Instant::now());
        info!(client_id = %self.client_id, "Tunnel offline");
        true
    }

    /// Whether the tunnel has been offline, without connections, for at least
    /// `removal_grace`
    pub fn should_remove(&self, removal_grace: Duration) -> bool {
        let lifecycle = self.lifecycle();
        match (lifecycle.state, lifecycle.offline_since) {
            (AgentState::Offline, Some(since)) => {
                since.elapsed() >= removal_grace && self.pool.stats().connected() == 0
            }
            _ => false,
        }
    }

    /// Drop idle connections the client has closed
    pub fn prune_closed(&self) -> usize {
        self.pool.prune_closed()
    }

    /// Terminal transition: close idle connections and fail pending acquires
    pub fn close(&self) {
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == AgentState::Removed {
                return;
            }
            lifecycle.state = AgentState::Removed;
        }
        self.pool.close();
        info!(client_id = %self.client_id, "Tunnel removed");
    }

    pub fn stats(&self) -> AgentStats {
        let pool = self.pool.stats();
        AgentStats {
            connected_sockets: pool.connected(),
            idle: pool.idle,
            in_use: pool.in_use,
            waiting: pool.waiting,
            max_sockets: pool.max_sockets,
            state: self.state(),
        }
    }
}

impl std::fmt::Debug for TunnelAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAgent")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(max_sockets: usize) -> TunnelAgent {
        TunnelAgent::new(ClientId::parse("demo").unwrap(), max_sockets)
    }

    fn conn() -> (BackendConnection, tokio::io::DuplexStream) {
        let (local, remote) = tokio::io::duplex(256);
        (BackendConnection::new(local), remote)
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_goes_offline_without_connections() {
        let agent = agent(2);
        assert_eq!(agent.state(), AgentState::Initial);

        assert!(!agent.mark_offline_if_idle_expired(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(agent.mark_offline_if_idle_expired(Duration::from_secs(2)));
        assert_eq!(agent.state(), AgentState::Offline);

        // Second call is a no-op
        assert!(!agent.mark_offline_if_idle_expired(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_online_removed_cycle() {
        let agent = agent(2);
        let (c, _remote) = conn();
        agent.register_backend_connection(c).unwrap();
        assert_eq!(agent.state(), AgentState::Online);

        // Idle connection keeps the tunnel online
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!agent.mark_offline_if_idle_expired(Duration::from_secs(2)));

        let claimed = agent
            .acquire_backend_connection(Duration::from_secs(1))
            .await
            .unwrap();
        agent.discard(claimed);
        assert_eq!(agent.stats().connected_sockets, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(agent.mark_offline_if_idle_expired(Duration::from_secs(2)));
        assert!(!agent.should_remove(Duration::from_secs(10)));

        // Reconnect brings it back
        let (c, _remote2) = conn();
        agent.register_backend_connection(c).unwrap();
        assert_eq!(agent.state(), AgentState::Online);
        assert!(!agent.should_remove(Duration::ZERO));

        let claimed = agent
            .acquire_backend_connection(Duration::from_secs(1))
            .await
            .unwrap();
        drop(claimed);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(agent.mark_offline_if_idle_expired(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(agent.should_remove(Duration::from_secs(10)));

        agent.close();
        assert_eq!(agent.state(), AgentState::Removed);
        assert!(!agent.should_remove(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_removed_agent_rejects_connections() {
        let agent = agent(2);
        agent.close();

        let (c, _remote) = conn();
        assert_eq!(
            agent.register_backend_connection(c),
            Err(PoolError::Closed)
        );
        assert_eq!(
            agent
                .acquire_backend_connection(Duration::from_secs(1))
                .await
                .unwrap_err(),
            PoolError::Closed
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let agent = agent(3);
        let (a, _ra) = conn();
        let (b, _rb) = conn();
        agent.register_backend_connection(a).unwrap();
        agent.register_backend_connection(b).unwrap();

        let _claimed = agent
            .acquire_backend_connection(Duration::from_secs(1))
            .await
            .unwrap();

        let stats = agent.stats();
        assert_eq!(stats.connected_sockets, 2);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.max_sockets, 3);
        assert_eq!(stats.state, AgentState::Online);
    }

    #[test]
    fn test_offline_decision_never_strands_a_registered_connection() {
        for _ in 0..2000 {
            let agent = agent(2);
            let (c, _remote) = conn();
            let barrier = std::sync::Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    agent.register_backend_connection(c).unwrap();
                });
                scope.spawn(|| {
                    barrier.wait();
                    agent.mark_offline_if_idle_expired(Duration::ZERO);
                });
            });

            // Whichever side won, the connection keeps the tunnel alive
            assert_eq!(agent.stats().connected_sockets, 1);
            assert_eq!(agent.state(), AgentState::Online);
            assert!(!agent.should_remove(Duration::ZERO));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_tunnel_with_connection_is_not_removed() {
        let agent = agent(2);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(agent.mark_offline_if_idle_expired(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(agent.should_remove(Duration::from_secs(10)));

        let (c, _remote) = conn();
        agent.register_backend_connection(c).unwrap();
        assert!(!agent.should_remove(Duration::ZERO));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AgentState::Offline).unwrap(),
            "\"offline\""
        );
    }
}
