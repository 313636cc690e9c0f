//! Registry of active tunnels
//!
//! Maps identities to [`TunnelAgent`]s. Creation is atomic per identity: the
//! map entry is claimed and filled in one step, so concurrent creations of the
//! same identity cannot both succeed. Lookups never block on pool state.

use crate::agent::{AgentState, TunnelAgent};
use crate::config::RegistryConfig;
use crate::task_tracker::TaskTracker;
use burrow_proto::{ClientId, IdentityError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Attempts at generating an unused identity before giving up
const MAX_GENERATE_ATTEMPTS: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid subdomain: {0}")]
    InvalidIdentifier(#[from] IdentityError),

    #[error("Subdomain '{0}' is already in use")]
    IdentifierTaken(String),

    #[error("Tunnel capacity exceeded")]
    CapacityExceeded,

    #[error("Tunnel '{0}' is not connected")]
    Disconnected(String),
}

/// Result of a successful tunnel creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub max_sockets: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RegistryStats {
    pub tunnel_count: usize,
    pub total_connected_sockets: usize,
}

pub struct TunnelRegistry {
    config: RegistryConfig,
    clients: DashMap<String, Arc<TunnelAgent>>,
    /// Live tunnels plus in-flight creations holding a slot
    tunnel_slots: AtomicUsize,
    /// Backend connections held across all tunnels
    total_sockets: Arc<AtomicUsize>,
    tasks: TaskTracker,
}

impl TunnelRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        info!(
            max_sockets = config.max_sockets,
            max_tunnels = ?config.max_tunnels,
            max_total_sockets = ?config.max_total_sockets,
            "Creating tunnel registry"
        );
        Self {
            config,
            clients: DashMap::new(),
            tunnel_slots: AtomicUsize::new(0),
            total_sockets: Arc::new(AtomicUsize::new(0)),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Create a tunnel under `requested`, or under a fresh generated identity
    pub fn create_client(&self, requested: Option<&str>) -> Result<ClientInfo, RegistryError> {
        match requested {
            Some(requested) => {
                let client_id = ClientId::parse(requested)?;
                self.try_insert(client_id)?
                    .ok_or_else(|| RegistryError::IdentifierTaken(requested.to_string()))
            }
            None => {
                for _ in 0..MAX_GENERATE_ATTEMPTS {
                    if let Some(info) = self.try_insert(ClientId::generate())? {
                        return Ok(info);
                    }
                }
                warn!("Could not generate an unused tunnel identity");
                Err(RegistryError::CapacityExceeded)
            }
        }
    }

    /// Insert a new agent if the identity is free; `Ok(None)` when taken
    fn try_insert(&self, client_id: ClientId) -> Result<Option<ClientInfo>, RegistryError> {
        match self.clients.entry(client_id.as_str().to_string()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                let agent = Arc::new(TunnelAgent::with_shared_counter(
                    client_id.clone(),
                    self.config.max_sockets,
                    self.total_sockets.clone(),
                    self.config.max_total_sockets,
                ));
                entry.insert(agent);

                info!(client_id = %client_id, max_sockets = self.config.max_sockets, "Tunnel created");
                Ok(Some(ClientInfo {
                    client_id,
                    max_sockets: self.config.max_sockets,
                }))
            }
        }
    }

    fn reserve_slot(&self) -> Result<(), RegistryError> {
        match self.config.max_tunnels {
            None => {
                self.tunnel_slots.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(max) => self
                .tunnel_slots
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
                .map(|_| ())
                .map_err(|_| {
                    warn!(max_tunnels = max, "Tunnel capacity exceeded");
                    RegistryError::CapacityExceeded
                }),
        }
    }

    pub fn get_client(&self, client_id: &str) -> Option<Arc<TunnelAgent>> {
        self.clients.get(client_id).map(|entry| entry.value().clone())
    }

    /// Like [`get_client`](Self::get_client), reporting an absent tunnel as an error
    pub fn require_client(&self, client_id: &str) -> Result<Arc<TunnelAgent>, RegistryError> {
        self.get_client(client_id)
            .ok_or_else(|| RegistryError::Disconnected(client_id.to_string()))
    }

    pub fn has_client(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Remove a tunnel, close its agent and abort its tasks
    pub fn remove_client(&self, client_id: &str) -> Option<Arc<TunnelAgent>> {
        let (_, agent) = self.clients.remove_if(client_id, |id, _| {
            self.tasks.unregister(id);
            true
        })?;
        self.finish_removal(&agent);
        Some(agent)
    }

    /// Remove `agent` only if it is still the one registered under its id
    ///
    /// A newer tunnel that reused the id, and the tasks it owns, are left alone.
    pub fn remove_agent(&self, agent: &Arc<TunnelAgent>) -> bool {
        let removed = self
            .clients
            .remove_if(agent.client_id().as_str(), |id, current| {
                if !Arc::ptr_eq(current, agent) {
                    return false;
                }
                self.tasks.unregister(id);
                true
            })
            .is_some();
        if removed {
            self.finish_removal(agent);
        }
        removed
    }

    fn finish_removal(&self, agent: &Arc<TunnelAgent>) {
        self.tunnel_slots.fetch_sub(1, Ordering::SeqCst);
        agent.close();
    }

    /// Snapshot of live tunnels, ordered by identity
    pub fn list_clients(&self) -> Vec<Arc<TunnelAgent>> {
        let mut agents: Vec<_> = self
            .clients
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        agents.sort_by(|a, b| a.client_id().cmp(b.client_id()));
        agents
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            tunnel_count: self.clients.len(),
            total_connected_sockets: self.total_sockets.load(Ordering::SeqCst),
        }
    }

    /// Tie a background task to `agent`; it is aborted when the agent is removed
    ///
    /// The task is aborted right away if `agent` is no longer the tunnel
    /// registered under its id.
    pub fn track_task(&self, agent: &Arc<TunnelAgent>, handle: JoinHandle<()>) {
        let client_id = agent.client_id().as_str();
        // The shard guard keeps removal of this entry out until the task is filed
        match self.clients.get(client_id) {
            Some(current) if Arc::ptr_eq(current.value(), agent) => {
                self.tasks.register(client_id, handle);
            }
            _ => {
                debug!(client_id = %client_id, "Tunnel already gone, aborting task");
                handle.abort();
            }
        }
    }

    /// One lifecycle pass over every tunnel
    ///
    /// Prunes dead idle connections, marks tunnels without connections offline
    /// after the offline grace and removes tunnels offline past the removal
    /// grace. Returns the number of tunnels removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for agent in self.list_clients() {
            agent.prune_closed();
            agent.mark_offline_if_idle_expired(self.config.offline_grace);

            if agent.should_remove(self.config.removal_grace) && self.remove_agent(&agent) {
                debug!(client_id = %agent.client_id(), "Removed offline tunnel");
                removed += 1;
            }
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the registry is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep();
            }
        })
    }

    /// Remove every tunnel and abort every tracked task
    pub fn shutdown(&self) {
        let agents = self.list_clients();
        info!(tunnels = agents.len(), "Shutting down tunnel registry");

        for agent in agents {
            self.remove_agent(&agent);
        }
        self.tasks.abort_all();
    }

    /// Number of tunnels currently in `state`
    pub fn count_in_state(&self, state: AgentState) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().state() == state)
            .count()
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
