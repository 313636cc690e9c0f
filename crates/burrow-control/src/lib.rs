//! Tunnel relay engine
//!
//! Owns the registry of active tunnels, each tunnel's agent (lifecycle state plus
//! a pool of single-use backend connections), and the background tasks tied to a
//! tunnel's lifetime.
pub mod agent;
pub mod config;
pub mod connection;
pub mod pool;
pub mod registry;
pub mod task_tracker;

pub use agent::{AgentState, AgentStats, TunnelAgent};
pub use config::{RegistryConfig, DEFAULT_ACQUIRE_TIMEOUT};
pub use connection::{BackendConnection, BackendStream};
pub use pool::{ConnectionPool, PoolError, PoolStats, PooledConnection};
pub use registry::{ClientInfo, RegistryError, RegistryStats, TunnelRegistry};
pub use task_tracker::TaskTracker;
