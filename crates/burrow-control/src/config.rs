//! Registry and tunnel lifecycle configuration

use burrow_proto::DEFAULT_MAX_SOCKETS;
use std::time::Duration;

/// Default time a request waits for a backend connection
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time a tunnel may sit with zero connections before it goes offline
pub const DEFAULT_OFFLINE_GRACE: Duration = Duration::from_secs(2);

/// Default time an offline tunnel is kept before removal
pub const DEFAULT_REMOVAL_GRACE: Duration = Duration::from_secs(10);

/// Default interval between lifecycle sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Per-tunnel connection limit
    pub max_sockets: usize,
    /// Maximum number of live tunnels (unlimited when `None`)
    pub max_tunnels: Option<usize>,
    /// Relay-wide backend connection limit (unlimited when `None`)
    pub max_total_sockets: Option<usize>,
    pub acquire_timeout: Duration,
    pub offline_grace: Duration,
    pub removal_grace: Duration,
    pub sweep_interval: Duration,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self {
            max_sockets: DEFAULT_MAX_SOCKETS,
            max_tunnels: None,
            max_total_sockets: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            offline_grace: DEFAULT_OFFLINE_GRACE,
            removal_grace: DEFAULT_REMOVAL_GRACE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_max_sockets(mut self, max_sockets: usize) -> Self {
        self.max_sockets = max_sockets.max(1);
        self
    }

    pub fn with_max_tunnels(mut self, max_tunnels: Option<usize>) -> Self {
        self.max_tunnels = max_tunnels;
        self
    }

    pub fn with_max_total_sockets(mut self, max_total_sockets: Option<usize>) -> Self {
        self.max_total_sockets = max_total_sockets;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_offline_grace(mut self, grace: Duration) -> Self {
        self.offline_grace = grace;
        self
    }

    pub fn with_removal_grace(mut self, grace: Duration) -> Self {
        self.removal_grace = grace;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::default();
        assert_eq!(config.max_sockets, 10);
        assert_eq!(config.max_tunnels, None);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.offline_grace, Duration::from_secs(2));
        assert_eq!(config.removal_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_max_sockets_is_at_least_one() {
        let config = RegistryConfig::new().with_max_sockets(0);
        assert_eq!(config.max_sockets, 1);
    }
}
