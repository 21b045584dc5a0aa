//! Raft configuration parameters

use std::time::Duration;

/// Configuration for Raft timing parameters
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by leader (default: 50ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 150ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 300ms)
    pub election_timeout_max: Duration,
    /// Upper bound on a single outbound RPC (default: 100ms)
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            rpc_timeout: Duration::from_millis(100),
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max.max(min);
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Generate a random election timeout within the configured range.
    /// Called once per timeout cycle so peers drift apart after a split vote.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = (self.election_timeout_max.as_millis() as u64).max(min_ms);
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}
