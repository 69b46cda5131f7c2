use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cluster::error::{ClusterError, ClusterResult};

/// Node configuration. Every field has a default so a partial toml file
/// (or none at all) is enough to boot a single-node cluster.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Cluster-unique integer identity, also the election tie-breaker.
    pub server_id: u32,
    pub host: String,
    pub port: u16,
    /// Comma-delimited peer addresses, e.g. "auction-server-2:1102,auction-server-3:1103".
    pub peers: String,
    /// Per-call timeout for 2PC prepare/commit fan-out.
    pub prepare_timeout_ms: u64,
    /// Timeout applied to every other outbound remote call.
    pub call_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Berkeley synchronization period (leader only).
    pub sync_interval_ms: u64,
    /// How long a bully initiator waits before self-promoting.
    pub election_timeout_ms: u64,
    pub bid_lock_ttl_ms: u64,
    /// Age after which a non-terminal transaction is aborted by the sweep.
    pub txn_expiry_ms: u64,
    /// Bound on concurrent outbound fan-out calls.
    pub fanout_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_id: 1,
            host: "0.0.0.0".to_string(),
            port: 1101,
            peers: String::new(),
            prepare_timeout_ms: 3000,
            call_timeout_ms: 2000,
            heartbeat_interval_ms: 5000,
            sync_interval_ms: 30_000,
            election_timeout_ms: 5000,
            bid_lock_ttl_ms: 30_000,
            txn_expiry_ms: 60_000,
            fanout_workers: 16,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> ClusterResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| ClusterError::Config(e.to_string()))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn bid_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.bid_lock_ttl_ms)
    }

    pub fn txn_expiry(&self) -> Duration {
        Duration::from_millis(self.txn_expiry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.server_id, 1);
        assert_eq!(config.port, 1101);
        assert_eq!(config.fanout_workers, 16);
        assert_eq!(config.listen_addr(), "0.0.0.0:1101");
    }

    #[test]
    fn test_partial_toml() {
        let config: Config =
            toml::from_str("server_id = 3\nport = 1103\npeers = \"auction-server-1:1101\"")
                .unwrap();
        assert_eq!(config.server_id, 3);
        assert_eq!(config.port, 1103);
        assert_eq!(config.peers, "auction-server-1:1101");
        // untouched fields keep their defaults
        assert_eq!(config.prepare_timeout_ms, 3000);
    }
}
