use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::transport::Transport;

/// A known replica. Identity is the cluster-unique integer id, which also
/// provides the total order used for election tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNode {
    pub id: u32,
    pub addr: String,
    pub last_heartbeat_ok: bool,
}

/// The set of known peers and their liveness. Peers that fail a heartbeat
/// are removed from the active set but never blacklisted - the reconnect
/// sweep re-dials every configured address that is currently missing.
pub struct Membership {
    self_id: u32,
    configured: Vec<(String, u16)>,
    peers: RwLock<HashMap<u32, PeerNode>>,
    latencies: Mutex<HashMap<u32, Duration>>,
}

impl Membership {
    /// `peer_list` is the comma-delimited configuration value, e.g.
    /// "auction-server-2:1102,auction-server-3:1103". Malformed entries are
    /// skipped.
    pub fn new(self_id: u32, peer_list: &str) -> Self {
        let configured = peer_list
            .split(',')
            .filter_map(|entry| {
                let entry = entry.trim();
                let (host, port) = entry.rsplit_once(':')?;
                let port = port.parse::<u16>().ok()?;
                Some((host.to_string(), port))
            })
            .collect();
        Membership {
            self_id,
            configured,
            peers: RwLock::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
        }
    }

    /// Dials every configured peer that is not self and not already in the
    /// active set. Connection failures are logged at debug and left for the
    /// next sweep; they are never fatal.
    pub async fn connect<T: Transport>(&self, transport: &T) {
        for (host, port) in &self.configured {
            let peer_id = derive_peer_id(host, *port, self.self_id);
            if peer_id == self.self_id || self.contains(peer_id) {
                continue;
            }
            let addr = format!("{host}:{port}");
            match transport.add_node(peer_id, addr.clone()).await {
                Ok(()) => {
                    info!(peer_id, addr = %addr, "connected to peer");
                    self.peers.write().insert(
                        peer_id,
                        PeerNode {
                            id: peer_id,
                            addr,
                            last_heartbeat_ok: true,
                        },
                    );
                }
                Err(e) => debug!(peer_id, addr = %addr, error = %e, "peer connect failed, will retry"),
            }
        }
    }

    pub fn contains(&self, peer_id: u32) -> bool {
        self.peers.read().contains_key(&peer_id)
    }

    /// Active peer ids in ascending order.
    pub fn active_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.peers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Removes a peer from the active set (heartbeat failure). The transport
    /// connection is dropped so the reconnect sweep can re-establish it.
    pub async fn remove<T: Transport>(&self, transport: &T, peer_id: u32) {
        if self.peers.write().remove(&peer_id).is_some() {
            info!(peer_id, "removed peer from active set");
        }
        let _ = transport.remove_node(peer_id).await;
        self.latencies.lock().remove(&peer_id);
    }

    pub fn mark_heartbeat(&self, peer_id: u32, ok: bool) {
        if let Some(peer) = self.peers.write().get_mut(&peer_id) {
            peer.last_heartbeat_ok = ok;
        }
    }

    /// Heartbeat round-trip per peer; doubles as the replication-lag metric
    /// read by the monitoring surface.
    pub fn record_latency(&self, peer_id: u32, latency: Duration) {
        self.latencies.lock().insert(peer_id, latency);
    }

    pub fn latencies(&self) -> HashMap<u32, Duration> {
        self.latencies.lock().clone()
    }

    pub fn snapshot(&self) -> Vec<PeerNode> {
        let mut peers: Vec<PeerNode> = self.peers.read().values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }
}

/// Derives a peer's numeric id from its address. Hostnames embedding digits
/// (e.g. "auction-server-2") win; otherwise ports in the conventional
/// 1101..=1103 block map to ids 1..=3; otherwise the port itself is the id.
pub fn derive_peer_id(host: &str, port: u16, self_id: u32) -> u32 {
    for part in host.split('-') {
        if let Ok(id) = part.parse::<u32>() {
            if id != self_id {
                return id;
            }
        }
    }
    if (1101..=1103).contains(&port) {
        return u32::from(port) - 1100;
    }
    u32::from(port)
}
