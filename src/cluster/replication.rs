use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::message::{Operation, ReplicationRecord, Request};
use super::node::ClusterNode;
use super::transport::Transport;

/// Downstream hook fired after a bid write commits on this node. The
/// monitoring surface uses it to push live updates to connected clients.
pub trait BidNotifier: Send + Sync {
    fn bid_committed(&self, auction_id: &str, bidder_id: &str, amount: f64, logical_ts: u64);
}

impl<T: Transport + 'static> ClusterNode<T> {
    /// Best-effort relay after a local commit: one `ReplicateData` push per
    /// committed operation to every active peer. No acknowledgment tracking,
    /// no retry queue; a failed push is logged and dropped. Convergence for
    /// missed records is the responsibility of the commit path itself.
    pub(crate) fn relay_after_commit(&self, operations: &[Operation]) {
        let peers = self.membership.active_ids();
        if peers.is_empty() {
            return;
        }
        for operation in operations {
            let record = ReplicationRecord {
                operation_id: Uuid::new_v4().to_string(),
                kind: operation.kind,
                table: operation.table.clone(),
                record_id: operation.record_id.clone(),
                payload: operation.payload.clone(),
                logical_timestamp: self.clock.tick(),
            };
            for &peer_id in &peers {
                let transport = Arc::clone(&self.transport);
                let fanout = Arc::clone(&self.fanout);
                let record = record.clone();
                tokio::spawn(async move {
                    let _permit = fanout.acquire_owned().await;
                    if let Err(e) = transport
                        .call(peer_id, Request::ReplicateData(record))
                        .await
                    {
                        warn!(peer_id, error = %e, "replication push failed");
                    }
                });
            }
        }
    }

    /// Applies an inbound replication record: merges the sender's logical
    /// timestamp and stages the record in the cache keyed by operation id,
    /// which also makes duplicate pushes a no-op. A missing cache degrades
    /// to clock-merge only; the record is still acknowledged.
    pub(crate) fn apply_replication(&self, record: &ReplicationRecord) -> bool {
        self.clock.merge(record.logical_timestamp);
        let Some(cache) = &self.cache else {
            debug!(
                operation_id = %record.operation_id,
                "no cache collaborator, replication record dropped"
            );
            return true;
        };

        let key = format!("replication:{}", record.operation_id);
        if cache.get(&key).is_some() {
            debug!(operation_id = %record.operation_id, "duplicate replication record ignored");
            return true;
        }
        // staged in a decodable form so the collaborator layer can re-apply it
        match toml::to_string(record) {
            Ok(encoded) => {
                cache.set(&key, &encoded);
                debug!(
                    operation_id = %record.operation_id,
                    table = %record.table,
                    "replication record staged"
                );
            }
            Err(e) => warn!(
                operation_id = %record.operation_id,
                error = %e,
                "replication record could not be encoded"
            ),
        }
        true
    }
}
