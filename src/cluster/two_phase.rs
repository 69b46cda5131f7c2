use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

use super::message::{Operation, OperationKind, Request};
use super::node::ClusterNode;
use super::transport::Transport;
use crate::storage::ApplyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Init,
    Preparing,
    Prepared,
    Aborted,
    Committing,
    Committed,
}

impl TxnPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnPhase::Committed | TxnPhase::Aborted)
    }
}

/// A write transaction tracked on one node. The participant set is frozen at
/// creation: membership changes mid-transaction do not re-plan the fan-out,
/// a vanished participant just fails as unreachable.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub operations: Vec<Operation>,
    pub participants: Vec<u32>,
    pub phase: TxnPhase,
    pub created_at: Instant,
}

/// Append-style log entry recording each phase transition, consumed by the
/// startup recovery pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnLogEntry {
    pub transaction_id: String,
    pub status: TxnPhase,
    pub timestamp_ms: u64,
}

/// Local half of the Two-Phase Commit protocol: the transaction table, the
/// phase log, and the prepare/commit/abort handlers every participant
/// (coordinator included) runs against its own state.
pub struct TransactionManager {
    transactions: RwLock<HashMap<String, Transaction>>,
    log: Mutex<Vec<TxnLogEntry>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            transactions: RwLock::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Registers a coordinator-side transaction with its frozen participant
    /// set.
    pub fn begin(&self, transaction_id: &str, operations: Vec<Operation>, participants: Vec<u32>) {
        self.transactions.write().insert(
            transaction_id.to_string(),
            Transaction {
                id: transaction_id.to_string(),
                operations,
                participants,
                phase: TxnPhase::Init,
                created_at: Instant::now(),
            },
        );
    }

    /// Phase 1 on this node: validate and stage the operations. Returning
    /// false aborts the whole transaction at the coordinator.
    pub fn prepare_local(&self, transaction_id: &str, operations: &[Operation]) -> bool {
        if !operations.iter().all(validate_operation) {
            warn!(transaction_id, "local prepare failed validation");
            return false;
        }
        if !check_resource_availability(operations) {
            warn!(transaction_id, "local prepare failed resource check");
            return false;
        }

        let mut transactions = self.transactions.write();
        let txn = transactions
            .entry(transaction_id.to_string())
            .or_insert_with(|| Transaction {
                id: transaction_id.to_string(),
                operations: operations.to_vec(),
                participants: Vec::new(),
                phase: TxnPhase::Init,
                created_at: Instant::now(),
            });
        txn.operations = operations.to_vec();
        txn.phase = TxnPhase::Prepared;
        drop(transactions);

        self.append_log(transaction_id, TxnPhase::Prepared);
        debug!(transaction_id, "local prepare succeeded");
        true
    }

    /// Phase 2 on this node: materialize every staged operation through the
    /// write-apply collaborator. Terminal - the transaction leaves the table.
    pub fn commit_local(&self, transaction_id: &str, store: &dyn ApplyStore) -> bool {
        let operations = {
            let mut transactions = self.transactions.write();
            let Some(txn) = transactions.get_mut(transaction_id) else {
                error!(transaction_id, "commit for unknown transaction");
                return false;
            };
            txn.phase = TxnPhase::Committing;
            txn.operations.clone()
        };

        for operation in &operations {
            let result = match operation.kind {
                OperationKind::Insert => store.apply_insert(operation),
                OperationKind::Update => store.apply_update(operation),
                OperationKind::Delete => store.apply_delete(operation),
            };
            if let Err(e) = result {
                error!(transaction_id, error = %e, "local commit failed");
                return false;
            }
        }

        self.transactions.write().remove(transaction_id);
        self.append_log(transaction_id, TxnPhase::Committed);
        debug!(transaction_id, "local commit succeeded");
        true
    }

    /// Abort on this node. Always succeeds from the caller's perspective;
    /// aborting an unknown (already cleaned up) transaction is not an error.
    pub fn abort_local(&self, transaction_id: &str) -> bool {
        let removed = self.transactions.write().remove(transaction_id);
        if removed.is_none() {
            debug!(transaction_id, "abort for already cleaned up transaction");
            return true;
        }
        self.append_log(transaction_id, TxnPhase::Aborted);
        info!(transaction_id, "transaction aborted locally");
        true
    }

    pub fn contains(&self, transaction_id: &str) -> bool {
        self.transactions.read().contains_key(transaction_id)
    }

    pub fn phase(&self, transaction_id: &str) -> Option<TxnPhase> {
        self.transactions.read().get(transaction_id).map(|t| t.phase)
    }

    pub fn log_entries(&self) -> Vec<TxnLogEntry> {
        self.log.lock().clone()
    }

    /// Startup recovery: any transaction whose last logged status is
    /// `Prepared` was in flight when the node went down and is aborted.
    pub fn recover(&self) {
        let mut last_status: HashMap<String, TxnPhase> = HashMap::new();
        for entry in self.log.lock().iter() {
            last_status.insert(entry.transaction_id.clone(), entry.status);
        }
        for (transaction_id, status) in last_status {
            if status == TxnPhase::Prepared {
                info!(transaction_id = %transaction_id, "recovering prepared transaction");
                self.abort_local(&transaction_id);
            }
        }
    }

    /// Aborts non-terminal transactions older than `max_age`. Run from the
    /// periodic expiry sweep; covers participants whose coordinator died
    /// between prepare and commit.
    pub fn expire_stale(&self, max_age: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .transactions
            .read()
            .values()
            .filter(|txn| !txn.phase.is_terminal() && txn.created_at.elapsed() >= max_age)
            .map(|txn| txn.id.clone())
            .collect();
        for transaction_id in &expired {
            warn!(transaction_id = %transaction_id, "expiring stale transaction");
            self.abort_local(transaction_id);
        }
        expired
    }

    fn append_log(&self, transaction_id: &str, status: TxnPhase) {
        let timestamp_ms = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        self.log.lock().push(TxnLogEntry {
            transaction_id: transaction_id.to_string(),
            status,
            timestamp_ms,
        });
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        TransactionManager::new()
    }
}

fn validate_operation(operation: &Operation) -> bool {
    match operation.kind {
        OperationKind::Insert => !operation.payload.is_empty(),
        OperationKind::Update => !operation.record_id.is_empty() && !operation.payload.is_empty(),
        OperationKind::Delete => !operation.record_id.is_empty(),
    }
}

// Resource-availability hook (locks, constraints). No-op placeholder, the
// per-auction bid lock lives on the cache collaborator instead.
fn check_resource_availability(_operations: &[Operation]) -> bool {
    true
}

impl<T: Transport + 'static> ClusterNode<T> {
    /// Drives a full Two-Phase Commit across the frozen participant set.
    ///
    /// Phase 1 prepares locally, then fans `Prepare` out to every remote
    /// participant under the configured per-call timeout; any refusal,
    /// timeout or unreachable peer aborts everywhere. Phase 2 commits
    /// locally, then fans `Commit` out; a peer-commit failure degrades the
    /// returned flag to false but already-applied commits are not rolled
    /// back.
    pub async fn execute_transaction(
        &self,
        transaction_id: &str,
        operations: Vec<Operation>,
    ) -> bool {
        let self_id = self.config.server_id;
        let mut participants = vec![self_id];
        participants.extend(self.membership.active_ids());
        let remote: Vec<u32> = participants
            .iter()
            .copied()
            .filter(|&id| id != self_id)
            .collect();

        info!(transaction_id, participants = ?participants, "executing 2PC transaction");
        self.txns
            .begin(transaction_id, operations.clone(), participants);

        // Phase 1: prepare
        if !self.txns.prepare_local(transaction_id, &operations) {
            self.abort_remote(transaction_id, &remote);
            self.txns.abort_local(transaction_id);
            return false;
        }

        let votes = self
            .fan_out(&remote, self.config.prepare_timeout(), |_peer| {
                Request::Prepare {
                    transaction_id: transaction_id.to_string(),
                    operations: operations.clone(),
                }
            })
            .await;
        if votes.iter().any(|(_, prepared)| !prepared) {
            let refused: Vec<u32> = votes
                .iter()
                .filter(|(_, prepared)| !prepared)
                .map(|(id, _)| *id)
                .collect();
            warn!(transaction_id, refused = ?refused, "prepare phase failed, aborting");
            self.abort_remote(transaction_id, &remote);
            self.txns.abort_local(transaction_id);
            return false;
        }

        // Phase 2: commit
        if !self.txns.commit_local(transaction_id, self.storage.as_ref()) {
            error!(transaction_id, "coordinator commit failed");
            return false;
        }

        let results = self
            .fan_out(&remote, self.config.prepare_timeout(), |_peer| {
                Request::Commit {
                    transaction_id: transaction_id.to_string(),
                }
            })
            .await;
        let all_committed = results.iter().all(|(_, committed)| *committed);
        if !all_committed {
            // Accepted inconsistency window: successful participants stay
            // committed; convergence is left to the replication relay.
            let failed: Vec<u32> = results
                .iter()
                .filter(|(_, committed)| !committed)
                .map(|(id, _)| *id)
                .collect();
            warn!(transaction_id, failed = ?failed, "some participants failed to commit");
        }

        info!(transaction_id, committed = all_committed, "2PC transaction completed");
        all_committed
    }

    /// Parallel fan-out bounded by the worker-pool semaphore. Each call runs
    /// under `per_call`; a timed-out call counts as a false vote.
    pub(crate) async fn fan_out(
        &self,
        peers: &[u32],
        per_call: Duration,
        make_request: impl Fn(u32) -> Request,
    ) -> Vec<(u32, bool)> {
        let mut handles = Vec::with_capacity(peers.len());
        for &peer_id in peers {
            let request = make_request(peer_id);
            let transport = std::sync::Arc::clone(&self.transport);
            let fanout = std::sync::Arc::clone(&self.fanout);
            handles.push(tokio::spawn(async move {
                let _permit = fanout.acquire_owned().await;
                let outcome =
                    tokio::time::timeout(per_call, transport.call(peer_id, request)).await;
                let acked = matches!(outcome, Ok(Ok(ref response)) if response.as_ack());
                (peer_id, acked)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(result) = handle.await {
                results.push(result);
            }
        }
        results
    }

    /// Fire-and-forget abort to every remote participant. Local cleanup is
    /// the caller's responsibility and always runs synchronously.
    pub(crate) fn abort_remote(&self, transaction_id: &str, peers: &[u32]) {
        for &peer_id in peers {
            let transport = std::sync::Arc::clone(&self.transport);
            let fanout = std::sync::Arc::clone(&self.fanout);
            let transaction_id = transaction_id.to_string();
            tokio::spawn(async move {
                let _permit = fanout.acquire_owned().await;
                if let Err(e) = transport
                    .call(peer_id, Request::Abort { transaction_id })
                    .await
                {
                    warn!(peer_id, error = %e, "abort delivery failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::collections::HashMap;

    fn insert_op(record_id: &str) -> Operation {
        let mut payload = HashMap::new();
        payload.insert("amount".to_string(), "150.0".to_string());
        Operation::new(OperationKind::Insert, "bids", record_id, payload)
    }

    #[test]
    fn test_prepare_rejects_empty_insert_payload() {
        let txns = TransactionManager::new();
        let op = Operation::new(OperationKind::Insert, "bids", "b1", HashMap::new());
        assert!(!txns.prepare_local("txn-1", &[op]));
        assert!(!txns.contains("txn-1"));
    }

    #[test]
    fn test_prepare_rejects_update_without_record_id() {
        let txns = TransactionManager::new();
        let mut payload = HashMap::new();
        payload.insert("status".to_string(), "CLOSED".to_string());
        let op = Operation::new(OperationKind::Update, "auctions", "", payload);
        assert!(!txns.prepare_local("txn-1", &[op]));
    }

    #[test]
    fn test_commit_applies_staged_operations() {
        let txns = TransactionManager::new();
        let store = MemoryStore::new();
        assert!(txns.prepare_local("txn-1", &[insert_op("b1")]));
        assert_eq!(txns.phase("txn-1"), Some(TxnPhase::Prepared));

        assert!(txns.commit_local("txn-1", &store));
        assert!(!txns.contains("txn-1"));
        assert_eq!(
            store.get("bids", "b1").and_then(|r| r.get("amount").cloned()),
            Some("150.0".to_string())
        );
    }

    #[test]
    fn test_commit_unknown_transaction_fails() {
        let txns = TransactionManager::new();
        let store = MemoryStore::new();
        assert!(!txns.commit_local("nope", &store));
    }

    #[test]
    fn test_abort_unknown_transaction_is_ok() {
        let txns = TransactionManager::new();
        assert!(txns.abort_local("already-gone"));
    }

    #[test]
    fn test_recover_aborts_prepared_transactions() {
        let txns = TransactionManager::new();
        let store = MemoryStore::new();
        txns.prepare_local("txn-committed", &[insert_op("b1")]);
        txns.commit_local("txn-committed", &store);
        txns.prepare_local("txn-in-flight", &[insert_op("b2")]);

        txns.recover();
        assert!(!txns.contains("txn-in-flight"));
        let entries = txns.log_entries();
        let last = entries
            .iter()
            .rev()
            .find(|e| e.transaction_id == "txn-in-flight")
            .unwrap();
        assert_eq!(last.status, TxnPhase::Aborted);
    }

    #[test]
    fn test_expire_stale_only_touches_old_transactions() {
        let txns = TransactionManager::new();
        txns.prepare_local("txn-fresh", &[insert_op("b1")]);
        let expired = txns.expire_stale(Duration::from_secs(60));
        assert!(expired.is_empty());
        assert!(txns.contains("txn-fresh"));

        let expired = txns.expire_stale(Duration::ZERO);
        assert_eq!(expired, vec!["txn-fresh".to_string()]);
        assert!(!txns.contains("txn-fresh"));
    }
}
