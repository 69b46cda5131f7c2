use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::election::ElectionState;
use super::membership::Membership;
use super::message::{
    BidOutcome, BidRequest, HeartbeatReply, Operation, OperationKind, Request, Response,
    ServerStatus,
};
use super::replication::BidNotifier;
use super::transport::Transport;
use super::two_phase::TransactionManager;
use crate::cache::CacheStore;
use crate::clock::berkeley;
use crate::clock::lamport::LamportClock;
use crate::config::Config;
use crate::storage::ApplyStore;

/// One auction replica's coordination state: membership, elections, the
/// transaction table, the logical clock, and the collaborator seams to
/// storage, cache and the notification surface. Cloning is cheap - every
/// component is shared - so background tasks just carry their own handle.
pub struct ClusterNode<T: Transport> {
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<T>,
    pub(crate) membership: Arc<Membership>,
    pub(crate) clock: Arc<LamportClock>,
    pub(crate) election: Arc<ElectionState>,
    pub(crate) txns: Arc<TransactionManager>,
    pub(crate) storage: Arc<dyn ApplyStore>,
    pub(crate) cache: Option<Arc<dyn CacheStore>>,
    pub(crate) notifier: Option<Arc<dyn BidNotifier>>,
    pub(crate) fanout: Arc<Semaphore>,
    start_time: Instant,
    pub(crate) active_connections: Arc<AtomicUsize>,
}

impl<T: Transport> Clone for ClusterNode<T> {
    fn clone(&self) -> Self {
        ClusterNode {
            config: Arc::clone(&self.config),
            transport: Arc::clone(&self.transport),
            membership: Arc::clone(&self.membership),
            clock: Arc::clone(&self.clock),
            election: Arc::clone(&self.election),
            txns: Arc::clone(&self.txns),
            storage: Arc::clone(&self.storage),
            cache: self.cache.as_ref().map(Arc::clone),
            notifier: self.notifier.as_ref().map(Arc::clone),
            fanout: Arc::clone(&self.fanout),
            start_time: self.start_time,
            active_connections: Arc::clone(&self.active_connections),
        }
    }
}

impl<T: Transport> ClusterNode<T> {
    pub fn new(config: Config, transport: Arc<T>, storage: Arc<dyn ApplyStore>) -> Self {
        let membership = Arc::new(Membership::new(config.server_id, &config.peers));
        let fanout = Arc::new(Semaphore::new(config.fanout_workers));
        ClusterNode {
            config: Arc::new(config),
            transport,
            membership,
            clock: Arc::new(LamportClock::new()),
            election: Arc::new(ElectionState::new()),
            txns: Arc::new(TransactionManager::new()),
            storage,
            cache: None,
            notifier: None,
            fanout,
            start_time: Instant::now(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn BidNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn server_id(&self) -> u32 {
        self.config.server_id
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn leader(&self) -> Option<u32> {
        self.election.leader()
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn election(&self) -> &ElectionState {
        &self.election
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            server_id: self.config.server_id,
            is_leader: self.election.is_leader(),
            logical_clock: self.clock.current(),
            healthy: true,
            uptime_ms: self.start_time.elapsed().as_millis() as u64,
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    /// Clock-sync handler shared by the collection and push halves of a
    /// Berkeley round. The reply always carries this node's pre-merge time
    /// (that is the sample the leader averages); the received time is folded
    /// in through the Lamport merge, so a pushed mean pulls this clock up to
    /// at least the mean without ever moving it backwards.
    fn handle_clock_sync(&self, local_time: u64, requesting_server_id: u32) -> Response {
        self.clock.record_peer(requesting_server_id, local_time);
        let reported = self.clock.current();
        self.clock.merge(local_time);
        debug!(
            requesting_server_id,
            received = local_time,
            reported,
            "clock sync exchange"
        );
        Response::ClockSync {
            adjusted_time: reported,
            success: true,
        }
    }
}

impl<T: Transport + 'static> ClusterNode<T> {
    /// Dispatches one inbound remote procedure. Election handlers that fan
    /// out further calls run detached so the response frame is never held
    /// up behind them.
    pub async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::ProcessBid(bid) => Response::Bid(self.process_bid(bid).await),
            Request::Prepare {
                transaction_id,
                operations,
            } => {
                self.clock.tick();
                Response::Ack(self.txns.prepare_local(&transaction_id, &operations))
            }
            Request::Commit { transaction_id } => {
                self.clock.tick();
                Response::Ack(self.txns.commit_local(&transaction_id, self.storage.as_ref()))
            }
            Request::Abort { transaction_id } => {
                self.clock.tick();
                Response::Ack(self.txns.abort_local(&transaction_id))
            }
            Request::SynchronizeClocks {
                local_time,
                requesting_server_id,
            } => self.handle_clock_sync(local_time, requesting_server_id),
            Request::Heartbeat { from_server_id } => {
                self.clock.tick();
                debug!(from_server_id, "heartbeat received");
                Response::Heartbeat(HeartbeatReply {
                    alive: true,
                    logical_clock: self.clock.current(),
                    is_leader: self.election.is_leader(),
                })
            }
            Request::StartBullyElection { initiator_id } => {
                info!(initiator_id, "bully election requested");
                let node = self.clone();
                tokio::spawn(async move {
                    node.start_bully_election().await;
                });
                Response::Ack(true)
            }
            Request::ElectionMessage {
                candidate_id,
                sender_id,
            } => {
                self.handle_election_message(candidate_id, sender_id);
                Response::Ack(true)
            }
            Request::CoordinatorMessage { new_leader_id } => {
                self.handle_coordinator_message(new_leader_id);
                Response::Ack(true)
            }
            Request::StartRingElection { initiator_id } => {
                info!(initiator_id, "ring election requested");
                let node = self.clone();
                tokio::spawn(async move {
                    node.start_ring_election().await;
                });
                Response::Ack(true)
            }
            Request::RingToken(token) => {
                self.handle_ring_token(token);
                Response::Ack(true)
            }
            Request::ReplicateData(record) => Response::Ack(self.apply_replication(&record)),
            Request::GetServerStatus => Response::Status(self.status()),
        }
    }

    /// Full bid path: merge the caller's timestamp, take the per-auction
    /// lock, run the bid insert through 2PC, then release the lock, relay
    /// the record and notify. A missing cache collaborator skips the lock
    /// and proceeds; the transaction is the actual safety mechanism.
    pub async fn process_bid(&self, bid: BidRequest) -> BidOutcome {
        self.clock.merge(bid.logical_ts);
        let stamp = self.clock.tick();
        info!(
            auction_id = %bid.auction_id,
            bidder_id = %bid.bidder_id,
            amount = bid.amount,
            origin = bid.origin_server_id,
            "processing bid"
        );

        let lock_key = format!("bid_lock:{}", bid.auction_id);
        let mut lock_held = false;
        if let Some(cache) = &self.cache {
            let holder = format!("server-{}", self.config.server_id);
            if !cache.set_if_absent_with_ttl(&lock_key, &holder, self.config.bid_lock_ttl()) {
                warn!(auction_id = %bid.auction_id, "bid lock contention");
                return BidOutcome {
                    success: false,
                    message: format!("auction {} is locked by another bid", bid.auction_id),
                    logical_ts: self.clock.current(),
                };
            }
            lock_held = true;
        } else {
            warn!(auction_id = %bid.auction_id, "no cache collaborator, proceeding without bid lock");
        }

        let transaction_id = format!("bid-{}", Uuid::new_v4());
        let mut payload = HashMap::new();
        payload.insert("auction_id".to_string(), bid.auction_id.clone());
        payload.insert("bidder_id".to_string(), bid.bidder_id.clone());
        payload.insert("amount".to_string(), bid.amount.to_string());
        payload.insert("logical_ts".to_string(), stamp.to_string());
        payload.insert(
            "origin_server_id".to_string(),
            bid.origin_server_id.to_string(),
        );
        let operation = Operation::new(
            OperationKind::Insert,
            "bids",
            format!("{}:{}", bid.auction_id, stamp),
            payload,
        );

        let committed = self
            .execute_transaction(&transaction_id, vec![operation.clone()])
            .await;

        if lock_held {
            if let Some(cache) = &self.cache {
                cache.remove(&lock_key);
            }
        }

        if committed {
            self.relay_after_commit(&[operation]);
            if let Some(notifier) = &self.notifier {
                notifier.bid_committed(&bid.auction_id, &bid.bidder_id, bid.amount, stamp);
            }
            BidOutcome {
                success: true,
                message: "bid accepted".to_string(),
                logical_ts: self.clock.current(),
            }
        } else {
            BidOutcome {
                success: false,
                message: "bid rejected: transaction aborted".to_string(),
                logical_ts: self.clock.current(),
            }
        }
    }

    /// Replicated write path for auction lifecycle changes (creation,
    /// updates, closing). The external API layer builds the operation; the
    /// node runs it through 2PC and relays the committed record.
    pub async fn process_auction_write(&self, operation: Operation) -> bool {
        self.clock.tick();
        let transaction_id = format!("auction-{}", Uuid::new_v4());
        let committed = self
            .execute_transaction(&transaction_id, vec![operation.clone()])
            .await;
        if committed {
            self.relay_after_commit(&[operation]);
        }
        committed
    }

    /// Boots the background duties: transaction recovery, initial peer
    /// dial-out, leader discovery, the heartbeat sweep, the leader-only
    /// clock-sync cycle and the stale-transaction sweep.
    pub async fn start(&self) {
        self.txns.recover();
        self.membership.connect(self.transport.as_ref()).await;
        info!(
            server_id = self.config.server_id,
            peers = self.membership.len(),
            "cluster node started"
        );

        let node = self.clone();
        tokio::spawn(async move {
            // jittered so simultaneously booted replicas do not all elect at once
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
            tokio::time::sleep(Duration::from_secs(2) + jitter).await;
            node.discover_leader().await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.heartbeat_loop().await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.clock_sync_loop().await;
        });

        let node = self.clone();
        tokio::spawn(async move {
            node.txn_expiry_loop().await;
        });
    }

    /// Probes the active peers for an existing leader before forcing an
    /// election, so a restarted node joins a settled cluster quietly.
    pub async fn discover_leader(&self) {
        for peer_id in self.membership.active_ids() {
            let outcome = tokio::time::timeout(
                self.config.call_timeout(),
                self.transport.call(
                    peer_id,
                    Request::Heartbeat {
                        from_server_id: self.config.server_id,
                    },
                ),
            )
            .await;
            if let Ok(Ok(Response::Heartbeat(reply))) = outcome {
                self.clock.record_peer(peer_id, reply.logical_clock);
                if reply.is_leader {
                    info!(leader_id = peer_id, "discovered existing leader");
                    self.election.set_leader(peer_id, self.config.server_id);
                    return;
                }
            }
        }
        info!("no leader discovered, starting election");
        self.start_bully_election().await;
    }

    async fn heartbeat_loop(self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep: u64 = 0;
        loop {
            interval.tick().await;
            sweep += 1;
            self.heartbeat_sweep().await;
            // every other sweep re-dials configured peers that dropped out
            if sweep % 2 == 0 {
                self.membership.connect(self.transport.as_ref()).await;
            }
        }
    }

    /// One round of the failure detector: ping every active peer, record
    /// round-trip latency, drop non-responders, and trigger an election if
    /// the dropped peer was the leader.
    pub async fn heartbeat_sweep(&self) {
        let mut leader_lost = false;
        for peer_id in self.membership.active_ids() {
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                self.config.call_timeout(),
                self.transport.call(
                    peer_id,
                    Request::Heartbeat {
                        from_server_id: self.config.server_id,
                    },
                ),
            )
            .await;
            match outcome {
                Ok(Ok(Response::Heartbeat(reply))) if reply.alive => {
                    self.membership.mark_heartbeat(peer_id, true);
                    self.membership.record_latency(peer_id, started.elapsed());
                    self.clock.record_peer(peer_id, reply.logical_clock);
                }
                _ => {
                    warn!(peer_id, "heartbeat failed, removing peer");
                    self.membership.remove(self.transport.as_ref(), peer_id).await;
                    if self.election.leader() == Some(peer_id) {
                        leader_lost = true;
                    }
                }
            }
        }
        if leader_lost {
            warn!("leader failed its heartbeat, starting election");
            self.election.clear_leader();
            self.start_bully_election().await;
        }
    }

    async fn clock_sync_loop(self) {
        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !self.election.is_leader() {
                continue;
            }
            berkeley::synchronize(
                self.config.server_id,
                &self.clock,
                &self.membership,
                self.transport.as_ref(),
                self.config.call_timeout(),
            )
            .await;
        }
    }

    async fn txn_expiry_loop(self) {
        let max_age = self.config.txn_expiry();
        let mut interval = tokio::time::interval(max_age);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let expired = self.txns.expire_stale(max_age);
            if !expired.is_empty() {
                info!(count = expired.len(), "expired stale transactions");
            }
        }
    }
}
