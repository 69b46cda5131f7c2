use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::message::{ElectionToken, Request};
use super::node::ClusterNode;
use super::transport::Transport;

/// Per-node election bookkeeping. A single election runs at a time; the
/// `in_progress` flag is the re-entrancy guard for both algorithms, and the
/// participant set tracks the ids known to be involved in the running one.
pub struct ElectionState {
    in_progress: AtomicBool,
    participants: Mutex<HashSet<u32>>,
    /// Current leader id, or -1 while unknown.
    leader_id: AtomicI64,
    is_leader: AtomicBool,
}

impl ElectionState {
    pub fn new() -> Self {
        ElectionState {
            in_progress: AtomicBool::new(false),
            participants: Mutex::new(HashSet::new()),
            leader_id: AtomicI64::new(-1),
            is_leader: AtomicBool::new(false),
        }
    }

    /// Claims the election slot. Returns false when an election is already
    /// running, in which case the caller must back off.
    pub fn begin(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Closes the running election and resets its transient participant set.
    pub fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
        self.participants.lock().clear();
    }

    pub fn add_participant(&self, id: u32) {
        self.participants.lock().insert(id);
    }

    pub fn participants(&self) -> HashSet<u32> {
        self.participants.lock().clone()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn set_leader(&self, leader_id: u32, self_id: u32) {
        self.leader_id.store(i64::from(leader_id), Ordering::Release);
        self.is_leader.store(leader_id == self_id, Ordering::Release);
    }

    pub fn clear_leader(&self) {
        self.leader_id.store(-1, Ordering::Release);
        self.is_leader.store(false, Ordering::Release);
    }

    pub fn leader(&self) -> Option<u32> {
        let id = self.leader_id.load(Ordering::Acquire);
        u32::try_from(id).ok()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }
}

impl Default for ElectionState {
    fn default() -> Self {
        ElectionState::new()
    }
}

impl<T: Transport + 'static> ClusterNode<T> {
    /// Bully election: challenge every active peer with a higher id. A node
    /// with no higher peer at all wins immediately; otherwise it waits one
    /// election window for a coordinator announcement and self-promotes if
    /// none arrives, whether the challenges were answered or not.
    ///
    /// The challenge reply is the peer's ordinary liveness ack, so a slow
    /// higher peer that answers but never announces is overridden by the
    /// timeout below and may be out-bullied by a lower id. Leadership here
    /// gates only periodic duties, so the override is harmless.
    pub async fn start_bully_election(&self) {
        if !self.election.begin() {
            debug!("election already in progress, skipping");
            return;
        }
        let self_id = self.config.server_id;
        self.election.clear_leader();
        self.election.add_participant(self_id);
        self.clock.tick();
        info!(self_id, "starting bully election");

        let higher: Vec<u32> = self
            .membership
            .active_ids()
            .into_iter()
            .filter(|&id| id > self_id)
            .collect();
        if higher.is_empty() {
            self.become_leader().await;
            return;
        }

        for peer_id in higher {
            let outcome = tokio::time::timeout(
                self.config.call_timeout(),
                self.transport.call(
                    peer_id,
                    Request::ElectionMessage {
                        candidate_id: self_id,
                        sender_id: self_id,
                    },
                ),
            )
            .await;
            match outcome {
                Ok(Ok(_)) => {
                    debug!(peer_id, "higher peer answered the challenge");
                    self.election.add_participant(peer_id);
                }
                _ => debug!(peer_id, "higher peer did not answer"),
            }
        }

        // Give any stronger candidate one full election window to announce,
        // then self-promote. An unanswered challenge gets the same window:
        // the higher peer may be alive and merely slow to be reached.
        let node = self.clone();
        let window = self.config.election_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if node.election.in_progress() && node.election.leader().is_none() {
                warn!("no coordinator announcement, self-promoting");
                node.become_leader().await;
            }
        });
    }

    /// Handles a bully challenge from `candidate_id`. A node challenged by a
    /// lower id heartbeats the sender back - the liveness call doubles as
    /// the "I am alive, stand down" acknowledgment - and starts its own
    /// election.
    pub fn handle_election_message(&self, candidate_id: u32, sender_id: u32) {
        self.clock.tick();
        self.election.add_participant(candidate_id);
        let self_id = self.config.server_id;
        debug!(candidate_id, sender_id, "received election challenge");
        if candidate_id < self_id {
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node
                    .transport
                    .call(
                        sender_id,
                        Request::Heartbeat {
                            from_server_id: node.config.server_id,
                        },
                    )
                    .await
                {
                    debug!(sender_id, error = %e, "stand-down heartbeat not delivered");
                }
                node.start_bully_election().await;
            });
        }
    }

    /// Adopts the announced leader and closes any running election.
    pub fn handle_coordinator_message(&self, new_leader_id: u32) {
        let self_id = self.config.server_id;
        self.election.set_leader(new_leader_id, self_id);
        self.election.finish();
        info!(new_leader_id, "accepted coordinator announcement");
    }

    /// Ring election: start a token at this node and send it around the
    /// id-sorted ring.
    pub async fn start_ring_election(&self) {
        if !self.election.begin() {
            debug!("election already in progress, skipping");
            return;
        }
        let self_id = self.config.server_id;
        self.election.clear_leader();
        self.clock.tick();
        info!(self_id, "starting ring election");

        let token = ElectionToken {
            candidate_id: self_id,
            participants: vec![self_id],
            active: true,
        };
        self.pass_ring_token(token).await;
    }

    /// Receives a circulating ring token. A token that already carries this
    /// node's id has gone full circle: the largest collected id wins and the
    /// resolver announces it. Otherwise the node joins the token and passes
    /// it on.
    pub fn handle_ring_token(&self, mut token: ElectionToken) {
        self.clock.tick();
        if !token.active {
            return;
        }
        let self_id = self.config.server_id;
        if token.participants.contains(&self_id) {
            let winner = token.participants.iter().copied().max().unwrap_or(self_id);
            token.active = false;
            info!(winner, participants = ?token.participants, "ring election resolved");
            let node = self.clone();
            tokio::spawn(async move {
                node.announce_leader(winner).await;
            });
            return;
        }

        token.participants.push(self_id);
        let node = self.clone();
        tokio::spawn(async move {
            node.pass_ring_token(token).await;
        });
    }

    /// Passes the token to the next reachable node in id order, wrapping at
    /// the top. Failed hops are skipped within a single pass over the ring
    /// snapshot; if no successor is reachable this node is alone and wins.
    pub(crate) async fn pass_ring_token(&self, token: ElectionToken) {
        let self_id = self.config.server_id;
        let mut ring = self.membership.active_ids();
        ring.push(self_id);
        ring.sort_unstable();
        ring.dedup();

        let start = ring.iter().position(|&id| id == self_id).unwrap_or(0);
        for offset in 1..ring.len() {
            let next = ring[(start + offset) % ring.len()];
            if next == self_id {
                continue;
            }
            let outcome = tokio::time::timeout(
                self.config.call_timeout(),
                self.transport.call(next, Request::RingToken(token.clone())),
            )
            .await;
            match outcome {
                Ok(Ok(_)) => {
                    debug!(next, "ring token passed");
                    return;
                }
                _ => warn!(next, "ring hop unreachable, trying the next node"),
            }
        }

        info!("no reachable ring successor, assuming leadership");
        self.become_leader().await;
    }

    /// Installs this node as leader and broadcasts the coordinator
    /// announcement to every active peer.
    pub(crate) async fn become_leader(&self) {
        let self_id = self.config.server_id;
        self.election.set_leader(self_id, self_id);
        self.election.finish();
        info!(self_id, "assuming cluster leadership");
        self.broadcast_coordinator(self_id);
    }

    /// Installs `winner` as leader locally and broadcasts the announcement.
    /// Used by the ring resolver, which is not necessarily the winner.
    pub(crate) async fn announce_leader(&self, winner: u32) {
        if winner == self.config.server_id {
            self.become_leader().await;
            return;
        }
        self.election.set_leader(winner, self.config.server_id);
        self.election.finish();
        self.broadcast_coordinator(winner);
    }

    fn broadcast_coordinator(&self, new_leader_id: u32) {
        for peer_id in self.membership.active_ids() {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(e) = transport
                    .call(peer_id, Request::CoordinatorMessage { new_leader_id })
                    .await
                {
                    debug!(peer_id, error = %e, "coordinator announcement not delivered");
                }
            });
        }
    }
}
