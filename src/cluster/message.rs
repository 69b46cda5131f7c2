// src/cluster/message.rs
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

/// A single write against a collection, immutable once attached to a
/// transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OperationKind,
    pub table: String,
    pub record_id: String,
    pub payload: HashMap<String, String>,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        table: impl Into<String>,
        record_id: impl Into<String>,
        payload: HashMap<String, String>,
    ) -> Self {
        Operation {
            kind,
            table: table.into(),
            record_id: record_id.into(),
            payload,
        }
    }
}

/// Fire-and-forget change record pushed to peers after a local commit.
/// No acknowledgment tracking, no retry queue. The payload map stays the
/// last field so the record also serializes to table-last formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub operation_id: String,
    pub kind: OperationKind,
    pub table: String,
    pub record_id: String,
    pub logical_timestamp: u64,
    pub payload: HashMap<String, String>,
}

/// Token passed around the sorted ring during a ring election.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionToken {
    pub candidate_id: u32,
    pub participants: Vec<u32>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidRequest {
    pub auction_id: String,
    pub bidder_id: String,
    pub amount: f64,
    pub logical_ts: u64,
    pub origin_server_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidOutcome {
    pub success: bool,
    pub message: String,
    pub logical_ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatReply {
    pub alive: bool,
    pub logical_clock: u64,
    pub is_leader: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: u32,
    pub is_leader: bool,
    pub logical_clock: u64,
    pub healthy: bool,
    pub uptime_ms: u64,
    pub active_connections: usize,
}

/// Inter-replica remote procedures. One request frame yields exactly one
/// response frame on the same connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ProcessBid(BidRequest),
    Prepare {
        transaction_id: String,
        operations: Vec<Operation>,
    },
    Commit {
        transaction_id: String,
    },
    Abort {
        transaction_id: String,
    },
    SynchronizeClocks {
        local_time: u64,
        requesting_server_id: u32,
    },
    Heartbeat {
        from_server_id: u32,
    },
    StartBullyElection {
        initiator_id: u32,
    },
    ElectionMessage {
        candidate_id: u32,
        sender_id: u32,
    },
    CoordinatorMessage {
        new_leader_id: u32,
    },
    StartRingElection {
        initiator_id: u32,
    },
    RingToken(ElectionToken),
    ReplicateData(ReplicationRecord),
    GetServerStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Bid(BidOutcome),
    Ack(bool),
    ClockSync { adjusted_time: u64, success: bool },
    Heartbeat(HeartbeatReply),
    Status(ServerStatus),
    Ok,
}

impl Response {
    /// Collapses a response into the boolean vote the 2PC fan-out expects.
    pub fn as_ack(&self) -> bool {
        matches!(self, Response::Ack(true))
    }
}
