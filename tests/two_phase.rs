use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auction_cluster::cache::{CacheStore, MemoryCache};
use auction_cluster::cluster::message::{
    BidRequest, Operation, OperationKind, Request, Response,
};
use auction_cluster::cluster::node::ClusterNode;
use auction_cluster::cluster::transport::MockTransport;
use auction_cluster::config::Config;
use auction_cluster::storage::{ApplyStore, MemoryStore};

fn test_config(server_id: u32, peers: &str) -> Config {
    Config {
        server_id,
        peers: peers.to_string(),
        call_timeout_ms: 200,
        prepare_timeout_ms: 200,
        ..Config::default()
    }
}

struct Fixture {
    node: ClusterNode<MockTransport>,
    transport: Arc<MockTransport>,
    storage: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
}

async fn fixture(server_id: u32, peers: &str) -> Fixture {
    let transport = Arc::new(MockTransport::new());
    let storage = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let node = ClusterNode::new(
        test_config(server_id, peers),
        Arc::clone(&transport),
        Arc::clone(&storage) as Arc<dyn ApplyStore>,
    )
    .with_cache(Arc::clone(&cache) as Arc<dyn CacheStore>);
    node.membership().connect(transport.as_ref()).await;
    Fixture {
        node,
        transport,
        storage,
        cache,
    }
}

fn bid_insert(record_id: &str) -> Operation {
    let mut payload = HashMap::new();
    payload.insert("auction_id".to_string(), "a1".to_string());
    payload.insert("amount".to_string(), "150.0".to_string());
    Operation::new(OperationKind::Insert, "bids", record_id, payload)
}

#[tokio::test]
async fn test_unanimous_prepare_commits_everywhere() {
    let f = fixture(1, "auction-server-2:1102,auction-server-3:1103").await;

    let committed = f
        .node
        .execute_transaction("txn-1", vec![bid_insert("b1")])
        .await;
    assert!(committed);
    assert!(f.storage.get("bids", "b1").is_some());

    for peer_id in [2, 3] {
        let calls = f.transport.calls_to(peer_id);
        assert!(calls.iter().any(|r| matches!(r, Request::Prepare { .. })));
        assert!(calls.iter().any(|r| matches!(r, Request::Commit { .. })));
    }
}

#[tokio::test]
async fn test_refused_prepare_aborts_everywhere() {
    let f = fixture(1, "auction-server-2:1102,auction-server-3:1103").await;
    f.transport.refuse_prepare(2);

    let committed = f
        .node
        .execute_transaction("txn-1", vec![bid_insert("b1")])
        .await;
    assert!(!committed);
    assert!(f.storage.get("bids", "b1").is_none());
    assert!(!f.node.transactions().contains("txn-1"));

    // fire-and-forget aborts reach both participants, commit reaches none
    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer_id in [2, 3] {
        let calls = f.transport.calls_to(peer_id);
        assert!(calls.iter().any(|r| matches!(r, Request::Abort { .. })));
        assert!(!calls.iter().any(|r| matches!(r, Request::Commit { .. })));
    }
}

#[tokio::test]
async fn test_unreachable_participant_aborts() {
    let f = fixture(1, "auction-server-2:1102,auction-server-3:1103").await;
    f.transport.set_unreachable(3);

    let committed = f
        .node
        .execute_transaction("txn-1", vec![bid_insert("b1")])
        .await;
    assert!(!committed);
    assert!(f.storage.get("bids", "b1").is_none());
}

#[tokio::test]
async fn test_peer_commit_failure_is_not_rolled_back() {
    let f = fixture(1, "auction-server-2:1102,auction-server-3:1103").await;
    f.transport.fail_commit(2);

    let committed = f
        .node
        .execute_transaction("txn-1", vec![bid_insert("b1")])
        .await;
    // degraded outcome, but the local commit and peer 3's commit stand
    assert!(!committed);
    assert!(f.storage.get("bids", "b1").is_some());
    assert!(f
        .transport
        .calls_to(3)
        .iter()
        .any(|r| matches!(r, Request::Commit { .. })));
}

#[tokio::test]
async fn test_participant_side_prepare_commit() {
    let f = fixture(2, "").await;

    let response = f
        .node
        .handle_request(Request::Prepare {
            transaction_id: "txn-9".to_string(),
            operations: vec![bid_insert("b9")],
        })
        .await;
    assert!(matches!(response, Response::Ack(true)));
    assert!(f.node.transactions().contains("txn-9"));

    let response = f
        .node
        .handle_request(Request::Commit {
            transaction_id: "txn-9".to_string(),
        })
        .await;
    assert!(matches!(response, Response::Ack(true)));
    assert!(f.storage.get("bids", "b9").is_some());
    assert!(!f.node.transactions().contains("txn-9"));
}

#[tokio::test]
async fn test_participant_abort_discards_staged_operations() {
    let f = fixture(2, "").await;
    f.node
        .handle_request(Request::Prepare {
            transaction_id: "txn-9".to_string(),
            operations: vec![bid_insert("b9")],
        })
        .await;

    let response = f
        .node
        .handle_request(Request::Abort {
            transaction_id: "txn-9".to_string(),
        })
        .await;
    assert!(matches!(response, Response::Ack(true)));
    assert!(f.storage.get("bids", "b9").is_none());
    assert!(!f.node.transactions().contains("txn-9"));
}

#[tokio::test]
async fn test_auction_lifecycle_write_replicates() {
    let f = fixture(1, "auction-server-2:1102").await;

    let mut payload = HashMap::new();
    payload.insert("title".to_string(), "vintage lamp".to_string());
    payload.insert("status".to_string(), "OPEN".to_string());
    let create = Operation::new(OperationKind::Insert, "auctions", "a1", payload);
    assert!(f.node.process_auction_write(create).await);

    let mut payload = HashMap::new();
    payload.insert("status".to_string(), "CLOSED".to_string());
    let close = Operation::new(OperationKind::Update, "auctions", "a1", payload);
    assert!(f.node.process_auction_write(close).await);

    let record = f.storage.get("auctions", "a1").unwrap();
    assert_eq!(record.get("status").unwrap(), "CLOSED");
    assert_eq!(record.get("title").unwrap(), "vintage lamp");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f
        .transport
        .calls_to(2)
        .iter()
        .any(|r| matches!(r, Request::ReplicateData(_))));
}

#[tokio::test]
async fn test_auction_update_of_unknown_record_does_not_commit() {
    let f = fixture(1, "").await;

    let mut payload = HashMap::new();
    payload.insert("status".to_string(), "CLOSED".to_string());
    let close = Operation::new(OperationKind::Update, "auctions", "ghost", payload);
    assert!(!f.node.process_auction_write(close).await);
    assert!(f.storage.get("auctions", "ghost").is_none());
}

#[tokio::test]
async fn test_bid_commits_and_releases_lock() {
    let f = fixture(1, "auction-server-2:1102").await;

    let outcome = f
        .node
        .process_bid(BidRequest {
            auction_id: "a1".to_string(),
            bidder_id: "alice".to_string(),
            amount: 150.0,
            logical_ts: 7,
            origin_server_id: 1,
        })
        .await;
    assert!(outcome.success);
    assert!(outcome.logical_ts > 7);
    assert_eq!(f.storage.len("bids"), 1);
    assert!(f.cache.get("bid_lock:a1").is_none());

    // the committed record is relayed to the peer after the fact
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f
        .transport
        .calls_to(2)
        .iter()
        .any(|r| matches!(r, Request::ReplicateData(_))));
}

#[tokio::test]
async fn test_bid_lock_contention_rejects_without_transaction() {
    let f = fixture(1, "auction-server-2:1102").await;
    assert!(f
        .cache
        .set_if_absent_with_ttl("bid_lock:a1", "server-2", Duration::from_secs(30)));

    let outcome = f
        .node
        .process_bid(BidRequest {
            auction_id: "a1".to_string(),
            bidder_id: "alice".to_string(),
            amount: 150.0,
            logical_ts: 0,
            origin_server_id: 1,
        })
        .await;
    assert!(!outcome.success);
    assert!(f.storage.is_empty("bids"));
    assert!(!f
        .transport
        .calls_to(2)
        .iter()
        .any(|r| matches!(r, Request::Prepare { .. })));
    // the foreign holder's lock is untouched
    assert_eq!(f.cache.get("bid_lock:a1").unwrap(), "server-2");
}

#[tokio::test]
async fn test_bid_without_cache_collaborator_still_commits() {
    let transport = Arc::new(MockTransport::new());
    let storage = Arc::new(MemoryStore::new());
    let node = ClusterNode::new(
        test_config(1, "auction-server-2:1102"),
        Arc::clone(&transport),
        Arc::clone(&storage) as Arc<dyn ApplyStore>,
    );
    node.membership().connect(transport.as_ref()).await;

    let outcome = node
        .process_bid(BidRequest {
            auction_id: "a1".to_string(),
            bidder_id: "alice".to_string(),
            amount: 150.0,
            logical_ts: 0,
            origin_server_id: 1,
        })
        .await;
    assert!(outcome.success);
    assert_eq!(storage.len("bids"), 1);
}

#[tokio::test]
async fn test_rejected_bid_releases_lock() {
    let f = fixture(1, "auction-server-2:1102").await;
    f.transport.refuse_prepare(2);

    let outcome = f
        .node
        .process_bid(BidRequest {
            auction_id: "a1".to_string(),
            bidder_id: "alice".to_string(),
            amount: 150.0,
            logical_ts: 0,
            origin_server_id: 1,
        })
        .await;
    assert!(!outcome.success);
    assert!(f.storage.is_empty("bids"));
    assert!(f.cache.get("bid_lock:a1").is_none());
}
