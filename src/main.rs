use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use auction_cluster::cache::MemoryCache;
use auction_cluster::cluster::node::ClusterNode;
use auction_cluster::cluster::server;
use auction_cluster::cluster::transport::TcpTransport;
use auction_cluster::config::Config;
use auction_cluster::storage::MemoryStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path)?,
        None => Config::new(),
    };
    info!(
        server_id = config.server_id,
        addr = %config.listen_addr(),
        peers = %config.peers,
        "booting auction cluster node"
    );

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let transport = Arc::new(TcpTransport::new(config.call_timeout()));
    let storage = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());

    let node = ClusterNode::new(config, transport, storage).with_cache(cache);
    node.start().await;
    server::serve(node, listener).await?;
    Ok(())
}
