use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::error::ClusterResult;
use super::message::Request;
use super::node::ClusterNode;
use super::transport::{read_frame, write_frame, Transport};

/// Accept loop for inbound peer connections. Each connection gets its own
/// task and is served request-by-request until the peer hangs up; a read
/// error is an ordinary disconnect, not a server failure.
pub async fn serve<T: Transport + 'static>(
    node: ClusterNode<T>,
    listener: TcpListener,
) -> ClusterResult<()> {
    info!(addr = %listener.local_addr()?, "listening for peer connections");
    loop {
        let (mut stream, peer_addr) = listener.accept().await?;
        debug!(%peer_addr, "peer connection accepted");
        let node = node.clone();
        tokio::spawn(async move {
            node.active_connections.fetch_add(1, Ordering::Relaxed);
            loop {
                let request: Request = match read_frame(&mut stream).await {
                    Ok(request) => request,
                    Err(e) => {
                        debug!(%peer_addr, error = %e, "peer connection closed");
                        break;
                    }
                };
                let response = node.handle_request(request).await;
                if let Err(e) = write_frame(&mut stream, &response).await {
                    error!(%peer_addr, error = %e, "failed to write response frame");
                    break;
                }
            }
            node.active_connections.fetch_sub(1, Ordering::Relaxed);
        });
    }
}
