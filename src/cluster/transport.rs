use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::{ClusterError, ClusterResult};
use super::message::{HeartbeatReply, Request, Response};

/// Remote-call seam between replicas. Every call is request/response with
/// the caller enforcing its own timeout; a timed-out call is treated
/// identically to a failed one.
pub trait Transport: Send + Sync {
    /// Send a request to the peer and wait for its response.
    fn call(
        &self,
        peer_id: u32,
        request: Request,
    ) -> impl std::future::Future<Output = ClusterResult<Response>> + Send;
    /// Establish a connection to a new peer.
    fn add_node(
        &self,
        peer_id: u32,
        addr: String,
    ) -> impl std::future::Future<Output = ClusterResult<()>> + Send;
    /// Drop the connection to a peer.
    fn remove_node(&self, peer_id: u32) -> impl std::future::Future<Output = ClusterResult<()>> + Send;
    fn is_connected(&self, peer_id: u32) -> bool;
}

pub(crate) async fn write_frame<S, M>(stream: &mut S, message: &M) -> ClusterResult<()>
where
    S: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload = bincode::serialize(message)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| ClusterError::Transport("frame exceeds u32 length".to_string()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<S, M>(stream: &mut S) -> ClusterResult<M>
where
    S: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(bincode::deserialize(&buffer)?)
}

/// TCP transport with one pooled connection per peer. Calls serialize on the
/// peer's stream; a failed call drops the connection so the reconnect sweep
/// can re-establish it.
pub struct TcpTransport {
    connections: Arc<RwLock<HashMap<u32, Arc<tokio::sync::Mutex<TcpStream>>>>>,
    call_timeout: Duration,
}

impl TcpTransport {
    pub fn new(call_timeout: Duration) -> Self {
        TcpTransport {
            connections: Arc::new(RwLock::new(HashMap::new())),
            call_timeout,
        }
    }

    async fn exchange(
        &self,
        peer_id: u32,
        stream: Arc<tokio::sync::Mutex<TcpStream>>,
        request: Request,
    ) -> ClusterResult<Response> {
        let mut stream = stream.lock().await;
        write_frame(&mut *stream, &request).await?;
        read_frame(&mut *stream)
            .await
            .map_err(|_| ClusterError::Unreachable(peer_id))
    }
}

impl Transport for TcpTransport {
    async fn call(&self, peer_id: u32, request: Request) -> ClusterResult<Response> {
        let stream = {
            self.connections
                .read()
                .get(&peer_id)
                .map(Arc::clone)
                .ok_or(ClusterError::NotConnected(peer_id))?
        };

        let result = tokio::time::timeout(
            self.call_timeout,
            self.exchange(peer_id, stream, request),
        )
        .await
        .unwrap_or(Err(ClusterError::CallTimeout(peer_id)));

        if let Err(ref e) = result {
            if e.is_transient() {
                self.connections.write().remove(&peer_id);
            }
        }
        result
    }

    async fn add_node(&self, peer_id: u32, addr: String) -> ClusterResult<()> {
        if self.is_connected(peer_id) {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.call_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClusterError::CallTimeout(peer_id))?
            .map_err(|e| ClusterError::Transport(format!("connect to {addr} failed: {e}")))?;
        self.connections
            .write()
            .insert(peer_id, Arc::new(tokio::sync::Mutex::new(stream)));
        Ok(())
    }

    async fn remove_node(&self, peer_id: u32) -> ClusterResult<()> {
        self.connections.write().remove(&peer_id);
        Ok(())
    }

    fn is_connected(&self, peer_id: u32) -> bool {
        self.connections.read().contains_key(&peer_id)
    }
}

/// Scripted transport for tests: records every outbound call and answers
/// with configurable per-peer results, so multi-node protocol scenarios run
/// without sockets.
#[derive(Default)]
pub struct MockTransport {
    calls: Mutex<Vec<(u32, Request)>>,
    connected: Mutex<HashSet<u32>>,
    /// Peers that fail both connection attempts and calls.
    unreachable: Mutex<HashSet<u32>>,
    prepare_votes: Mutex<HashMap<u32, bool>>,
    commit_results: Mutex<HashMap<u32, bool>>,
    leader_claims: Mutex<HashMap<u32, bool>>,
    peer_clocks: Mutex<HashMap<u32, u64>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport::default()
    }

    pub fn set_unreachable(&self, peer_id: u32) {
        self.unreachable.lock().insert(peer_id);
    }

    pub fn set_reachable(&self, peer_id: u32) {
        self.unreachable.lock().remove(&peer_id);
    }

    pub fn refuse_prepare(&self, peer_id: u32) {
        self.prepare_votes.lock().insert(peer_id, false);
    }

    pub fn fail_commit(&self, peer_id: u32) {
        self.commit_results.lock().insert(peer_id, false);
    }

    pub fn claim_leader(&self, peer_id: u32) {
        self.leader_claims.lock().insert(peer_id, true);
    }

    pub fn set_peer_clock(&self, peer_id: u32, time: u64) {
        self.peer_clocks.lock().insert(peer_id, time);
    }

    pub fn calls(&self) -> Vec<(u32, Request)> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, peer_id: u32) -> Vec<Request> {
        self.calls
            .lock()
            .iter()
            .filter(|(id, _)| *id == peer_id)
            .map(|(_, req)| req.clone())
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }
}

impl Transport for MockTransport {
    async fn call(&self, peer_id: u32, request: Request) -> ClusterResult<Response> {
        if self.unreachable.lock().contains(&peer_id) {
            return Err(ClusterError::Unreachable(peer_id));
        }
        self.calls.lock().push((peer_id, request.clone()));

        let response = match request {
            Request::Prepare { .. } => Response::Ack(
                self.prepare_votes.lock().get(&peer_id).copied().unwrap_or(true),
            ),
            Request::Commit { .. } => Response::Ack(
                self.commit_results.lock().get(&peer_id).copied().unwrap_or(true),
            ),
            Request::Abort { .. } => Response::Ack(true),
            Request::ReplicateData(_) => Response::Ack(true),
            Request::Heartbeat { .. } => Response::Heartbeat(HeartbeatReply {
                alive: true,
                logical_clock: self.peer_clocks.lock().get(&peer_id).copied().unwrap_or(0),
                is_leader: self.leader_claims.lock().get(&peer_id).copied().unwrap_or(false),
            }),
            Request::SynchronizeClocks { local_time, .. } => Response::ClockSync {
                adjusted_time: self
                    .peer_clocks
                    .lock()
                    .get(&peer_id)
                    .copied()
                    .unwrap_or(local_time),
                success: true,
            },
            _ => Response::Ok,
        };
        Ok(response)
    }

    async fn add_node(&self, peer_id: u32, _addr: String) -> ClusterResult<()> {
        if self.unreachable.lock().contains(&peer_id) {
            return Err(ClusterError::Unreachable(peer_id));
        }
        self.connected.lock().insert(peer_id);
        Ok(())
    }

    async fn remove_node(&self, peer_id: u32) -> ClusterResult<()> {
        self.connected.lock().remove(&peer_id);
        Ok(())
    }

    fn is_connected(&self, peer_id: u32) -> bool {
        self.connected.lock().contains(&peer_id)
    }
}
