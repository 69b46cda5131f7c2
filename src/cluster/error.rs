// src/cluster/error.rs
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Peer {0} is unreachable")]
    Unreachable(u32),

    #[error("Call to peer {0} timed out")]
    CallTimeout(u32),

    #[error("No connection to peer {0}")]
    NotConnected(u32),

    #[error("Unexpected response from peer {0}")]
    UnexpectedResponse(u32),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

impl ClusterError {
    /// Transient peer failures are pruned and retried by the reconnect sweep,
    /// never raised to a request handler as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Unreachable(_)
                | ClusterError::CallTimeout(_)
                | ClusterError::NotConnected(_)
                | ClusterError::Io(_)
        )
    }
}
