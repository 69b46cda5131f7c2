// src/cluster/mod.rs
pub mod election;
pub mod error;
pub mod membership;
pub mod message;
pub mod node;
pub mod replication;
pub mod server;
pub mod transport;
pub mod two_phase;
