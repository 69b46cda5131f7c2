pub mod cache;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod storage;
