// src/clock/mod.rs
pub mod berkeley;
pub mod lamport;
