use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-node Lamport counter. Peer snapshots are advisory copies used by the
/// Berkeley round and the status surface, never authoritative.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
    peer_snapshots: Mutex<HashMap<u32, u64>>,
}

impl LamportClock {
    pub fn new() -> Self {
        LamportClock::default()
    }

    /// Increments the local counter and returns the new value. Called before
    /// any locally-originated event is stamped.
    pub fn tick(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sets the counter to `max(local, received) + 1`.
    pub fn merge(&self, received: u64) -> u64 {
        loop {
            let current = self.counter.load(Ordering::SeqCst);
            let next = current.max(received) + 1;
            if self
                .counter
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Overwrites the counter with a Berkeley-synchronized value. Unlike
    /// `merge` this may move the counter backwards.
    pub fn adjust(&self, value: u64) {
        self.counter.store(value, Ordering::SeqCst);
    }

    pub fn record_peer(&self, peer_id: u32, time: u64) {
        self.peer_snapshots.lock().insert(peer_id, time);
    }

    pub fn peer_snapshots(&self) -> HashMap<u32, u64> {
        self.peer_snapshots.lock().clone()
    }
}
