mod memory;

pub use memory::{ApplyStore, MemoryStore};
