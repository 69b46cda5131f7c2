use parking_lot::RwLock;
use std::collections::HashMap;

use crate::cluster::error::{ClusterError, ClusterResult};
use crate::cluster::message::Operation;

/// Write-apply seam to the persisted entity layer. The transaction
/// coordinator materializes committed operations through this trait and
/// never touches the storage collaborator's internals.
pub trait ApplyStore: Send + Sync {
    fn apply_insert(&self, operation: &Operation) -> ClusterResult<()>;
    fn apply_update(&self, operation: &Operation) -> ClusterResult<()>;
    fn apply_delete(&self, operation: &Operation) -> ClusterResult<()>;
}

type Record = HashMap<String, String>;
type Table = HashMap<String, Record>;

/// In-memory reference implementation: table name -> record id -> payload.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn get(&self, table: &str, record_id: &str) -> Option<Record> {
        self.tables.read().get(table)?.get(record_id).cloned()
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.len())
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

impl ApplyStore for MemoryStore {
    fn apply_insert(&self, operation: &Operation) -> ClusterResult<()> {
        self.tables
            .write()
            .entry(operation.table.clone())
            .or_default()
            .insert(operation.record_id.clone(), operation.payload.clone());
        Ok(())
    }

    fn apply_update(&self, operation: &Operation) -> ClusterResult<()> {
        let mut tables = self.tables.write();
        let record = tables
            .get_mut(&operation.table)
            .and_then(|t| t.get_mut(&operation.record_id))
            .ok_or_else(|| {
                ClusterError::Storage(format!(
                    "update target {}/{} not found",
                    operation.table, operation.record_id
                ))
            })?;
        for (key, value) in &operation.payload {
            record.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn apply_delete(&self, operation: &Operation) -> ClusterResult<()> {
        let mut tables = self.tables.write();
        if let Some(table) = tables.get_mut(&operation.table) {
            table.remove(&operation.record_id);
        }
        Ok(())
    }
}
