//! The durable store seam

use anyhow::Result;
use parking_lot::Mutex;

use crate::models::{NewRecord, StoredRecord};

/// Durable record store collaborator.
///
/// Methods are synchronous; async callers run them on the blocking pool.
pub trait RecordStore: Send + Sync {
    /// Persist a record and return it with its identifier.
    fn create(&self, record: &NewRecord) -> Result<StoredRecord>;

    /// Most recent record by timestamp, if any.
    fn find_latest(&self) -> Result<Option<StoredRecord>>;

    /// Number of stored records.
    fn count(&self) -> Result<u64>;
}

/// Process-local store. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<StoredRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything stored so far, in insertion order.
    pub fn records(&self) -> Vec<StoredRecord> {
        self.records.lock().clone()
    }
}

impl RecordStore for MemoryRecordStore {
    fn create(&self, record: &NewRecord) -> Result<StoredRecord> {
        let mut records = self.records.lock();
        let stored = StoredRecord::from_new(records.len() as i64 + 1, record);
        records.push(stored.clone());
        Ok(stored)
    }

    fn find_latest(&self) -> Result<Option<StoredRecord>> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)))
            .cloned())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.records.lock().len() as u64)
    }
}
