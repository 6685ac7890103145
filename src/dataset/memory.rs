use crate::dataset::{DatasetBackend, ExtractedRecord};
use crate::storage::StorageResult;
use std::sync::{Arc, Mutex, PoisonError};

/// In-memory dataset; clones share the same record list
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    records: Arc<Mutex<Vec<ExtractedRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record appended so far
    pub fn records(&self) -> Vec<ExtractedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DatasetBackend for MemoryBackend {
    fn append_batch(&mut self, records: &[ExtractedRecord]) -> StorageResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
