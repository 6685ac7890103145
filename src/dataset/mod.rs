//! Dataset sink for extracted records
//!
//! This module provides:
//! - `ExtractedRecord` / `FieldValue`, the output data model
//! - The `DatasetBackend` trait with JSON Lines and in-memory backends
//! - `DatasetSink`, which serializes appends from concurrent workers

mod jsonl;
mod memory;
mod record;
mod traits;

pub use jsonl::JsonLinesBackend;
pub use memory::MemoryBackend;
pub use record::{ExtractedRecord, FieldValue};
pub use traits::{Ack, DatasetBackend};

use crate::storage::StorageResult;
use tokio::sync::Mutex;

struct SinkInner {
    backend: Box<dyn DatasetBackend>,
    total_records: u64,
}

/// Append-only record store shared by every worker of a run
///
/// Appends are serialized behind an async mutex: batches from concurrent
/// workers never interleave, and a batch is acknowledged only after the
/// backend has made it durable.
pub struct DatasetSink {
    inner: Mutex<SinkInner>,
}

impl DatasetSink {
    pub fn new(backend: impl DatasetBackend + 'static) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn DatasetBackend>) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                backend,
                total_records: 0,
            }),
        }
    }

    /// Appends a batch of records
    ///
    /// # Returns
    ///
    /// * `Ok(Ack)` - The batch is durable
    /// * `Err(StorageError)` - Nothing from this batch may be assumed persisted
    pub async fn append(&self, records: &[ExtractedRecord]) -> StorageResult<Ack> {
        let mut inner = self.inner.lock().await;

        if !records.is_empty() {
            inner.backend.append_batch(records)?;
            inner.total_records += records.len() as u64;
            tracing::trace!(
                "Appended {} records to {}",
                records.len(),
                inner.backend.describe()
            );
        }

        Ok(Ack {
            batch_len: records.len(),
            total_records: inner.total_records,
        })
    }

    /// Records acknowledged by this sink so far
    pub async fn total_records(&self) -> u64 {
        self.inner.lock().await.total_records
    }

    pub async fn describe(&self) -> String {
        self.inner.lock().await.backend.describe()
    }
}
