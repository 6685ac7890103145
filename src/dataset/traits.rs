//! Dataset backend trait
//!
//! A backend persists batches of records. The sink serializes calls, so a
//! backend only has to make each batch durable before returning.

use crate::dataset::ExtractedRecord;
use crate::storage::StorageResult;

/// Acknowledgement returned once a batch is durable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Records in the acknowledged batch
    pub batch_len: usize,

    /// Records acknowledged by this sink so far, including this batch
    pub total_records: u64,
}

/// Durable, append-only storage for extracted records
pub trait DatasetBackend: Send {
    /// Persists a batch; on `Ok` every record of the batch is durable
    fn append_batch(&mut self, records: &[ExtractedRecord]) -> StorageResult<()>;

    /// Short description used in logs
    fn describe(&self) -> String;
}
