use crate::dataset::{DatasetBackend, ExtractedRecord};
use crate::storage::StorageResult;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// JSON Lines dataset: one JSON object per record, one record per line
///
/// Each batch is encoded in memory and written with a single `write_all`,
/// then flushed and synced, so a crash loses at most the batch being written.
pub struct JsonLinesBackend {
    path: PathBuf,
    file: File,
}

impl JsonLinesBackend {
    /// Opens the dataset for appending, creating it (and its directory) if needed
    ///
    /// With `truncate`, existing records are discarded first.
    pub fn open(path: &Path, truncate: bool) -> StorageResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        if truncate {
            file.set_len(0)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatasetBackend for JsonLinesBackend {
    fn append_batch(&mut self, records: &[ExtractedRecord]) -> StorageResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buffer = Vec::with_capacity(records.len() * 128);
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        self.file.write_all(&buffer)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}
