//! Persistence of completed snapshots.
//!
//! Each process appends one JSON line per completed snapshot to
//! `<dir>/process_<id>.jsonl`. The file is append-only; records are never
//! rewritten.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::{DmxError, DmxResult};
use super::snapshot::SnapshotRecord;

/// Destination for completed snapshot records.
pub trait SnapshotSink: Send {
    /// Persist one completed record.
    fn persist(&mut self, record: &SnapshotRecord) -> DmxResult<()>;
}

/// File name holding the records of one process.
pub fn snapshot_file_name(process_id: u32) -> String {
    format!("process_{}.jsonl", process_id)
}

/// Appends completed records to a per-process JSON-lines file.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    process_id: u32,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, process_id: u32) -> Self {
        FileSnapshotStore {
            dir: dir.into(),
            process_id,
        }
    }

    /// Path of this process's snapshot file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(snapshot_file_name(self.process_id))
    }

    /// Read back every record in a snapshot file, in append order.
    pub fn load(path: &Path) -> DmxResult<Vec<SnapshotRecord>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl SnapshotSink for FileSnapshotStore {
    fn persist(&mut self, record: &SnapshotRecord) -> DmxResult<()> {
        let line = serde_json::to_string(record)?;
        let persist_err = |source| DmxError::Persist {
            snapshot_id: record.snapshot_id,
            source,
        };

        fs::create_dir_all(&self.dir).map_err(persist_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())
            .map_err(persist_err)?;
        writeln!(file, "{}", line).map_err(persist_err)?;
        file.sync_data().map_err(persist_err)
    }
}

/// Keeps completed records in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    records: Arc<Mutex<Vec<SnapshotRecord>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything persisted so far.
    pub fn records(&self) -> Vec<SnapshotRecord> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.clone()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotSink for MemorySnapshotStore {
    fn persist(&mut self, record: &SnapshotRecord) -> DmxResult<()> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        records.push(record.clone());
        Ok(())
    }
}

/// Drops every record. For nodes that do not persist snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSnapshotSink;

impl SnapshotSink for NullSnapshotSink {
    fn persist(&mut self, _record: &SnapshotRecord) -> DmxResult<()> {
        Ok(())
    }
}
