//! Durable ledger of units pending cleanup
//!
//! The ledger is the crash-recovery anchor of the protocol: an entry exists
//! from the moment a unit joins until its clearance is accepted as final, and
//! it survives clearance failures that request retry. Two implementations are
//! provided: a JSONL file ledger with tombstone records and compaction, and
//! an in-memory ledger for embedded and test use.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LogError;
use crate::state::{PendingUnit, UnitKey};

/// One record in the append-only ledger file
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LedgerRecord {
    Trace(PendingUnit),
    Clear { group_id: String, unit_id: String },
}

/// Durable, idempotent ledger of pending units
pub trait PendingLog: Send + Sync {
    /// Record that a unit awaits cleanup; idempotent per `(group, unit)`
    fn trace(&self, unit: &PendingUnit) -> Result<(), LogError>;

    /// Remove the record for a unit; unknown units are a no-op
    fn clear(&self, group_id: &str, unit_id: &str) -> Result<(), LogError>;

    /// All units currently awaiting cleanup
    fn pending(&self) -> Result<Vec<PendingUnit>, LogError>;
}

/// In-memory ledger for embedded and test use
#[derive(Debug, Default)]
pub struct MemoryPendingLog {
    units: RwLock<HashMap<UnitKey, PendingUnit>>,
}

impl MemoryPendingLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }

    pub fn contains(&self, group_id: &str, unit_id: &str) -> bool {
        self.units
            .read()
            .contains_key(&UnitKey::new(group_id, unit_id))
    }
}

impl PendingLog for MemoryPendingLog {
    fn trace(&self, unit: &PendingUnit) -> Result<(), LogError> {
        self.units
            .write()
            .entry(unit.key())
            .or_insert_with(|| unit.clone());
        Ok(())
    }

    fn clear(&self, group_id: &str, unit_id: &str) -> Result<(), LogError> {
        self.units
            .write()
            .remove(&UnitKey::new(group_id, unit_id));
        Ok(())
    }

    fn pending(&self) -> Result<Vec<PendingUnit>, LogError> {
        Ok(self.units.read().values().cloned().collect())
    }
}

/// File-backed ledger: one JSONL file, append-only with tombstones
///
/// Traces append a `Trace` record and clears append a `Clear` tombstone;
/// every append is followed by `sync_data`. On open the file is replayed
/// (corrupt lines are skipped with a warning) and compacted into a fresh
/// snapshot written to a temp file and renamed into place.
pub struct FilePendingLog {
    path: PathBuf,
    live: DashMap<UnitKey, PendingUnit>,
    io_lock: Mutex<()>,
}

impl FilePendingLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let live = DashMap::new();
        let mut records = 0usize;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                records += 1;
                match serde_json::from_str::<LedgerRecord>(&line) {
                    Ok(LedgerRecord::Trace(unit)) => {
                        live.insert(unit.key(), unit);
                    }
                    Ok(LedgerRecord::Clear { group_id, unit_id }) => {
                        live.remove(&UnitKey::new(group_id, unit_id));
                    }
                    Err(err) => {
                        warn!(
                            line = line_no + 1,
                            error = %err,
                            "Skipping corrupt ledger line"
                        );
                    }
                }
            }
        }

        let log = Self {
            path,
            live,
            io_lock: Mutex::new(()),
        };
        // Drop tombstones and superseded records from previous runs.
        if records > log.live.len() {
            log.compact()?;
        }
        info!(
            path = %log.path.display(),
            pending = log.live.len(),
            "Pending ledger opened"
        );
        Ok(log)
    }

    fn append(&self, record: &LedgerRecord) -> Result<(), LogError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.io_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;
        file.sync_data()?;
        Ok(())
    }

    /// Rewrite the file to contain only live entries
    pub fn compact(&self) -> Result<(), LogError> {
        let _guard = self.io_lock.lock();
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in self.live.iter() {
                let line = serde_json::to_string(&LedgerRecord::Trace(entry.value().clone()))?;
                writeln!(tmp, "{}", line)?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(
            path = %self.path.display(),
            entries = self.live.len(),
            "Pending ledger compacted"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl PendingLog for FilePendingLog {
    fn trace(&self, unit: &PendingUnit) -> Result<(), LogError> {
        let key = unit.key();
        // Keep the oldest trace so age-based sweeping is not reset by retries.
        if self.live.contains_key(&key) {
            return Ok(());
        }
        self.append(&LedgerRecord::Trace(unit.clone()))?;
        self.live.insert(key, unit.clone());
        Ok(())
    }

    fn clear(&self, group_id: &str, unit_id: &str) -> Result<(), LogError> {
        let key = UnitKey::new(group_id, unit_id);
        if self.live.remove(&key).is_none() {
            return Ok(());
        }
        self.append(&LedgerRecord::Clear {
            group_id: group_id.to_string(),
            unit_id: unit_id.to_string(),
        })
    }

    fn pending(&self) -> Result<Vec<PendingUnit>, LogError> {
        Ok(self.live.iter().map(|entry| entry.value().clone()).collect())
    }
}
