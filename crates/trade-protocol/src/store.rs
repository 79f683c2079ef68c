//! Durable keyed store of trade records
//!
//! One JSON file per trade, written atomically (tmp + rename) on every
//! successful transition and loaded in full at startup. The version counter
//! is the write-ordering guard: a write whose version does not follow the
//! stored version is rejected, so two machine instances racing from the same
//! snapshot can never both persist.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::error::PersistenceFailure;
use crate::record::TradeRecord;
use crate::types::TradeId;

/// Persistence collaborator for trade records.
///
/// Writes for one trade are serialized by the owning state machine; the
/// version check below only has to catch duplicate machine instances
/// (e.g. a crash-restart race applying against a stale snapshot).
pub trait TradeStore: Send + Sync {
    /// Load every stored record. Corrupt entries are logged and skipped.
    fn load_all(&self) -> Result<Vec<TradeRecord>, PersistenceFailure>;

    /// Persist one record. Fails with `VersionConflict` unless the record is
    /// new at version 0 or its version is exactly one above the stored one.
    fn persist(&self, record: &TradeRecord) -> Result<(), PersistenceFailure>;
}

/// File-backed store: `<dir>/<trade_id>.json`
pub struct FileTradeStore {
    dir: PathBuf,
}

impl FileTradeStore {
    /// Open (and create if missing) the store directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, PersistenceFailure> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, trade_id: &TradeId) -> PathBuf {
        self.dir.join(format!("{}.json", trade_id))
    }

    fn read_record(&self, path: &Path) -> Result<TradeRecord, PersistenceFailure> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl TradeStore for FileTradeStore {
    fn load_all(&self) -> Result<Vec<TradeRecord>, PersistenceFailure> {
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A record we cannot even decode has no trade id to
                    // cancel; skip it and leave the file for inspection.
                    warn!("Skipping unreadable trade record {}: {}", path.display(), e);
                }
            }
        }
        info!("Loaded {} trade record(s) from {}", records.len(), self.dir.display());
        Ok(records)
    }

    fn persist(&self, record: &TradeRecord) -> Result<(), PersistenceFailure> {
        let path = self.record_path(&record.trade_id);

        let stored_version = match self.read_record(&path) {
            Ok(stored) => Some(stored.version),
            Err(PersistenceFailure::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };
        check_version(&record.trade_id, stored_version, record.version)?;

        let json = serde_json::to_string_pretty(record)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

/// In-memory store for tests and embedded use
#[derive(Default)]
pub struct MemoryTradeStore {
    records: Mutex<HashMap<TradeId, TradeRecord>>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing the version check (test setup)
    pub fn seed(&self, record: TradeRecord) {
        self.records
            .lock()
            .expect("store lock")
            .insert(record.trade_id.clone(), record);
    }
}

impl TradeStore for MemoryTradeStore {
    fn load_all(&self) -> Result<Vec<TradeRecord>, PersistenceFailure> {
        Ok(self.records.lock().expect("store lock").values().cloned().collect())
    }

    fn persist(&self, record: &TradeRecord) -> Result<(), PersistenceFailure> {
        let mut records = self.records.lock().expect("store lock");
        let stored_version = records.get(&record.trade_id).map(|r| r.version);
        check_version(&record.trade_id, stored_version, record.version)?;
        records.insert(record.trade_id.clone(), record.clone());
        Ok(())
    }
}

fn check_version(
    trade_id: &TradeId,
    stored: Option<u64>,
    attempted: u64,
) -> Result<(), PersistenceFailure> {
    let expected_ok = match stored {
        None => attempted == 0,
        Some(stored) => attempted == stored + 1,
    };
    if expected_ok {
        Ok(())
    } else {
        Err(PersistenceFailure::VersionConflict {
            trade_id: trade_id.clone(),
            stored: stored.unwrap_or(0),
            attempted,
        })
    }
}
