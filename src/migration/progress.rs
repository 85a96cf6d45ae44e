//! Append-only transfer audit trail
//!
//! One JSON object per line. Records are written as soon as a receipt is
//! observed and never rewritten. Resumability does not depend on this file:
//! owed amounts are always re-read from the ledgers.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::migration::types::TransferRecord;

struct Inner {
    file: File,
    records: Vec<TransferRecord>,
    satisfied: HashSet<String>,
}

/// Durable record of completed transfers for one run
pub struct ProgressLedger {
    path: PathBuf,
    run_id: Uuid,
    inner: Mutex<Inner>,
}

impl ProgressLedger {
    /// Open `path` for appending, creating it and its parent directory if needed
    pub async fn open(path: impl AsRef<Path>, run_id: Uuid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Persistence(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to open {}: {}", path.display(), e)))?;

        debug!("Progress ledger opened at {} (run {})", path.display(), run_id);

        Ok(Self {
            path,
            run_id,
            inner: Mutex::new(Inner {
                file,
                records: Vec::new(),
                satisfied: HashSet::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append a record
    ///
    /// A second satisfying record for the same account in this run is refused.
    pub async fn record(&self, record: TransferRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let key = record.account.to_lowercase();
        if record.satisfied && inner.satisfied.contains(&key) {
            return Err(Error::DuplicateSettlement(record.account.clone()));
        }

        let mut line = serde_json::to_string(&record)
            .map_err(|e| Error::Serialization(format!("Failed to serialize record: {}", e)))?;
        line.push('\n');

        inner
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Persistence(format!("Failed to append record: {}", e)))?;
        inner
            .file
            .flush()
            .await
            .map_err(|e| Error::Persistence(format!("Failed to flush record: {}", e)))?;

        if record.satisfied {
            inner.satisfied.insert(key);
        }
        inner.records.push(record);
        Ok(())
    }

    /// Force everything written so far to disk and return this run's records
    pub async fn snapshot(&self) -> Result<Vec<TransferRecord>> {
        let mut inner = self.inner.lock().await;
        inner
            .file
            .flush()
            .await
            .map_err(|e| Error::Persistence(format!("Failed to flush records: {}", e)))?;
        inner
            .file
            .sync_all()
            .await
            .map_err(|e| Error::Persistence(format!("Failed to sync records: {}", e)))?;

        info!(
            "Progress snapshot: {} records this run in {}",
            inner.records.len(),
            self.path.display()
        );
        Ok(inner.records.clone())
    }

    /// Read every record in a progress file, across all runs
    pub async fn load(path: impl AsRef<Path>) -> Result<Vec<TransferRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Persistence(format!("Failed to read {}: {}", path.display(), e)))?;

        let line_count = content.lines().count();
        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransferRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn final line is expected after a hard kill
                    if index + 1 == line_count {
                        warn!("Ignoring truncated last record in {}: {}", path.display(), e);
                    } else {
                        return Err(Error::Deserialization(format!(
                            "{} line {}: {}",
                            path.display(),
                            index + 1,
                            e
                        )));
                    }
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.jsonl");

        let first_run = Uuid::new_v4();
        let ledger = ProgressLedger::open(&path, first_run).await.unwrap();
        ledger
            .record(TransferRecord::new(first_run, "0xa", 100, "0x01".into(), true))
            .await
            .unwrap();
        ledger.snapshot().await.unwrap();
        drop(ledger);

        let second_run = Uuid::new_v4();
        let ledger = ProgressLedger::open(&path, second_run).await.unwrap();
        ledger
            .record(TransferRecord::new(second_run, "0xb", 7, "0x02".into(), false))
            .await
            .unwrap();

        let this_run = ledger.snapshot().await.unwrap();
        assert_eq!(this_run.len(), 1);

        let all = ProgressLedger::load(&path).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].run_id, first_run);
        assert_eq!(all[0].amount, 100);
        assert_eq!(all[1].account, "0xb");
    }

    #[tokio::test]
    async fn test_second_settlement_is_refused() {
        let dir = tempdir().unwrap();
        let run = Uuid::new_v4();
        let ledger = ProgressLedger::open(dir.path().join("r.jsonl"), run)
            .await
            .unwrap();

        // Partial transfers may repeat
        ledger
            .record(TransferRecord::new(run, "0xa", 10, "0x01".into(), false))
            .await
            .unwrap();
        ledger
            .record(TransferRecord::new(run, "0xa", 10, "0x02".into(), true))
            .await
            .unwrap();

        let err = ledger
            .record(TransferRecord::new(run, "0xA", 1, "0x03".into(), true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSettlement(_)));
        assert_eq!(ledger.snapshot().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let records = ProgressLedger::load(dir.path().join("nope.jsonl"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_load_tolerates_torn_tail_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r.jsonl");
        let run = Uuid::new_v4();
        let good = serde_json::to_string(&TransferRecord::new(run, "0xa", 1, "0x1".into(), true))
            .unwrap();

        tokio::fs::write(&path, format!("{}\n{{\"id\":", good))
            .await
            .unwrap();
        assert_eq!(ProgressLedger::load(&path).await.unwrap().len(), 1);

        tokio::fs::write(&path, format!("garbage\n{}\n", good))
            .await
            .unwrap();
        assert!(ProgressLedger::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("records.jsonl");
        let ledger = ProgressLedger::open(&path, Uuid::new_v4()).await.unwrap();
        assert!(ledger.path().exists());
    }
}
