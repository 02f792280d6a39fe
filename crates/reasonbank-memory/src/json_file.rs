//! JSON-document memory pool.
//!
//! The whole pool is held in memory and written back to a single
//! pretty-printed JSON file on every successful insert.  The file is written
//! to a sibling temporary path and renamed over the original, so a crash
//! mid-write never leaves a truncated pool behind.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use reasonbank_types::{BankError, MemoryItem, MemoryRecord};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{DedupPolicy, SimilarityStore, check_dimension, check_query, rank_items};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolFile {
    records: Vec<MemoryRecord>,
}

/// Durable [`SimilarityStore`] backed by one JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    pool: Mutex<PoolFile>,
    dedup: DedupPolicy,
}

impl JsonFileStore {
    /// Load the pool at `path`, or start empty when the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BankError> {
        let path = path.into();
        let pool = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            serde_json::from_str(&raw).map_err(|e| {
                BankError::StoreUnavailable(format!("corrupt pool file {}: {e}", path.display()))
            })?
        } else {
            PoolFile::default()
        };
        info!(path = %path.display(), n_records = pool.records.len(), "opened json memory store");
        Ok(Self {
            path,
            pool: Mutex::new(pool),
            dedup: DedupPolicy::default(),
        })
    }

    pub fn with_dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolFile>, BankError> {
        self.pool
            .lock()
            .map_err(|_| BankError::StoreUnavailable("json store lock poisoned".into()))
    }

    fn persist(&self, pool: &PoolFile) -> Result<(), BankError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        let json = serde_json::to_string_pretty(pool)
            .map_err(|e| BankError::StoreUnavailable(format!("failed to encode pool: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))
    }
}

fn io_err(path: &Path, e: std::io::Error) -> BankError {
    BankError::StoreUnavailable(format!("{}: {e}", path.display()))
}

#[async_trait]
impl SimilarityStore for JsonFileStore {
    async fn add(&self, record: &MemoryRecord) -> Result<bool, BankError> {
        if record.items.is_empty() {
            return Ok(false);
        }
        let mut pool = self.lock()?;
        let stored = pool.records.first().map(|r| r.query_embedding.len());
        check_dimension(stored, record.query_embedding.len())?;

        pool.records.push(record.clone());
        if let Err(e) = self.persist(&pool) {
            // Keep memory and disk in agreement.
            pool.records.pop();
            return Err(e);
        }
        debug!(id = %record.id, n_records = pool.records.len(), "persisted memory record");
        Ok(true)
    }

    async fn query(&self, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryItem>, BankError> {
        check_query(query_embedding, k)?;
        let pool = self.lock()?;
        if let Some(first) = pool.records.first() {
            check_dimension(Some(first.query_embedding.len()), query_embedding.len())?;
        }
        Ok(rank_items(
            pool.records
                .iter()
                .map(|r| (r.query_embedding.as_slice(), r.items.as_slice())),
            query_embedding,
            k,
            self.dedup,
        ))
    }

    async fn len(&self) -> Result<usize, BankError> {
        Ok(self.lock()?.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reasonbank_types::Outcome;

    fn record(title: &str, embedding: Vec<f32>) -> MemoryRecord {
        let item = MemoryItem::new(title, "desc", "content").unwrap();
        MemoryRecord::new("q".into(), embedding, "traj".into(), Outcome::Success, vec![item])
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("pool.json")).unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn add_writes_file_and_reopen_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pool.json");
        {
            let store = JsonFileStore::open(&path).unwrap();
            assert!(store.add(&record("alpha", vec![1.0, 0.0])).await.unwrap());
            assert!(store.add(&record("beta", vec![0.0, 1.0])).await.unwrap());
        }
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let store = JsonFileStore::open(&path).unwrap();
        assert_eq!(store.len().await.unwrap(), 2);
        let out = store.query(&[0.0, 1.0], 1).await.unwrap();
        assert_eq!(out[0].title, "beta");
    }

    #[tokio::test]
    async fn corrupt_file_is_store_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonFileStore::open(&path).unwrap_err();
        assert!(matches!(err, BankError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn rejected_record_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let store = JsonFileStore::open(&path).unwrap();
        store.add(&record("alpha", vec![1.0, 0.0])).await.unwrap();
        assert!(store.add(&record("bad", vec![1.0])).await.is_err());

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 1);
    }
}
