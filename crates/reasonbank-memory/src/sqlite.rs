//! SQLite-backed memory pool.
//!
//! Persists [`MemoryRecord`]s with their query embeddings to a local SQLite
//! database and ranks them with the shared cosine-similarity policy from
//! [`store`](crate::store).
//!
//! # Storage layout
//!
//! A single table `memory_records` is created (if it does not already exist)
//! with the following columns:
//!
//! | column     | type    | description                                      |
//! |------------|---------|--------------------------------------------------|
//! | seq        | INTEGER | Autoincrement insertion sequence (tie-break key) |
//! | id         | TEXT    | UUID v4, unique                                  |
//! | created_at | TEXT    | RFC-3339 creation time (UTC)                     |
//! | query      | TEXT    | Task text the record was distilled for           |
//! | trajectory | TEXT    | Raw trajectory text                              |
//! | outcome    | TEXT    | `success` / `failure` / `unknown`                |
//! | items      | TEXT    | JSON array of memory items                       |
//! | embedding  | BLOB    | Little-endian f32 vector (4 × N bytes)           |
//!
//! # Example
//!
//! ```rust
//! use reasonbank_memory::sqlite::SqliteStore;
//!
//! let store = SqliteStore::open_in_memory().unwrap();
//! assert!(store.all_records().unwrap().is_empty());
//! ```

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reasonbank_types::{BankError, MemoryItem, MemoryRecord, Outcome};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{DedupPolicy, SimilarityStore, check_dimension, check_query, rank_items};

// ─────────────────────────────────────────────────────────────────────────────
// Embedding serialisation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn store_err(e: rusqlite::Error) -> BankError {
    BankError::StoreUnavailable(format!("SQLite error: {e}"))
}

fn corrupt(column: usize, e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(column, e.to_string(), rusqlite::types::Type::Text)
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteStore
// ─────────────────────────────────────────────────────────────────────────────

/// Durable [`SimilarityStore`] on a single SQLite database.
///
/// The connection sits behind a mutex so one store can be shared between
/// parallel scaling branches; every insert is a single statement and
/// therefore atomic.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    dedup: DedupPolicy,
}

impl SqliteStore {
    /// Open (or create) a persistent SQLite database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BankError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(store_err)?;
        info!(path = %path.display(), "opened sqlite memory store");
        Self::from_connection(conn)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, BankError> {
        Self::from_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    /// Apply a duplicate-handling policy to recall.
    pub fn with_dedup(mut self, dedup: DedupPolicy) -> Self {
        self.dedup = dedup;
        self
    }

    fn from_connection(conn: Connection) -> Result<Self, BankError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS memory_records (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                query      TEXT NOT NULL,
                trajectory TEXT NOT NULL,
                outcome    TEXT NOT NULL,
                items      TEXT NOT NULL,
                embedding  BLOB NOT NULL
            );",
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            dedup: DedupPolicy::default(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BankError> {
        self.conn
            .lock()
            .map_err(|_| BankError::StoreUnavailable("sqlite connection lock poisoned".into()))
    }

    /// Dimension of the stored embeddings, taken from the oldest record.
    fn stored_dimension(conn: &Connection) -> Result<Option<usize>, BankError> {
        let bytes: Option<i64> = conn
            .query_row(
                "SELECT length(embedding) FROM memory_records ORDER BY seq ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(bytes.map(|b| b as usize / 4))
    }

    /// Retrieve all stored records in insertion order.
    pub fn all_records(&self) -> Result<Vec<MemoryRecord>, BankError> {
        let conn = self.lock()?;
        Self::load_records(&conn).map_err(store_err)
    }

    fn load_records(conn: &Connection) -> Result<Vec<MemoryRecord>, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT id, created_at, query, trajectory, outcome, items, embedding
             FROM memory_records
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Vec<u8>>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id_str, ts_str, query, trajectory, outcome_str, items_json, blob) = row?;
            let id = Uuid::parse_str(&id_str).map_err(|e| corrupt(0, e))?;
            let created_at = ts_str.parse::<DateTime<Utc>>().map_err(|e| corrupt(1, e))?;
            let outcome = Outcome::parse(&outcome_str)
                .ok_or_else(|| corrupt(4, format!("unknown outcome `{outcome_str}`")))?;
            let items: Vec<MemoryItem> =
                serde_json::from_str(&items_json).map_err(|e| corrupt(5, e))?;
            records.push(MemoryRecord {
                id,
                created_at,
                query,
                query_embedding: bytes_to_embedding(&blob),
                trajectory,
                outcome,
                items,
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl SimilarityStore for SqliteStore {
    async fn add(&self, record: &MemoryRecord) -> Result<bool, BankError> {
        if record.items.is_empty() {
            return Ok(false);
        }
        let items_json = serde_json::to_string(&record.items)
            .map_err(|e| BankError::StoreUnavailable(format!("failed to encode items: {e}")))?;

        let conn = self.lock()?;
        check_dimension(Self::stored_dimension(&conn)?, record.query_embedding.len())?;
        conn.execute(
            "INSERT INTO memory_records
                 (id, created_at, query, trajectory, outcome, items, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.to_string(),
                record.created_at.to_rfc3339(),
                record.query,
                record.trajectory,
                record.outcome.as_str(),
                items_json,
                embedding_to_bytes(&record.query_embedding),
            ],
        )
        .map_err(store_err)?;
        debug!(id = %record.id, n_items = record.items.len(), "inserted memory record");
        Ok(true)
    }

    async fn query(&self, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryItem>, BankError> {
        check_query(query_embedding, k)?;
        let records = {
            let conn = self.lock()?;
            Self::load_records(&conn).map_err(store_err)?
        };
        if let Some(first) = records.first() {
            check_dimension(Some(first.query_embedding.len()), query_embedding.len())?;
        }
        Ok(rank_items(
            records
                .iter()
                .map(|r| (r.query_embedding.as_slice(), r.items.as_slice())),
            query_embedding,
            k,
            self.dedup,
        ))
    }

    async fn len(&self) -> Result<usize, BankError> {
        let conn = self.lock()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM memory_records", [], |row| row.get(0))
            .map_err(store_err)?;
        Ok(n as usize)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
