//! The [`SimilarityStore`] port and its ranking policy.
//!
//! Every backend ranks the same way, through [`rank_items`]:
//!
//! 1. Score each stored record by the cosine similarity between the query
//!    embedding and the record's query embedding.
//! 2. Order records by score, highest first; equal scores keep insertion
//!    order (earlier record first).
//! 3. Walk the ordered records and flatten their items until `k` items are
//!    collected or the records run out.
//!
//! Records with no items are never inserted, so every stored record
//! contributes at least one candidate item.
//!
//! # Example
//!
//! ```rust
//! # tokio_test_block_on(async {
//! use reasonbank_memory::store::{InMemoryStore, SimilarityStore};
//! use reasonbank_types::{MemoryItem, MemoryRecord, Outcome};
//!
//! let store = InMemoryStore::new();
//! let item = MemoryItem::new("Read the docs", "Check docs first.", "Open the README.").unwrap();
//! let record = MemoryRecord::new(
//!     "install the tool".into(),
//!     vec![1.0, 0.0],
//!     "trajectory text".into(),
//!     Outcome::Success,
//!     vec![item.clone()],
//! );
//! assert!(store.add(&record).await.unwrap());
//!
//! let items = store.query(&[1.0, 0.0], 1).await.unwrap();
//! assert_eq!(items, vec![item]);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use reasonbank_types::{BankError, MemoryItem, MemoryRecord};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Port
// ─────────────────────────────────────────────────────────────────────────────

/// Append-only store of memory records with k-nearest-neighbour recall.
///
/// Implementations must tolerate concurrent `query`/`add` calls from
/// parallel scaling branches; each `add` is atomic on its own.
#[async_trait]
pub trait SimilarityStore: Send + Sync {
    /// Persist `record`.
    ///
    /// Returns `Ok(false)` without storing anything when the record has no
    /// items.  Rejects an empty embedding with [`BankError::InvalidArgument`]
    /// and one whose dimension differs from the stored records with
    /// [`BankError::EmbeddingUnavailable`].
    async fn add(&self, record: &MemoryRecord) -> Result<bool, BankError>;

    /// Return at most `k` items from the records closest to
    /// `query_embedding`, ranked per [`rank_items`].
    async fn query(&self, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryItem>, BankError>;

    /// Number of persisted records.
    async fn len(&self) -> Result<usize, BankError>;

    async fn is_empty(&self) -> Result<bool, BankError> {
        Ok(self.len().await? == 0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Duplicate handling
// ─────────────────────────────────────────────────────────────────────────────

/// How duplicate items from different records are treated on recall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupPolicy {
    /// Return every item, duplicates included.
    #[default]
    Keep,
    /// Skip items whose title was already returned (case-insensitive).
    Title,
    /// Skip items whose content was already returned (whitespace-trimmed).
    Content,
}

impl DedupPolicy {
    fn key(&self, item: &MemoryItem) -> Option<String> {
        match self {
            DedupPolicy::Keep => None,
            DedupPolicy::Title => Some(item.title.trim().to_lowercase()),
            DedupPolicy::Content => Some(item.content.trim().to_string()),
        }
    }
}

impl std::str::FromStr for DedupPolicy {
    type Err = BankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keep" | "none" => Ok(DedupPolicy::Keep),
            "title" => Ok(DedupPolicy::Title),
            "content" => Ok(DedupPolicy::Content),
            other => Err(BankError::InvalidArgument(format!(
                "unknown dedup policy `{other}` (expected keep, title or content)"
            ))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ranking
// ─────────────────────────────────────────────────────────────────────────────

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Rank `records` against `query` and flatten their items, capped at `k`.
///
/// `records` must be yielded in insertion order: the position in the
/// iterator is the tie-break.
pub fn rank_items<'a, I>(records: I, query: &[f32], k: usize, dedup: DedupPolicy) -> Vec<MemoryItem>
where
    I: IntoIterator<Item = (&'a [f32], &'a [MemoryItem])>,
{
    let mut scored: Vec<(usize, f32, &'a [MemoryItem])> = records
        .into_iter()
        .enumerate()
        .map(|(seq, (embedding, items))| (seq, cosine_similarity(embedding, query), items))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(k);
    'records: for (seq, score, items) in scored {
        debug!(seq, score, n_items = items.len(), "candidate record");
        for item in items {
            if out.len() == k {
                break 'records;
            }
            if let Some(key) = dedup.key(item) {
                if !seen.insert(key) {
                    continue;
                }
            }
            out.push(item.clone());
        }
    }
    out
}

/// Shared argument checks for `query`.
pub(crate) fn check_query(query_embedding: &[f32], k: usize) -> Result<(), BankError> {
    if k == 0 {
        return Err(BankError::InvalidArgument("k must be at least 1".into()));
    }
    if query_embedding.is_empty() {
        return Err(BankError::InvalidArgument("query embedding is empty".into()));
    }
    Ok(())
}

/// Reject a vector whose dimension differs from the store's established one.
pub(crate) fn check_dimension(stored: Option<usize>, got: usize) -> Result<(), BankError> {
    if got == 0 {
        return Err(BankError::InvalidArgument("embedding is empty".into()));
    }
    match stored {
        Some(dim) if dim != got => Err(BankError::EmbeddingUnavailable(format!(
            "embedding has {got} dimensions but the store holds {dim}-dimensional records"
        ))),
        _ => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// Process-local store; contents are lost when the value is dropped.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<MemoryRecord>>,
    dedup: DedupPolicy,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dedup(dedup: DedupPolicy) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            dedup,
        }
    }

    fn poisoned() -> BankError {
        BankError::StoreUnavailable("in-memory store lock poisoned".into())
    }
}

#[async_trait]
impl SimilarityStore for InMemoryStore {
    async fn add(&self, record: &MemoryRecord) -> Result<bool, BankError> {
        if record.items.is_empty() {
            return Ok(false);
        }
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        let stored = records.first().map(|r| r.query_embedding.len());
        check_dimension(stored, record.query_embedding.len())?;
        records.push(record.clone());
        Ok(true)
    }

    async fn query(&self, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryItem>, BankError> {
        check_query(query_embedding, k)?;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
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
        Ok(self.records.read().map_err(|_| Self::poisoned())?.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
