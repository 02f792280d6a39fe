//! [`MemoryBank`] – the memory lifecycle.
//!
//! `add_experience` runs judge → distill → embed → store; `retrieve_memories`
//! embeds a query and asks the store for its nearest items.  Infrastructure
//! errors (embedding, store, model) propagate unchanged, and nothing is
//! persisted unless every step before the store insert succeeded.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reasonbank_memory::{EmbeddingPort, HashEmbedder, InMemoryStore};
//! use reasonbank_runtime::bank::MemoryBank;
//! use reasonbank_runtime::distill::LlmDistiller;
//! use reasonbank_runtime::judge::LlmJudge;
//! use reasonbank_runtime::llm_driver::LlmDriver;
//!
//! # async fn demo() -> Result<(), reasonbank_types::BankError> {
//! let model = Arc::new(LlmDriver::new("http://localhost:11434", "llama3"));
//! let bank = MemoryBank::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(EmbeddingPort::new(Arc::new(HashEmbedder::new(256)?))),
//!     Arc::new(LlmJudge::new(model.clone())),
//!     Arc::new(LlmDistiller::new(model)),
//! );
//!
//! bank.add_experience("opened settings, toggled dark mode", "enable dark mode").await?;
//! let hints = bank.retrieve_memories("turn on dark theme", 1).await?;
//! # let _ = hints;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use reasonbank_memory::{EmbeddingPort, SimilarityStore};
use reasonbank_types::{BankError, MemoryItem, MemoryRecord, Outcome};
use tracing::{debug, info, instrument};

use crate::distill::Distiller;
use crate::judge::Judge;

/// Shared handles to the store, the embedding port, the judge and the
/// distiller.
pub struct MemoryBank {
    store: Arc<dyn SimilarityStore>,
    embedder: Arc<EmbeddingPort>,
    judge: Arc<dyn Judge>,
    distiller: Arc<dyn Distiller>,
}

impl MemoryBank {
    pub fn new(
        store: Arc<dyn SimilarityStore>,
        embedder: Arc<EmbeddingPort>,
        judge: Arc<dyn Judge>,
        distiller: Arc<dyn Distiller>,
    ) -> Self {
        Self {
            store,
            embedder,
            judge,
            distiller,
        }
    }

    pub fn judge(&self) -> &dyn Judge {
        self.judge.as_ref()
    }

    pub fn distiller(&self) -> &dyn Distiller {
        self.distiller.as_ref()
    }

    pub fn embedder(&self) -> &EmbeddingPort {
        &self.embedder
    }

    /// Number of records in the underlying store.
    pub async fn record_count(&self) -> Result<usize, BankError> {
        self.store.len().await
    }

    /// Judge, distill and persist one experience.
    ///
    /// The record is returned even when it carried no items and was
    /// therefore not stored.
    #[instrument(skip_all, fields(query_len = query.len(), trajectory_len = trajectory.len()))]
    pub async fn add_experience(
        &self,
        trajectory: &str,
        query: &str,
    ) -> Result<MemoryRecord, BankError> {
        let outcome = self.judge.judge(trajectory, query).await?;
        let items = self.distiller.distill(trajectory, query, outcome).await?;
        self.consolidate(query, trajectory, outcome, items).await
    }

    /// Embed `query` and persist a record for an already judged and
    /// distilled trajectory.
    #[instrument(skip_all, fields(query_len = query.len(), outcome = %outcome, n_items = items.len()))]
    pub async fn consolidate(
        &self,
        query: &str,
        trajectory: &str,
        outcome: Outcome,
        items: Vec<MemoryItem>,
    ) -> Result<MemoryRecord, BankError> {
        let embedding = self.embedder.embed(query).await?;
        let record = MemoryRecord::new(
            query.to_string(),
            embedding,
            trajectory.to_string(),
            outcome,
            items,
        );
        if self.store.add(&record).await? {
            info!(id = %record.id, n_items = record.items.len(), "memory record consolidated");
        } else {
            debug!(id = %record.id, "no memory items distilled, record not stored");
        }
        Ok(record)
    }

    /// Return at most `k` memory items relevant to `query`.
    #[instrument(skip_all, fields(query_len = query.len(), k = k))]
    pub async fn retrieve_memories(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<MemoryItem>, BankError> {
        if k < 1 {
            return Err(BankError::InvalidArgument("k must be at least 1".into()));
        }
        let embedding = self.embedder.embed(query).await?;
        let items = self.store.query(&embedding, k).await?;
        debug!(n_items = items.len(), "memories retrieved");
        Ok(items)
    }
}
