//! `reasonbank-memory` – The Memory Pool.
//!
//! Persists distilled experiences together with the embedding of the query
//! they were produced for, and ranks them by cosine similarity on recall.
//!
//! # Modules
//!
//! - [`store`] – the [`SimilarityStore`][store::SimilarityStore] port, the
//!   shared ranking policy ([`rank_items`][store::rank_items]) and the
//!   process-local [`InMemoryStore`][store::InMemoryStore].
//! - [`sqlite`] – [`SqliteStore`][sqlite::SqliteStore]: a durable store on a
//!   local SQLite file.
//! - [`json_file`] – [`JsonFileStore`][json_file::JsonFileStore]: a single
//!   JSON document rewritten on every insert, handy for development and for
//!   inspecting the pool by hand.
//! - [`embedding`] – the [`EmbeddingPort`][embedding::EmbeddingPort]
//!   dimension guard plus two backends: the offline
//!   [`HashEmbedder`][embedding::HashEmbedder] and the HTTP
//!   [`OllamaEmbedder`][embedding::OllamaEmbedder].

pub mod embedding;
pub mod json_file;
pub mod sqlite;
pub mod store;

pub use embedding::{EmbeddingBackend, EmbeddingPort, HashEmbedder, OllamaEmbedder};
pub use json_file::JsonFileStore;
pub use sqlite::SqliteStore;
pub use store::{DedupPolicy, InMemoryStore, SimilarityStore, cosine_similarity, rank_items};
