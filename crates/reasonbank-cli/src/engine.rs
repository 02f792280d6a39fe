//! Boot sequence: turns a [`Config`] into a ready [`MattsEngine`].

use std::sync::Arc;
use std::time::Duration;

use reasonbank_memory::{
    EmbeddingBackend, EmbeddingPort, HashEmbedder, InMemoryStore, JsonFileStore, OllamaEmbedder,
    SimilarityStore, SqliteStore,
};
use reasonbank_runtime::{
    LanguageModel, LlmDistiller, LlmDriver, LlmExecutor, LlmJudge, MattsConfig, MattsEngine,
    MemoryBank,
};
use reasonbank_types::BankError;
use tracing::info;

use crate::config::{Config, EmbeddingKind, StoreBackend};

/// Wire the model driver, embedding port, store, judge, distiller and
/// executor described by `cfg`.
///
/// No network traffic happens here; an unreachable model server surfaces on
/// the first command that needs it.
pub fn build(cfg: &Config) -> Result<MattsEngine, BankError> {
    let model: Arc<dyn LanguageModel> = Arc::new(
        LlmDriver::new(&cfg.llm_base_url, &cfg.active_model).with_api_key(&cfg.api_key),
    );
    let embedder = Arc::new(embedding_port(cfg)?);
    let store = open_store(cfg)?;

    let judge = Arc::new(LlmJudge::new(model.clone()));
    let distiller = Arc::new(LlmDistiller::new(model.clone()).with_max_items(cfg.max_items));
    let bank = Arc::new(MemoryBank::new(store, embedder, judge, distiller));

    let executor = Arc::new(LlmExecutor::new(model.clone()));
    info!(
        model = %cfg.active_model,
        store = %cfg.store_backend,
        embedding = %cfg.embedding_backend,
        "memory engine ready"
    );
    Ok(MattsEngine::new(bank, executor)
        .with_synthesizer(model)
        .with_config(MattsConfig {
            prior_k: cfg.retrieve_k,
            branch_timeout: Duration::from_secs(cfg.branch_timeout_secs),
            synthesize: cfg.synthesize,
        }))
}

fn embedding_port(cfg: &Config) -> Result<EmbeddingPort, BankError> {
    Ok(match cfg.embedding_backend {
        EmbeddingKind::Hash => {
            let backend: Arc<dyn EmbeddingBackend> =
                Arc::new(HashEmbedder::new(cfg.embedding_dimension)?);
            EmbeddingPort::with_dimension(backend, cfg.embedding_dimension)
        }
        EmbeddingKind::Ollama => EmbeddingPort::new(Arc::new(OllamaEmbedder::new(
            &cfg.llm_base_url,
            &cfg.embedding_model,
        ))),
    })
}

/// Open the configured memory pool, creating its directory when needed.
pub fn open_store(cfg: &Config) -> Result<Arc<dyn SimilarityStore>, BankError> {
    if cfg.store_backend == StoreBackend::Memory {
        return Ok(Arc::new(InMemoryStore::with_dedup(cfg.dedup)));
    }

    let path = cfg.resolved_store_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            BankError::StoreUnavailable(format!("cannot create {}: {e}", parent.display()))
        })?;
    }

    let store: Arc<dyn SimilarityStore> = match cfg.store_backend {
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&path)?.with_dedup(cfg.dedup)),
        StoreBackend::Json => Arc::new(JsonFileStore::open(path)?.with_dedup(cfg.dedup)),
        StoreBackend::Memory => Arc::new(InMemoryStore::with_dedup(cfg.dedup)),
    };
    Ok(store)
}
