//! Text embedding.
//!
//! [`EmbeddingBackend`] is the raw provider seam.  Callers go through
//! [`EmbeddingPort`], which pins the vector dimension: the first successful
//! embedding fixes it (unless configured up-front) and every later vector must
//! match it exactly.  Nothing is ever truncated or padded.
//!
//! # Example
//!
//! ```rust
//! # tokio_test_block_on(async {
//! use std::sync::Arc;
//! use reasonbank_memory::embedding::{EmbeddingPort, HashEmbedder};
//!
//! let port = EmbeddingPort::new(Arc::new(HashEmbedder::new(64).unwrap()));
//! let a = port.embed("sort a list of numbers").await.unwrap();
//! let b = port.embed("sort a list of numbers").await.unwrap();
//! assert_eq!(a, b);
//! assert_eq!(port.dimension(), Some(64));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use reasonbank_types::BankError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Backend seam
// ─────────────────────────────────────────────────────────────────────────────

/// A text → vector provider.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BankError>;

    /// Identifier of the model behind this backend (for logs and `/settings`).
    fn model_name(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────────────────
// EmbeddingPort
// ─────────────────────────────────────────────────────────────────────────────

/// Dimension-checking wrapper shared by the bank and the store.
pub struct EmbeddingPort {
    backend: Arc<dyn EmbeddingBackend>,
    dimension: OnceLock<usize>,
}

impl EmbeddingPort {
    /// Port whose dimension is fixed by the first successful embedding.
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            dimension: OnceLock::new(),
        }
    }

    /// Port with the dimension configured up-front.
    pub fn with_dimension(backend: Arc<dyn EmbeddingBackend>, dimension: usize) -> Self {
        let port = Self::new(backend);
        let _ = port.dimension.set(dimension);
        port
    }

    /// The established dimension, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension.get().copied()
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, BankError> {
        let vector = self.backend.embed(text).await?;
        if vector.is_empty() {
            return Err(BankError::EmbeddingUnavailable(format!(
                "backend `{}` returned an empty vector",
                self.backend.model_name()
            )));
        }
        let expected = *self.dimension.get_or_init(|| vector.len());
        if vector.len() != expected {
            return Err(BankError::EmbeddingUnavailable(format!(
                "backend `{}` returned {} dimensions, expected {expected}",
                self.backend.model_name(),
                vector.len()
            )));
        }
        Ok(vector)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HashEmbedder
// ─────────────────────────────────────────────────────────────────────────────

/// Offline feature-hashing embedder.
///
/// Each lower-cased alphanumeric token and each character trigram of the
/// normalised text is hashed into one of `dimension` buckets with a signed
/// contribution; the result is L2-normalised.  Texts sharing vocabulary land
/// close together, which is all recall needs for offline runs and tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    name: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Result<Self, BankError> {
        if dimension == 0 {
            return Err(BankError::InvalidArgument(
                "hash embedder dimension must be at least 1".into(),
            ));
        }
        Ok(Self {
            dimension,
            name: format!("hash-{dimension}"),
        })
    }

    /// Bucket placement is part of the persisted format and must be identical
    /// across builds and toolchains.
    fn bucket(&self, feature: &str, vector: &mut [f32], weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(prefix);
        let idx = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign * weight;
    }

    /// Synchronous core of [`EmbeddingBackend::embed`].
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        for token in &tokens {
            self.bucket(token, &mut vector, 1.0);
        }
        let normalised: Vec<char> = tokens.join(" ").chars().collect();
        for window in normalised.windows(3) {
            let trigram: String = window.iter().collect();
            self.bucket(&trigram, &mut vector, 0.5);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingBackend for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BankError> {
        Ok(self.embed_sync(text))
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// OllamaEmbedder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a str,
}

/// `/api/embed` reply.  Some server versions answer with the singular field.
#[derive(Deserialize)]
struct OllamaEmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

/// HTTP embedding backend for Ollama, with an OpenAI-compatible fallback.
///
/// Tries `POST {base}/api/embed` first and, if that fails for any reason,
/// `POST {base}/v1/embeddings`.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn embed_ollama(&self, text: &str) -> Result<Vec<f32>, String> {
        let url = format!("{}/api/embed", self.base_url);
        let resp: OllamaEmbedResponse = self
            .client
            .post(&url)
            .json(&EmbedRequest { model: &self.model, input: text })
            .timeout(self.timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;

        let vector = resp.embeddings.into_iter().next().unwrap_or(resp.embedding);
        if vector.is_empty() {
            return Err("no embedding in /api/embed response".into());
        }
        Ok(vector)
    }

    async fn embed_openai(&self, text: &str) -> Result<Vec<f32>, String> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp: OpenAiEmbedResponse = self
            .client
            .post(&url)
            .json(&EmbedRequest { model: &self.model, input: text })
            .timeout(self.timeout)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;

        resp.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| "no embedding in /v1/embeddings response".to_string())
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BankError> {
        let ollama_err = match self.embed_ollama(text).await {
            Ok(v) => {
                debug!(model = %self.model, dim = v.len(), "embedded via /api/embed");
                return Ok(v);
            }
            Err(e) => e,
        };
        warn!(model = %self.model, error = %ollama_err, "/api/embed failed, trying /v1/embeddings");

        self.embed_openai(text).await.map_err(|openai_err| {
            BankError::EmbeddingUnavailable(format!(
                "{} at {}: ollama: {ollama_err} | openai: {openai_err}",
                self.model, self.base_url
            ))
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::cosine_similarity;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Replays a fixed list of vectors.
    struct Scripted {
        replies: Mutex<Vec<Vec<f32>>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Vec<f32>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self { replies: Mutex::new(replies) })
        }
    }

    #[async_trait]
    impl EmbeddingBackend for Scripted {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, BankError> {
            Ok(self.replies.lock().unwrap().pop().unwrap_or_default())
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    // ── EmbeddingPort ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_embedding_fixes_dimension() {
        let port = EmbeddingPort::new(Scripted::new(vec![vec![1.0, 0.0], vec![1.0, 0.0, 0.0]]));
        assert_eq!(port.dimension(), None);
        port.embed("a").await.unwrap();
        assert_eq!(port.dimension(), Some(2));
        let err = port.embed("b").await.unwrap_err();
        assert!(matches!(err, BankError::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn configured_dimension_rejects_other_sizes() {
        let port = EmbeddingPort::with_dimension(Scripted::new(vec![vec![1.0, 0.0]]), 3);
        assert!(matches!(
            port.embed("a").await,
            Err(BankError::EmbeddingUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn empty_vector_is_unavailable() {
        let port = EmbeddingPort::new(Scripted::new(vec![vec![]]));
        assert!(matches!(
            port.embed("a").await,
            Err(BankError::EmbeddingUnavailable(_))
        ));
        assert_eq!(port.dimension(), None);
    }

    // ── HashEmbedder ─────────────────────────────────────────────────────────

    #[test]
    fn hash_embedder_is_deterministic_and_normalised() {
        let e = HashEmbedder::new(128).unwrap();
        let a = e.embed_sync("Find the cheapest flight to Lisbon");
        assert_eq!(a, e.embed_sync("Find the cheapest flight to Lisbon"));
        assert_eq!(a.len(), 128);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_places_related_texts_closer() {
        let e = HashEmbedder::new(256).unwrap();
        let q = e.embed_sync("find the cheapest flight to lisbon");
        let near = e.embed_sync("find a cheap flight to lisbon");
        let far = e.embed_sync("refactor the database migration script");
        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[test]
    fn hash_embedder_buckets_are_pinned() {
        let e = HashEmbedder::new(8).unwrap();
        assert_eq!(
            e.embed_sync("sort numbers"),
            vec![0.0, 0.0, 0.5, 0.0, 0.75, -0.25, 0.25, -0.25]
        );
    }

    #[test]
    fn hash_embedder_rejects_zero_dimension() {
        assert!(HashEmbedder::new(0).is_err());
    }

    #[test]
    fn hash_embedder_empty_text_is_zero_vector() {
        let e = HashEmbedder::new(8).unwrap();
        assert!(e.embed_sync("   ").iter().all(|x| *x == 0.0));
    }

    // ── OllamaEmbedder ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn ollama_embed_endpoint_is_used_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "embeddings": [[0.1, 0.2, 0.3]] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "nomic-embed-text");
        let v = embedder.embed("hello").await.unwrap();
        assert_eq!(v, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn falls_back_to_openai_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": [{ "embedding": [0.5, 0.5] }] })),
            )
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(format!("{}/", server.uri()), "m");
        assert_eq!(embedder.embed("hello").await.unwrap(), vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn both_endpoints_failing_is_embedding_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "m");
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, BankError::EmbeddingUnavailable(_)));
    }
}
