//! Scripted collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reasonbank_memory::{EmbeddingBackend, EmbeddingPort, HashEmbedder, InMemoryStore, SimilarityStore};
use reasonbank_types::{BankError, MemoryItem, MemoryRecord, Outcome, RefinementContext};

use crate::distill::Distiller;
use crate::executor::{Executor, ExecutorError};
use crate::judge::Judge;
use crate::llm_driver::{ChatMessage, LanguageModel, LlmError};

pub fn item(title: &str) -> MemoryItem {
    MemoryItem::new(title, format!("{title} description"), format!("{title} content")).unwrap()
}

pub fn hash_port() -> Arc<EmbeddingPort> {
    Arc::new(EmbeddingPort::new(Arc::new(HashEmbedder::new(64).unwrap())))
}

// ── embedding ────────────────────────────────────────────────────────────────

pub struct FailingEmbedder;

#[async_trait]
impl EmbeddingBackend for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, BankError> {
        Err(BankError::EmbeddingUnavailable("backend offline".into()))
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

// ── language model ───────────────────────────────────────────────────────────

/// Replays canned replies in call order; `Err` entries become
/// [`LlmError::BadResponse`].
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    structured: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Result<S, S>>,
        S: Into<String>,
    {
        Arc::new(Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(Into::into).map_err(Into::into))
                    .collect(),
            ),
            prompts: Mutex::new(Vec::new()),
            structured: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn structured_calls(&self) -> usize {
        self.structured.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(LlmError::BadResponse(e)),
            None => Err(LlmError::BadResponse("script exhausted".into())),
        }
    }

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        _schema: &serde_json::Value,
    ) -> Result<String, LlmError> {
        self.structured.fetch_add(1, Ordering::SeqCst);
        self.complete(messages).await
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

// ── judge ────────────────────────────────────────────────────────────────────

/// Looks the verdict up by exact trajectory text; anything else is `Unknown`.
pub struct MapJudge {
    verdicts: HashMap<String, Outcome>,
    calls: AtomicUsize,
}

impl MapJudge {
    pub fn new<I>(verdicts: I) -> Arc<Self>
    where
        I: IntoIterator<Item = (&'static str, Outcome)>,
    {
        Arc::new(Self {
            verdicts: verdicts.into_iter().map(|(t, o)| (t.to_string(), o)).collect(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for MapJudge {
    async fn judge(&self, trajectory: &str, _query: &str) -> Result<Outcome, BankError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdicts.get(trajectory).copied().unwrap_or(Outcome::Unknown))
    }
}

// ── distiller ────────────────────────────────────────────────────────────────

/// Emits one item titled `lesson from <trajectory>`, or nothing when built
/// with [`EchoDistiller::empty`].
pub struct EchoDistiller {
    empty: bool,
    seen: Mutex<Vec<(String, Outcome)>>,
}

impl EchoDistiller {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            empty: false,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            empty: true,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.seen.lock().unwrap().iter().map(|(_, o)| *o).collect()
    }

    pub fn trajectories(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl Distiller for EchoDistiller {
    async fn distill(
        &self,
        trajectory: &str,
        _query: &str,
        outcome: Outcome,
    ) -> Result<Vec<MemoryItem>, BankError> {
        self.seen.lock().unwrap().push((trajectory.to_string(), outcome));
        if self.empty {
            return Ok(Vec::new());
        }
        Ok(vec![item(&format!("lesson from {trajectory}"))])
    }
}

// ── store ────────────────────────────────────────────────────────────────────

/// [`InMemoryStore`] that counts `add` calls.
pub struct CountingStore {
    inner: InMemoryStore,
    adds: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            adds: AtomicUsize::new(0),
        })
    }

    pub fn add_calls(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub async fn stored(&self) -> usize {
        self.inner.len().await.unwrap()
    }
}

#[async_trait]
impl SimilarityStore for CountingStore {
    async fn add(&self, record: &MemoryRecord) -> Result<bool, BankError> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        self.inner.add(record).await
    }

    async fn query(&self, query_embedding: &[f32], k: usize) -> Result<Vec<MemoryItem>, BankError> {
        self.inner.query(query_embedding, k).await
    }

    async fn len(&self) -> Result<usize, BankError> {
        self.inner.len().await
    }
}

// ── executor ─────────────────────────────────────────────────────────────────

/// One scripted executor invocation.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(&'static str),
    /// Reply after sleeping for the given duration.
    After(Duration, &'static str),
    Fail(&'static str),
    /// Never returns within any test timeout.
    Hang,
}

/// Plays [`Step`]s in call order and records the refinement context of each
/// call.
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    refinements: Mutex<Vec<Option<RefinementContext>>>,
    agreement: Option<fn(&str, &str) -> bool>,
}

impl ScriptedExecutor {
    pub fn new<I: IntoIterator<Item = Step>>(steps: I) -> Arc<Self> {
        Arc::new(Self::build(steps, None))
    }

    /// Executor that can compare trajectories with `agree`.
    pub fn comparing<I: IntoIterator<Item = Step>>(steps: I, agree: fn(&str, &str) -> bool) -> Arc<Self> {
        Arc::new(Self::build(steps, Some(agree)))
    }

    fn build<I: IntoIterator<Item = Step>>(steps: I, agreement: Option<fn(&str, &str) -> bool>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            refinements: Mutex::new(Vec::new()),
            agreement,
        }
    }

    pub fn calls(&self) -> usize {
        self.refinements.lock().unwrap().len()
    }

    pub fn refinements(&self) -> Vec<Option<RefinementContext>> {
        self.refinements.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(
        &self,
        _query: &str,
        _prior_memories: &[MemoryItem],
        refinement: Option<&RefinementContext>,
    ) -> Result<String, ExecutorError> {
        self.refinements.lock().unwrap().push(refinement.cloned());
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(t)) => Ok(t.to_string()),
            Some(Step::After(delay, t)) => {
                tokio::time::sleep(delay).await;
                Ok(t.to_string())
            }
            Some(Step::Fail(e)) => Err(ExecutorError::Failed(e.to_string())),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("too late".to_string())
            }
            None => Err(ExecutorError::Failed("script exhausted".into())),
        }
    }

    async fn agree(&self, a: &str, b: &str) -> Option<bool> {
        self.agreement.map(|f| f(a, b))
    }
}
