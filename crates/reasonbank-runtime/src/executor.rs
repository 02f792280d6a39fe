//! [`Executor`] – the agent that turns a query into a trajectory.
//!
//! The memory engine never looks inside a trajectory; it only needs an
//! executor that accepts the query, the retrieved prior memories and, during
//! sequential refinement, feedback on the previous attempt.
//!
//! [`LlmExecutor`] is a minimal single-call agent: the model's reply is the
//! trajectory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reasonbank_types::{MemoryItem, RefinementContext};
use thiserror::Error;

use crate::llm_driver::{ChatMessage, LanguageModel};

/// Why an executor invocation produced no trajectory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor failed: {0}")]
    Failed(String),
    #[error("executor timed out after {0:?}")]
    Timeout(Duration),
}

/// Produces trajectories.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(
        &self,
        query: &str,
        prior_memories: &[MemoryItem],
        refinement: Option<&RefinementContext>,
    ) -> Result<String, ExecutorError>;

    /// Whether trajectories `a` and `b` reach the same answer.
    ///
    /// `None` means the executor cannot compare trajectories; parallel
    /// scaling then keeps the first candidate in invocation order.
    async fn agree(&self, a: &str, b: &str) -> Option<bool> {
        let _ = (a, b);
        None
    }
}

/// Render memories as `Title/Description/Content` blocks separated by `---`.
pub fn format_memories(memories: &[MemoryItem]) -> String {
    if memories.is_empty() {
        return "No relevant memories found.".to_string();
    }
    memories
        .iter()
        .map(|m| {
            format!(
                "Title: {}\nDescription: {}\nContent: {}",
                m.title, m.description, m.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmExecutor
// ─────────────────────────────────────────────────────────────────────────────

const EXECUTOR_SYSTEM_PROMPT: &str = "\
You are a helpful assistant. Use the memories below when they are relevant. \
Think step by step and write out your full reasoning; your response is the \
trajectory of your thought process, ending with your final answer.";

/// [`Executor`] that answers with a single model completion.
pub struct LlmExecutor {
    model: Arc<dyn LanguageModel>,
}

impl LlmExecutor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    fn build_prompt(
        query: &str,
        prior_memories: &[MemoryItem],
        refinement: Option<&RefinementContext>,
    ) -> Vec<ChatMessage> {
        let mut user = format!(
            "Memories:\n{}\n\nQuery: {query}\n",
            format_memories(prior_memories)
        );
        if let Some(ctx) = refinement {
            user.push_str(&format!(
                "\nYour previous attempt was judged: {}.\nPrevious attempt:\n{}\n\n\
                 Check the previous attempt for mistakes and produce an improved trajectory.\n",
                ctx.previous_outcome, ctx.previous_trajectory
            ));
        }
        user.push_str("\nTrajectory:");
        vec![ChatMessage::system(EXECUTOR_SYSTEM_PROMPT), ChatMessage::user(user)]
    }
}

#[async_trait]
impl Executor for LlmExecutor {
    async fn run(
        &self,
        query: &str,
        prior_memories: &[MemoryItem],
        refinement: Option<&RefinementContext>,
    ) -> Result<String, ExecutorError> {
        let messages = Self::build_prompt(query, prior_memories, refinement);
        self.model
            .complete(&messages)
            .await
            .map_err(|e| ExecutorError::Failed(e.to_string()))
    }
}
