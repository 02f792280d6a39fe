//! [`Distiller`] – turns a judged trajectory into memory items.
//!
//! The framing depends on the verdict: a successful trajectory yields
//! transferable strategies, a failed one yields preventative lessons, and an
//! undetermined one yields neutral observations.
//!
//! The model is asked for a JSON array of `{title, description, content}`
//! objects (a `{"memories": [...]}` wrapper and markdown code fences are
//! tolerated).  Malformed output triggers exactly one stricter re-ask; a
//! second malformed reply surfaces as [`BankError::DistillationParse`].

use std::sync::Arc;

use async_trait::async_trait;
use reasonbank_types::{BankError, MemoryItem, Outcome};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::judge::strip_code_fence;
use crate::llm_driver::{ChatMessage, LanguageModel, Role, schema_of};

/// Default cap on items kept per trajectory.
pub const DEFAULT_MAX_ITEMS: usize = 3;

/// Extracts reusable memory items from a trajectory.
#[async_trait]
pub trait Distiller: Send + Sync {
    /// Returns an empty vector when nothing can be extracted.
    async fn distill(
        &self,
        trajectory: &str,
        query: &str,
        outcome: Outcome,
    ) -> Result<Vec<MemoryItem>, BankError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum DistillReply {
    Items(Vec<MemoryItem>),
    Wrapped { memories: Vec<MemoryItem> },
}

/// Parse a distiller reply into validated items.
///
/// A blank reply means "nothing to extract".  Prose around a bare JSON array
/// is tolerated by falling back to the outermost `[...]` slice.
pub fn parse_items(reply: &str) -> Result<Vec<MemoryItem>, BankError> {
    let body = strip_code_fence(reply);
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let parsed = serde_json::from_str::<DistillReply>(body).or_else(|first_err| {
        match (body.find('['), body.rfind(']')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<DistillReply>(&body[start..=end]).map_err(|_| first_err)
            }
            _ => Err(first_err),
        }
    });
    let items = match parsed {
        Ok(DistillReply::Items(items)) | Ok(DistillReply::Wrapped { memories: items }) => items,
        Err(e) => return Err(BankError::DistillationParse(e.to_string())),
    };

    for item in &items {
        item.validate()
            .map_err(|e| BankError::DistillationParse(e.to_string()))?;
    }
    Ok(items)
}

// ─────────────────────────────────────────────────────────────────────────────
// Prompts
// ─────────────────────────────────────────────────────────────────────────────

const FORMAT_INSTRUCTIONS: &str = "\
Format the output as a JSON array of objects, each with the string fields \
\"title\" (a short label), \"description\" (one sentence on when it applies) \
and \"content\" (the guidance itself).";

const STRICT_REASK: &str = "\
Your previous reply could not be used. Reply with ONLY a JSON array of objects \
with non-empty string fields \"title\", \"description\" and \"content\". \
No prose, no markdown. Reply with [] if there is nothing worth keeping.";

fn framing(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Success => {
            "The following trajectory succeeded. Distill the key reasoning steps and \
             strategies that would transfer to similar tasks into a few memory items."
        }
        Outcome::Failure => {
            "The following trajectory failed. Analyse what went wrong and distill the \
             lessons into a few memory items, each describing a pitfall and how to \
             avoid or correct it."
        }
        Outcome::Unknown => {
            "The outcome of the following trajectory is undetermined. Distill neutral \
             observations about the approach that may help on similar tasks into a few \
             memory items."
        }
    }
}

fn build_prompt(trajectory: &str, query: &str, outcome: Outcome, max_items: usize) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!(
            "{}\nReturn at most {max_items} items.\n{FORMAT_INSTRUCTIONS}",
            framing(outcome)
        )),
        ChatMessage::user(format!("Query: {query}\n\nTrajectory:\n{trajectory}")),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDistiller
// ─────────────────────────────────────────────────────────────────────────────

/// [`Distiller`] backed by a [`LanguageModel`].
pub struct LlmDistiller {
    model: Arc<dyn LanguageModel>,
    max_items: usize,
}

impl LlmDistiller {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            max_items: DEFAULT_MAX_ITEMS,
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }
}

#[async_trait]
impl Distiller for LlmDistiller {
    async fn distill(
        &self,
        trajectory: &str,
        query: &str,
        outcome: Outcome,
    ) -> Result<Vec<MemoryItem>, BankError> {
        let schema = schema_of::<Vec<MemoryItem>>();
        let mut messages = build_prompt(trajectory, query, outcome, self.max_items);
        let reply = self.model.complete_structured(&messages, &schema).await?;

        let mut items = match parse_items(&reply) {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "distillation reply malformed, re-asking once");
                messages.push(ChatMessage {
                    role: Role::Assistant,
                    content: reply,
                });
                messages.push(ChatMessage::user(STRICT_REASK));
                let retry = self.model.complete_structured(&messages, &schema).await?;
                parse_items(&retry)?
            }
        };

        items.truncate(self.max_items);
        debug!(%outcome, n_items = items.len(), "trajectory distilled");
        Ok(items)
    }
}
