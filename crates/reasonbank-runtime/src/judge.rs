//! [`Judge`] – trajectory outcome classification.
//!
//! The LLM judge asks for a structured verdict (`{"verdict": "success"}` or
//! `{"verdict": "failure"}`) and falls back to scanning free text when the
//! model ignores the schema.  A reply with no definitive verdict is
//! [`Outcome::Unknown`], never an error.

use std::sync::Arc;

use async_trait::async_trait;
use reasonbank_types::{BankError, Outcome};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::debug;

use crate::llm_driver::{ChatMessage, LanguageModel, schema_of};

/// Decides whether a trajectory accomplished its query.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, trajectory: &str, query: &str) -> Result<Outcome, BankError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Verdict parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
enum VerdictLabel {
    Success,
    Failure,
}

/// Structured judge reply.
#[derive(Debug, Deserialize, JsonSchema)]
struct Verdict {
    verdict: VerdictLabel,
}

const SUCCESS_WORDS: &[&str] = &["success", "successful", "successfully", "succeeded", "succeeds"];
const FAILURE_WORDS: &[&str] = &["failure", "failed", "fail", "fails", "unsuccessful"];

/// Map a raw judge reply to an [`Outcome`].
///
/// Accepts the structured JSON verdict (optionally inside a markdown code
/// fence).  Otherwise scans the words of the reply: exactly one of the
/// success / failure word families present yields that verdict, anything
/// else is `Unknown`.
pub fn parse_verdict(reply: &str) -> Outcome {
    if let Ok(v) = serde_json::from_str::<Verdict>(strip_code_fence(reply)) {
        return match v.verdict {
            VerdictLabel::Success => Outcome::Success,
            VerdictLabel::Failure => Outcome::Failure,
        };
    }

    let lowered = reply.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .collect();
    let success = words.iter().any(|w| SUCCESS_WORDS.contains(w));
    let failure = words.iter().any(|w| FAILURE_WORDS.contains(w));
    match (success, failure) {
        (true, false) => Outcome::Success,
        (false, true) => Outcome::Failure,
        _ => Outcome::Unknown,
    }
}

/// Strip a surrounding markdown code fence (```` ```json ... ``` ````), if any.
pub(crate) fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmJudge
// ─────────────────────────────────────────────────────────────────────────────

const JUDGE_SYSTEM_PROMPT: &str = "\
You evaluate whether an autonomous agent's trajectory accomplished its task.
Reply with a JSON object of the form {\"verdict\": \"success\"} or {\"verdict\": \"failure\"} and nothing else.";

/// [`Judge`] backed by a [`LanguageModel`].
pub struct LlmJudge {
    model: Arc<dyn LanguageModel>,
}

impl LlmJudge {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn judge(&self, trajectory: &str, query: &str) -> Result<Outcome, BankError> {
        let messages = [
            ChatMessage::system(JUDGE_SYSTEM_PROMPT),
            ChatMessage::user(format!("Query: {query}\n\nTrajectory:\n{trajectory}")),
        ];
        let reply = self
            .model
            .complete_structured(&messages, &schema_of::<Verdict>())
            .await?;
        let outcome = parse_verdict(&reply);
        debug!(model = self.model.model_name(), %outcome, "trajectory judged");
        Ok(outcome)
    }
}
