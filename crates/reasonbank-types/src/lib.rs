use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A distilled, reusable unit of reasoning guidance.
///
/// Construct through [`MemoryItem::new`] so the non-empty invariant holds.
/// `title` doubles as a display / dedup key but is not required to be unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MemoryItem {
    /// Short, stable label (e.g. "Check pagination before concluding").
    pub title: String,
    /// One-sentence summary of when the item applies.
    pub description: String,
    /// Free-form guidance text.
    pub content: String,
}

impl MemoryItem {
    /// Build a validated item.  Whitespace-only fields count as empty.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, BankError> {
        let item = Self {
            title: title.into(),
            description: description.into(),
            content: content.into(),
        };
        item.validate()?;
        Ok(item)
    }

    /// Check the non-empty invariant on an item that arrived through
    /// deserialization.
    pub fn validate(&self) -> Result<(), BankError> {
        for (field, value) in [
            ("title", &self.title),
            ("description", &self.description),
            ("content", &self.content),
        ] {
            if value.trim().is_empty() {
                return Err(BankError::InvalidArgument(format!(
                    "memory item field `{field}` must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Verdict on a single trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    /// The judge's reply carried no definitive verdict.
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            "unknown" => Some(Outcome::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted unit: one judged and distilled experience.
///
/// Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// The task text the experience was produced for.
    pub query: String,
    /// Embedding of `query`; the similarity index key.
    pub query_embedding: Vec<f32>,
    /// Raw trajectory text, kept for provenance.
    pub trajectory: String,
    pub outcome: Outcome,
    pub items: Vec<MemoryItem>,
}

impl MemoryRecord {
    /// Construct a new record with a fresh id and the current UTC time.
    pub fn new(
        query: String,
        query_embedding: Vec<f32>,
        trajectory: String,
        outcome: Outcome,
        items: Vec<MemoryItem>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            query,
            query_embedding,
            trajectory,
            outcome,
            items,
        }
    }
}

/// Feedback handed to the executor on a refinement round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefinementContext {
    pub previous_trajectory: String,
    pub previous_outcome: Outcome,
}

/// Transient result of one test-time-scaling invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingResult {
    /// Every attempt, in invocation (parallel) or round (sequential) order.
    pub trajectories: Vec<String>,
    /// Outcome per entry of `trajectories`.
    pub outcomes: Vec<Outcome>,
    /// The selected representative (parallel) or terminal (sequential)
    /// trajectory.
    pub chosen_or_final: String,
    pub chosen_outcome: Outcome,
    /// Every memory item distilled during the invocation.
    pub items: Vec<MemoryItem>,
    /// Optional model-synthesised final answer (parallel scaling only).
    pub synthesized_answer: Option<String>,
}

/// Error taxonomy of the memory engine.
///
/// Infrastructure variants (`EmbeddingUnavailable`, `StoreUnavailable`,
/// `ModelUnavailable`) always propagate to the caller.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BankError {
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Similarity store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Distillation output could not be parsed: {0}")]
    DistillationParse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("All {attempts} trajectory attempts failed")]
    AllTrajectoriesFailed { attempts: usize },

    #[error("Scaling call cancelled before any trajectory completed")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_item_new_accepts_populated_fields() {
        let item = MemoryItem::new("t", "d", "c").unwrap();
        assert_eq!(item.title, "t");
    }

    #[test]
    fn memory_item_new_rejects_blank_field() {
        let err = MemoryItem::new("title", "   ", "content").unwrap_err();
        assert!(
            matches!(&err, BankError::InvalidArgument(msg) if msg.contains("description")),
            "got {err:?}"
        );
    }

    #[test]
    fn validate_catches_deserialized_empty_title() {
        let item: MemoryItem =
            serde_json::from_str(r#"{"title":"","description":"d","content":"c"}"#).unwrap();
        assert!(item.validate().is_err());
    }

    #[test]
    fn outcome_serializes_lowercase() {
        let json = serde_json::to_string(&Outcome::Failure).unwrap();
        assert_eq!(json, "\"failure\"");
        for o in [Outcome::Success, Outcome::Failure, Outcome::Unknown] {
            assert_eq!(Outcome::parse(o.as_str()), Some(o));
        }
        assert_eq!(Outcome::parse("maybe"), None);
    }

    #[test]
    fn memory_record_new_assigns_fresh_ids() {
        let a = MemoryRecord::new("q".into(), vec![1.0], "t".into(), Outcome::Success, vec![]);
        let b = MemoryRecord::new("q".into(), vec![1.0], "t".into(), Outcome::Success, vec![]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn bank_error_display() {
        let err = BankError::AllTrajectoriesFailed { attempts: 4 };
        assert!(err.to_string().contains('4'));
        let err = BankError::StoreUnavailable("disk full".into());
        assert!(err.to_string().contains("disk full"));
    }
}
