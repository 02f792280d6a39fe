//! `reasonbank-runtime` – The Memory Lifecycle Engine
//!
//! Turns agent trajectories into reusable memory and feeds that memory back
//! into later tasks.
//!
//! # Modules
//!
//! - [`llm_driver`] – [`LlmDriver`][llm_driver::LlmDriver]: an
//!   OpenAI-compatible chat client for local models such as
//!   [Ollama](https://ollama.com) or hosted endpoints, behind the
//!   [`LanguageModel`][llm_driver::LanguageModel] trait.  Structured replies
//!   are requested by injecting a JSON Schema via `response_format`.
//! - [`judge`] – [`LlmJudge`][judge::LlmJudge]: classifies a trajectory as
//!   success, failure or unknown.
//! - [`distill`] – [`LlmDistiller`][distill::LlmDistiller]: extracts
//!   outcome-aware memory items, re-asking once on malformed output.
//! - [`executor`] – the [`Executor`][executor::Executor] port and the
//!   single-completion [`LlmExecutor`][executor::LlmExecutor].
//! - [`bank`] – [`MemoryBank`][bank::MemoryBank]: judge → distill → embed →
//!   store, and similarity retrieval.
//! - [`matts`] – [`MattsEngine`][matts::MattsEngine]: parallel self-contrast
//!   and sequential self-refinement on top of the bank.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: the global
//!   `tracing` subscriber with an optional OTLP span exporter.

pub mod bank;
pub mod distill;
pub mod executor;
pub mod judge;
pub mod llm_driver;
pub mod matts;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_support;

pub use bank::MemoryBank;
pub use distill::{Distiller, LlmDistiller};
pub use executor::{Executor, ExecutorError, LlmExecutor, format_memories};
pub use judge::{Judge, LlmJudge, parse_verdict};
pub use llm_driver::{ChatMessage, LanguageModel, LlmDriver, LlmError, Role};
pub use matts::{EXECUTOR_FAILURE_MARKER, MattsConfig, MattsEngine};
pub use telemetry::{TracerProviderGuard, init_tracing};
