//! [`LlmDriver`] – OpenAI-compatible LLM interface.
//!
//! Communicates with a model server that exposes an OpenAI-compatible
//! `/v1/chat/completions` endpoint, such as [Ollama](https://ollama.com)
//! (`http://localhost:11434`) or a hosted OpenAI-style API.
//!
//! The judge, the distiller, the executor adapter and parallel-scaling
//! synthesis all talk to the model through the [`LanguageModel`] trait, so
//! tests can substitute a scripted model.
//!
//! # Example
//!
//! ```rust,no_run
//! use reasonbank_runtime::llm_driver::{ChatMessage, LanguageModel, LlmDriver, Role};
//!
//! # async fn demo() -> Result<(), reasonbank_runtime::llm_driver::LlmError> {
//! let driver = LlmDriver::new("http://localhost:11434", "llama3");
//!
//! let messages = vec![
//!     ChatMessage::system("You grade agent trajectories."),
//!     ChatMessage::user("Did this trajectory succeed?"),
//! ];
//!
//! // Requires a running Ollama instance.
//! let reply = driver.complete(&messages).await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use reasonbank_types::BankError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from LLM driver operations.
#[derive(Error, Debug)]
pub enum LlmError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be parsed.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl From<LlmError> for BankError {
    fn from(e: LlmError) -> Self {
        BankError::ModelUnavailable(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message types (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

/// The role of a participant in a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// JSON Schema of `T`, ready for [`LanguageModel::complete_structured`].
pub fn schema_of<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(serde_json::Value::Null)
}

// ─────────────────────────────────────────────────────────────────────────────
// LanguageModel port
// ─────────────────────────────────────────────────────────────────────────────

/// Text-in / text-out model with an optional structured-output contract.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Send `messages` and return the assistant's reply text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;

    /// Like [`complete`](Self::complete) but asks the server to constrain the
    /// reply to `schema`.  Servers without structured-output support may
    /// ignore the hint, so callers still parse defensively.
    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
    ) -> Result<String, LlmError> {
        let _ = schema;
        self.complete(messages).await
    }

    /// Model identifier, for logs.
    fn model_name(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal request / response shapes
// ─────────────────────────────────────────────────────────────────────────────

/// `response_format` field that enforces structured JSON Schema output.
#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaSpec<'a>,
}

#[derive(Serialize)]
struct JsonSchemaSpec<'a> {
    name: &'static str,
    schema: &'a serde_json::Value,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

// ─────────────────────────────────────────────────────────────────────────────
// LlmDriver
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for an OpenAI-compatible chat-completions endpoint.
///
/// Construct once and share (behind an `Arc`) between the judge, distiller
/// and executor.
pub struct LlmDriver {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl LlmDriver {
    /// Create a new driver pointing at `base_url` (e.g. `"http://localhost:11434"`)
    /// and using `model` (e.g. `"llama3"`).
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.  Empty keys are
    /// ignored so a blank config entry means "no auth".
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let key = api_key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        response_format: Option<ResponseFormat<'_>>,
    ) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            response_format,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: ChatResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let reply = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::BadResponse("empty choices array".into()))?;
        debug!(model = %self.model, reply_len = reply.len(), "chat completion received");
        Ok(reply)
    }
}

#[async_trait]
impl LanguageModel for LlmDriver {
    /// # Errors
    ///
    /// Returns [`LlmError::Http`] if the request fails, or
    /// [`LlmError::BadResponse`] if the response shape is unexpected.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        self.send(messages, None).await
    }

    async fn complete_structured(
        &self,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
    ) -> Result<String, LlmError> {
        let format = ResponseFormat {
            kind: "json_schema",
            json_schema: JsonSchemaSpec {
                name: "response",
                schema,
            },
        };
        self.send(messages, Some(format)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
