//! Wire types of the Ollama-compatible API surface.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub(crate) struct ChatRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Message {
    pub role: String,
    pub content: String,
    pub images: Option<Vec<String>>,
}

impl Message {
    pub(crate) fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            images: None,
        }
    }
}

/// One NDJSON frame of a streaming chat response.
#[derive(Debug, Serialize)]
pub(crate) struct ChatResponse {
    pub model: String,
    pub created_at: String,
    pub message: Message,
    pub done: bool,
}

/// Terminal frame: the base response plus timing counters, durations in
/// nanoseconds.
#[derive(Debug, Serialize)]
pub(crate) struct ChatFinalResponse {
    #[serde(flatten)]
    pub response: ChatResponse,
    pub total_duration: i64,
    pub load_duration: i64,
    pub prompt_eval_count: i64,
    pub prompt_eval_duration: i64,
    pub eval_count: i64,
    pub eval_duration: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct TagsResponse {
    pub models: Vec<OllamaModel>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OllamaModel {
    pub name: String,
    pub model: String,
    /// Timestamp string passed through from the serving tool.
    pub modified_at: String,
    pub size: i64,
    pub digest: String,
    pub details: ModelDetails,
}

#[derive(Debug, Default, Serialize)]
pub(crate) struct ModelDetails {
    pub parent_model: String,
    pub format: String,
    pub family: String,
    pub families: Option<Vec<String>>,
    pub parameter_size: String,
    pub quantization_level: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct VersionResponse {
    pub version: &'static str,
}
