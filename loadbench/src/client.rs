//! The endpoint seam: request/response types and the [`EndpointClient`] trait.
mod openai;

pub use openai::{ApiFlavor, ClientBuildError, OpenAiClient};

use loadbench_core::ErrorKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: String) -> Self {
        Self {
            role: "user".to_string(),
            content,
        }
    }
}

/// Body of one chat-completions call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(rename = "n", skip_serializing_if = "Option::is_none")]
    pub completions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    /// Estimated prompt size; not sent.
    #[serde(skip)]
    pub context_tokens: u32,
}

/// Asks a streaming endpoint to append a usage chunk before `[DONE]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// What came back from one attempt that reached the server, whatever the status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub status: u16,
    pub latency: Duration,
    pub ttft: Option<Duration>,
    pub generated_tokens: u32,
    /// Prompt tokens as counted by the server, when it reports usage.
    pub prompt_tokens: Option<u32>,
    /// Server backoff hint (`retry-after-ms` / `retry-after`).
    pub retry_after: Option<Duration>,
    /// Deployment utilization in percent.
    pub utilization: Option<f64>,
    /// Model name the endpoint says it served.
    pub model: Option<String>,
    /// Error body of unsuccessful responses.
    pub body: Option<String>,
}

impl CompletionResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The attempt never produced a usable response.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A chat-completions endpoint. Implementations must be cheap to share between workers.
#[trait_variant::make(EndpointClient: Send)]
pub trait LocalEndpointClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, TransportError>;

    /// Round trip to the endpoint without generating anything.
    async fn ping(&self) -> Result<Duration, TransportError>;
}
