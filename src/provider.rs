//! Batch inference provider abstraction.
//!
//! The orchestrator talks to the provider through [`BatchProvider`]: submit a
//! list of requests, poll the batch, then download per-request outcomes once
//! the batch has ended. [`AnthropicBatchProvider`] implements it against the
//! Anthropic Message Batches API.
//!
//! # Error Mapping
//!
//! - HTTP 4xx (except 429) → [`PipelineError::ProviderRejected`]
//! - HTTP 429, 5xx, network errors, undecodable bodies →
//!   [`PipelineError::ProviderUnavailable`]
//! - Missing API key → [`PipelineError::Config`]
//!
//! Nothing here retries. The orchestrator owns the retry policy for status
//! calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::DistillationConfig;
use crate::error::{PipelineError, Result};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model parameters shared by every request of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelParams {
    pub model: String,
    pub max_tokens: u32,
}

/// One document to condense.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Caller-chosen id, echoed back in the outcome. `[A-Za-z0-9_-]{1,64}`.
    pub id: String,
    /// Instruction sent as the system prompt.
    pub system: String,
    /// The document itself.
    pub content: String,
    pub params: ModelParams,
}

/// Opaque provider-side batch id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHandle(pub String);

impl BatchHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    InProgress,
    Canceling,
    Ended,
}

/// Per-request tallies reported while a batch runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchCounts {
    pub processing: u64,
    pub succeeded: u64,
    pub errored: u64,
    pub canceled: u64,
    pub expired: u64,
}

impl BatchCounts {
    /// Requests the provider has finished with, successfully or not.
    pub fn finished(&self) -> u64 {
        self.succeeded + self.errored + self.canceled + self.expired
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatus {
    pub state: BatchState,
    pub counts: BatchCounts,
    /// Where outcomes can be fetched, once the batch has ended.
    pub results_url: Option<String>,
}

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded {
        text: String,
        input_tokens: i64,
        output_tokens: i64,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub id: String,
    pub outcome: Outcome,
}

/// An external batch inference service.
#[async_trait]
pub trait BatchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn submit_batch(&self, requests: Vec<BatchRequest>) -> Result<BatchHandle>;

    async fn batch_status(&self, handle: &BatchHandle) -> Result<BatchStatus>;

    async fn fetch_results(&self, results_url: &str) -> Result<Vec<BatchOutcome>>;
}

// ============ Anthropic Message Batches ============

/// [`BatchProvider`] backed by `POST /v1/messages/batches`.
///
/// The API key is read from the environment once, at construction; a missing
/// key only becomes an error when a request is actually made.
pub struct AnthropicBatchProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl AnthropicBatchProvider {
    pub fn new(config: &DistillationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: std::env::var(&config.api_key_env).ok(),
            api_key_env: config.api_key_env.clone(),
        })
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| PipelineError::Config(format!("{} not set", self.api_key_env)))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder> {
        Ok(self
            .client
            .request(method, url)
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", ANTHROPIC_VERSION))
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    id: String,
    processing_status: String,
    #[serde(default)]
    request_counts: BatchCounts,
    #[serde(default)]
    results_url: Option<String>,
}

impl BatchResponse {
    fn into_status(self) -> Result<BatchStatus> {
        let state = match self.processing_status.as_str() {
            "in_progress" => BatchState::InProgress,
            "canceling" => BatchState::Canceling,
            "ended" => BatchState::Ended,
            other => {
                return Err(PipelineError::ProviderUnavailable(format!(
                    "batch {} reported unknown status '{}'",
                    self.id, other
                )))
            }
        };
        Ok(BatchStatus {
            state,
            counts: self.request_counts,
            results_url: self.results_url,
        })
    }
}

fn unavailable(what: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::ProviderUnavailable(format!("{}: {}", what, e))
}

async fn send(request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
    let response = request.send().await.map_err(|e| unavailable(what, e))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{}: HTTP {}: {}", what, status, body);
    if status.is_client_error() && status.as_u16() != 429 {
        Err(PipelineError::ProviderRejected(message))
    } else {
        Err(PipelineError::ProviderUnavailable(message))
    }
}

#[async_trait]
impl BatchProvider for AnthropicBatchProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn submit_batch(&self, requests: Vec<BatchRequest>) -> Result<BatchHandle> {
        let body = json!({
            "requests": requests
                .iter()
                .map(|r| json!({
                    "custom_id": r.id,
                    "params": {
                        "model": r.params.model,
                        "max_tokens": r.params.max_tokens,
                        "system": r.system,
                        "messages": [{ "role": "user", "content": r.content }],
                    },
                }))
                .collect::<Vec<_>>(),
        });

        let url = format!("{}/v1/messages/batches", self.api_url);
        let response = send(
            self.request(reqwest::Method::POST, &url)?.json(&body),
            "batch submission",
        )
        .await?;
        let batch: BatchResponse = response
            .json()
            .await
            .map_err(|e| unavailable("batch submission", e))?;

        debug!(batch = %batch.id, requests = requests.len(), "submitted batch");
        Ok(BatchHandle(batch.id))
    }

    async fn batch_status(&self, handle: &BatchHandle) -> Result<BatchStatus> {
        let url = format!("{}/v1/messages/batches/{}", self.api_url, handle.as_str());
        let response = send(self.request(reqwest::Method::GET, &url)?, "batch status").await?;
        let batch: BatchResponse = response
            .json()
            .await
            .map_err(|e| unavailable("batch status", e))?;
        batch.into_status()
    }

    async fn fetch_results(&self, results_url: &str) -> Result<Vec<BatchOutcome>> {
        let response = send(
            self.request(reqwest::Method::GET, results_url)?,
            "batch results",
        )
        .await?;
        let body = response
            .text()
            .await
            .map_err(|e| unavailable("batch results", e))?;
        parse_results_jsonl(&body)
    }
}

// ============ Result parsing ============

#[derive(Debug, Deserialize)]
struct ResultLine {
    custom_id: String,
    result: ResultBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ResultBody {
    Succeeded { message: Message },
    Errored { error: serde_json::Value },
    Canceled,
    Expired,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

/// Error payloads nest (`{"type":"error","error":{"message":...}}`); take the
/// innermost message available.
fn error_message(error: &serde_json::Value) -> String {
    let mut current = error;
    let mut message = None;
    loop {
        if let Some(m) = current.get("message").and_then(|m| m.as_str()) {
            message = Some(m.to_string());
        }
        match current.get("error") {
            Some(inner) if inner.is_object() => current = inner,
            _ => break,
        }
    }
    message.unwrap_or_else(|| error.to_string())
}

/// Parse a newline-delimited results body. Blank lines are skipped; any
/// other unparseable line fails the whole fetch.
pub fn parse_results_jsonl(body: &str) -> Result<Vec<BatchOutcome>> {
    let mut outcomes = Vec::new();

    for (n, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: ResultLine = serde_json::from_str(line).map_err(|e| {
            PipelineError::ProviderUnavailable(format!("malformed result line {}: {}", n + 1, e))
        })?;

        let outcome = match parsed.result {
            ResultBody::Succeeded { message } => {
                let text = message
                    .content
                    .into_iter()
                    .find(|b| b.kind == "text")
                    .and_then(|b| b.text);
                match text {
                    Some(text) => Outcome::Succeeded {
                        text,
                        input_tokens: message.usage.input_tokens,
                        output_tokens: message.usage.output_tokens,
                    },
                    None => Outcome::Failed {
                        message: "response contained no text block".to_string(),
                    },
                }
            }
            ResultBody::Errored { error } => Outcome::Failed {
                message: error_message(&error),
            },
            ResultBody::Canceled => Outcome::Failed {
                message: "request canceled".to_string(),
            },
            ResultBody::Expired => Outcome::Failed {
                message: "request expired".to_string(),
            },
        };

        outcomes.push(BatchOutcome {
            id: parsed.custom_id,
            outcome,
        });
    }

    Ok(outcomes)
}
