use super::models::Usage;
use crate::tools::{ToolCall, ToolDefinition};
use crate::util::truncate_str;
use anyhow::Context;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum length for error content in error messages
const MAX_ERROR_CONTENT_LEN: usize = 200;

/// Rate limit retry configuration
pub const MAX_RETRIES: u32 = 3;
pub const INITIAL_BACKOFF_MS: u64 = 2000; // 2 seconds
pub const BACKOFF_MULTIPLIER: u64 = 2; // Exponential backoff

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Response format configuration for OpenRouter
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<JsonSchemaWrapper>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonSchemaWrapper {
    pub name: String,
    pub strict: bool,
    pub schema: serde_json::Value,
}

impl ResponseFormat {
    /// Schema-constrained structured output.
    pub fn json_schema(name: &str, schema: serde_json::Value) -> Self {
        Self {
            format_type: "json_schema".to_string(),
            json_schema: Some(JsonSchemaWrapper {
                name: name.to_string(),
                strict: true,
                schema,
            }),
        }
    }
}

/// One chat-completion call.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<&'a [ToolDefinition]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Other(String),
}

impl FinishReason {
    fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("stop") | Some("end_turn") => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("tool_calls") | Some("tool_use") => FinishReason::ToolCalls,
            Some(other) => FinishReason::Other(other.to_string()),
            None => FinishReason::Other("none".to_string()),
        }
    }
}

/// What the backend returned for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub id: Option<String>,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Authoritative usage for one response, from the billing endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationCost {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

/// Chat-completion backend.
pub trait ChatBackend: Send + Sync {
    fn chat<'a>(&'a self, request: ChatRequest<'a>) -> BoxFuture<'a, anyhow::Result<ChatReply>>;
}

/// Usage/cost endpoint keyed by response id. `None` means unavailable.
pub trait CostSource: Send + Sync {
    fn generation_cost<'a>(&'a self, response_id: &'a str) -> BoxFuture<'a, Option<GenerationCost>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * BACKOFF_MULTIPLIER.pow(attempt.saturating_sub(1)) as u32
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(flatten)]
    request: &'a ChatRequest<'a>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct GenerationResponse {
    #[serde(default)]
    data: Option<GenerationData>,
}

#[derive(Deserialize)]
struct GenerationData {
    #[serde(default)]
    native_tokens_prompt: Option<u64>,
    #[serde(default)]
    native_tokens_completion: Option<u64>,
    #[serde(default)]
    total_cost: Option<f64>,
}

/// Extract retry-after hint from OpenRouter response (if present)
pub fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    let after_retry = &text_lower[pos..];
    after_retry
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

fn convert_response(parsed: ChatResponse) -> anyhow::Result<ChatReply> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No response from model"))?;
    Ok(ChatReply {
        id: parsed.id,
        content: choice.message.content,
        tool_calls: choice.message.tool_calls.unwrap_or_default(),
        finish_reason: FinishReason::from_wire(choice.finish_reason.as_deref()),
        usage: parsed.usage.unwrap_or_default(),
    })
}

/// OpenRouter chat and generation endpoints.
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
    cost_timeout: Duration,
}

impl OpenRouterClient {
    pub fn new(
        api_key: String,
        base_url: &str,
        request_timeout: Duration,
        cost_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client for model backend")?;
        Ok(Self {
            http,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::default(),
            cost_timeout,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn send_chat(&self, request: &ChatRequest<'_>) -> anyhow::Result<ChatReply> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = WireRequest {
            request,
            stream: false,
        };
        let mut retry_count = 0;

        loop {
            let sent = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .header("X-Title", "sift-fanout")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err)
                    if (err.is_connect() || err.is_timeout())
                        && retry_count < self.retry.max_retries =>
                {
                    retry_count += 1;
                    let wait = self.retry.backoff(retry_count);
                    tracing::warn!(
                        model = request.model,
                        error = %err,
                        "Backend request failed; retrying in {:?} (attempt {}/{})",
                        wait,
                        retry_count,
                        self.retry.max_retries
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(err) => {
                    return Err(anyhow::Error::new(err).context("Model backend request failed"))
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .context("Failed to read model backend response")?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to parse OpenRouter response: {}\n{}",
                        e,
                        truncate_str(&text, MAX_ERROR_CONTENT_LEN)
                    )
                })?;
                return convert_response(parsed);
            }

            if status.as_u16() == 429 && retry_count < self.retry.max_retries {
                retry_count += 1;
                let wait = parse_retry_after(&text)
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| self.retry.backoff(retry_count));
                tracing::warn!(
                    model = request.model,
                    "OpenRouter rate limited. Retrying in {:?} (attempt {}/{})",
                    wait,
                    retry_count,
                    self.retry.max_retries
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let detail = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| truncate_str(&text, MAX_ERROR_CONTENT_LEN).to_string());
            let error_msg = match status.as_u16() {
                401 => "Invalid API key (HTTP 401)".to_string(),
                429 => format!(
                    "Rate limited by OpenRouter after {} retries: {}",
                    retry_count, detail
                ),
                500..=599 => format!("OpenRouter server error ({}): {}", status, detail),
                _ => format!("API error {}: {}", status, detail),
            };
            return Err(anyhow::anyhow!("{}", error_msg));
        }
    }

    async fn fetch_generation(&self, response_id: &str) -> Option<GenerationCost> {
        let url = format!("{}/generation", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("id", response_id)])
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.cost_timeout)
            .send()
            .await
            .map_err(|err| {
                tracing::debug!(response_id, error = %err, "Cost lookup request failed");
            })
            .ok()?;

        if response.status() != reqwest::StatusCode::OK {
            tracing::debug!(response_id, status = %response.status(), "Cost lookup unavailable");
            return None;
        }
        let parsed: GenerationResponse = response.json().await.ok()?;
        let data = parsed.data?;
        Some(GenerationCost {
            prompt_tokens: data.native_tokens_prompt,
            completion_tokens: data.native_tokens_completion,
            cost_usd: data.total_cost,
        })
    }
}

impl ChatBackend for OpenRouterClient {
    fn chat<'a>(&'a self, request: ChatRequest<'a>) -> BoxFuture<'a, anyhow::Result<ChatReply>> {
        Box::pin(async move { self.send_chat(&request).await })
    }
}

impl CostSource for OpenRouterClient {
    fn generation_cost<'a>(&'a self, response_id: &'a str) -> BoxFuture<'a, Option<GenerationCost>> {
        Box::pin(self.fetch_generation(response_id))
    }
}
