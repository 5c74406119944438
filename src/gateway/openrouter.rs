//! OpenRouter transport for chat completions.
//!
//! Speaks the OpenAI-compatible `/chat/completions` wire format, so any
//! compatible backend can be targeted by pointing `OPENROUTER_BASE_URL` at it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{ErrorContext, ProviderError};
use super::types::*;

/// One backend that can answer a [`ChatRequest`].
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

const PROVIDER: &str = "openrouter";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// 429s without a usable `Retry-After` header wait this long.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Cap on the response body read from the wire (1 MiB).
const MAX_RESPONSE_BYTES: usize = 1_024 * 1_024;

/// Cap on the summed message characters of one request.
///
/// Judge and synthesis prompts embed every primary output, so this is the
/// guard that trips first when a panel produces very long answers.
const MAX_INPUT_CHARS: usize = 500_000;

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl OpenRouterAdapter {
    /// `OPENROUTER_API_KEY` is required; `OPENROUTER_BASE_URL`,
    /// `OPENROUTER_TIMEOUT_SECONDS`, `OPENROUTER_REFERER` and
    /// `OPENROUTER_APP_TITLE` are optional.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::config("OPENROUTER_API_KEY not set"))?;
        let base_url = std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        let timeout = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(
            api_key,
            base_url,
            timeout,
            std::env::var("OPENROUTER_REFERER").ok(),
            std::env::var("OPENROUTER_APP_TITLE").ok(),
        )
    }

    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::config("API key is not a valid header value"))?;
        headers.insert(AUTHORIZATION, bearer);

        // Attribution headers are optional; unusable values are skipped.
        for (name, value) in [("HTTP-Referer", referer), ("X-Title", app_title)] {
            if let Some(value) = value.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> CompletionBody<'a> {
    fn from_request(req: &'a ChatRequest) -> Self {
        Self {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(ResponseFormat { kind: "json_object" }),
        }
    }
}

#[derive(Deserialize)]
struct CompletionReply {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

impl ChoiceMessage {
    /// Message text, or the first non-empty tool-call arguments when the
    /// model answered through a tool call instead (seen with JSON mode).
    fn into_text(self) -> String {
        match self.content {
            Some(content) if !content.trim().is_empty() => content,
            _ => self
                .tool_calls
                .into_iter()
                .flatten()
                .filter_map(|call| call.function.and_then(|f| f.arguments))
                .find(|args| !args.trim().is_empty())
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct ToolCall {
    function: Option<ToolFunction>,
}

#[derive(Deserialize)]
struct ToolFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    #[serde(default)]
    cost_details: Option<CostDetails>,
}

#[derive(Deserialize)]
struct CostDetails {
    /// USD.
    upstream_inference_cost: Option<f64>,
}

impl Usage {
    fn upstream_cost_nanodollars(&self) -> Option<i64> {
        let usd = self.cost_details.as_ref()?.upstream_inference_cost?;
        Some(((usd * 1e9).round() as i64).max(0))
    }
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl WireError {
    /// Provider codes arrive as strings or bare numbers.
    fn code(&self) -> Option<String> {
        self.code.as_ref().map(|code| match code {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Moderation rejections come back as an error payload, not a status.
    fn is_refusal(&self) -> bool {
        let message = self.message.as_deref().unwrap_or_default().to_ascii_lowercase();
        self.code().is_some_and(|c| c == "content_filter" || c == "moderation")
            || message.contains("flagged")
            || message.contains("refused")
    }
}

// =============================================================================
// Response handling
// =============================================================================

/// Read the body in chunks, failing once it exceeds [`MAX_RESPONSE_BYTES`].
async fn read_capped(mut response: reqwest::Response) -> Result<Vec<u8>, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(ProviderError::provider(
                PROVIDER,
                format!("response exceeds {MAX_RESPONSE_BYTES} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

fn retry_after(headers: &HeaderMap) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Map a non-2xx reply: 429 is a rate limit, 5xx retryable, other 4xx final.
fn status_error(status: StatusCode, wait: Duration, body: &[u8], mut ctx: ErrorContext) -> ProviderError {
    let wire = serde_json::from_slice::<CompletionReply>(body)
        .ok()
        .and_then(|reply| reply.error);
    let message = match &wire {
        Some(error) => {
            if let Some(code) = error.code() {
                ctx = ctx.with_code(code);
            }
            error.message.clone().unwrap_or_default()
        }
        None => format!("HTTP {}", status.as_u16()),
    };

    if status == StatusCode::TOO_MANY_REQUESTS {
        return ProviderError::rate_limited(wait, ctx);
    }
    ProviderError::provider_with_context(PROVIDER, message, status.is_server_error(), ctx)
}

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let input_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if input_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "input of {input_chars} chars exceeds {MAX_INPUT_CHARS}"
            )));
        }

        let start = Instant::now();
        let response = self
            .client
            .post(self.completions_url())
            .json(&CompletionBody::from_request(req))
            .send()
            .await?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let mut ctx = ErrorContext::new().with_status(status.as_u16());
        if let Some(id) = response.headers().get("x-request-id").and_then(|v| v.to_str().ok()) {
            ctx = ctx.with_request_id(id);
        }
        let body = read_capped(response).await?;

        if !status.is_success() {
            let err = status_error(status, wait, &body, ctx);
            debug!(status = status.as_u16(), model = req.model.model_id(), error = %err, "completion rejected");
            return Err(err);
        }

        let reply: CompletionReply = serde_json::from_slice(&body)
            .map_err(|e| ProviderError::malformed(PROVIDER, format!("invalid JSON: {e}")))?;

        if let Some(error) = reply.error {
            let refused = error.is_refusal();
            let message = error.message.unwrap_or_default();
            return Err(if refused {
                ProviderError::refused(message)
            } else {
                ProviderError::provider(PROVIDER, message, false)
            });
        }

        let choice = reply
            .choices
            .and_then(|choices| choices.into_iter().next())
            .ok_or_else(|| ProviderError::malformed(PROVIDER, "no choices in response"))?;
        let content = choice.message.map(ChoiceMessage::into_text).unwrap_or_default();

        let usage = reply.usage;
        Ok(ChatResponse {
            content,
            input_tokens: usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.as_ref().and_then(|u| u.completion_tokens).unwrap_or(0),
            upstream_cost_nanodollars: usage.as_ref().and_then(Usage::upstream_cost_nanodollars),
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let adapter =
            OpenRouterAdapter::with_config("sk-test", "http://localhost:9/v1/", Duration::from_secs(1), None, None)
                .unwrap();
        assert_eq!(adapter.completions_url(), "http://localhost:9/v1/chat/completions");
    }

    #[test]
    fn numeric_error_codes_become_strings() {
        let reply: CompletionReply = serde_json::from_str(r#"{"error":{"message":"x","code":502}}"#).unwrap();
        assert_eq!(reply.error.unwrap().code().as_deref(), Some("502"));
    }

    #[test]
    fn retry_after_header_overrides_default() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Duration::from_secs(7));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), DEFAULT_RETRY_AFTER);
    }

    #[test]
    fn status_errors_classify_retryability() {
        let ctx = ErrorContext::new();
        let server = status_error(StatusCode::BAD_GATEWAY, DEFAULT_RETRY_AFTER, b"not json", ctx.clone());
        assert!(server.is_retryable());
        assert_eq!(server.to_string(), "openrouter error: HTTP 502");

        let client = status_error(
            StatusCode::BAD_REQUEST,
            DEFAULT_RETRY_AFTER,
            br#"{"error":{"message":"bad model","code":"invalid_model"}}"#,
            ctx,
        );
        assert!(!client.is_retryable());
        assert_eq!(
            client.context().and_then(|c| c.provider_code.as_deref()),
            Some("invalid_model")
        );
    }

    #[test]
    fn tool_call_arguments_fill_empty_content() {
        let message: ChoiceMessage = serde_json::from_str(
            r#"{"content": "  ", "tool_calls": [{"function": {"arguments": ""}}, {"function": {"arguments": "{\"a\":1}"}}]}"#,
        )
        .unwrap();
        assert_eq!(message.into_text(), r#"{"a":1}"#);
    }

    #[test]
    fn moderation_payloads_are_refusals() {
        let flagged: WireError =
            serde_json::from_str(r#"{"message": "Input was flagged", "code": 403}"#).unwrap();
        assert!(flagged.is_refusal());
        let filtered: WireError = serde_json::from_str(r#"{"code": "content_filter"}"#).unwrap();
        assert!(filtered.is_refusal());
        let other: WireError = serde_json::from_str(r#"{"message": "overloaded"}"#).unwrap();
        assert!(!other.is_refusal());
    }
}
