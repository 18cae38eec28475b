//! Generic HTTP-based LLM provider for OpenAI-compatible APIs.
//!
//! Talks directly to any `/chat/completions` endpoint and wraps each call in
//! a bounded retry loop with exponential backoff and jitter. Failures never
//! propagate: they come back as `<error>` text for the calling context to
//! reason about.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, error, warn};

use solipsism_core::config::schema::LlmConfig;
use solipsism_core::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatMessage, ContentPart,
    ImageUrl, Message, Part, Role,
};

use crate::error::{ProviderError, Result};
use crate::registry::{resolve_model_name, ProviderConfig, ProviderSpec};
use crate::traits::LlmProvider;

/// Text returned when every attempt failed with a transient error.
pub const RETRIES_EXHAUSTED: &str =
    "<error>Failed to get response from LLM after multiple retries.</error>";

// ─────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────

/// Longest sleep between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Bounded retry with exponential backoff.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero still makes one attempt.
    pub max_retries: u32,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Attempt `n` (0-based) is followed by `backoff_factor * 2^n` seconds
    /// of sleep plus up to one second of jitter.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

impl From<&LlmConfig> for RetryPolicy {
    fn from(cfg: &LlmConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            timeout: Duration::from_secs(cfg.timeout_secs),
            backoff_factor: cfg.backoff_factor,
        }
    }
}

impl RetryPolicy {
    /// Number of attempts actually made.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Sleep before the attempt following `attempt`, capped at five minutes.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_factor.max(0.0) * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::try_from_secs_f64(base + jitter)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

// ─────────────────────────────────────────────
// HttpProvider
// ─────────────────────────────────────────────

/// A generic LLM provider that talks to any OpenAI-compatible HTTP API.
pub struct HttpProvider {
    /// HTTP client (shared, connection-pooled).
    client: reqwest::Client,
    /// API base URL (e.g. `"https://api.openai.com/v1"`).
    api_base: String,
    /// API key for Bearer authentication.
    api_key: String,
    /// Model as configured (may carry a routing prefix).
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    /// Extra headers to send with each request.
    extra_headers: HeaderMap,
    spec: &'static ProviderSpec,
    retry: RetryPolicy,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("provider", &self.spec.display_name)
            .finish()
    }
}

impl HttpProvider {
    /// Create a new HttpProvider from a provider config and spec.
    pub fn new(config: &ProviderConfig, spec: &'static ProviderSpec, model: &str) -> Self {
        // config > spec default
        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| spec.default_api_base.to_string());

        let mut extra_headers = HeaderMap::new();
        if let Some(ref headers) = config.extra_headers {
            for (key, value) in headers {
                if let (Ok(name), Ok(val)) = (
                    HeaderName::from_bytes(key.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    extra_headers.insert(name, val);
                } else {
                    warn!("Invalid header: {}={}", key, value);
                }
            }
        }

        HttpProvider {
            client: reqwest::Client::new(),
            api_base,
            api_key: config.api_key.clone(),
            model: model.to_string(),
            temperature: None,
            max_tokens: None,
            extra_headers,
            spec,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the full chat completions URL.
    fn completions_url(&self) -> String {
        let base = self.api_base.trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    /// One request/response round trip.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Option<String>> {
        let request_body = ChatCompletionRequest {
            model: resolve_model_name(&self.model, self.spec),
            messages: messages.to_vec(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .headers(self.extra_headers.clone())
            .timeout(self.retry.timeout)
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(parsed.into_text())
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn generate(&self, history: &[Message]) -> Message {
        let messages = match encode_messages(history).await {
            Ok(m) => m,
            Err(e) => {
                error!(provider = self.spec.display_name, error = %e, "Failed to build request");
                return Message::assistant(non_retryable(&e));
            }
        };

        debug!(
            provider = self.spec.display_name,
            model = %self.model,
            messages = messages.len(),
            "Calling LLM"
        );

        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            match self.complete(&messages).await {
                Ok(Some(text)) => return Message::assistant(text),
                Ok(None) => {
                    warn!(provider = self.spec.display_name, "LLM returned no content");
                    return Message {
                        role: Role::Assistant,
                        parts: Vec::new(),
                    };
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        provider = self.spec.display_name,
                        attempt = attempt + 1,
                        max = attempts,
                        error = %e,
                        "Transient LLM error"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
                Err(e) => {
                    error!(provider = self.spec.display_name, error = %e, "LLM call failed");
                    return Message::assistant(non_retryable(&e));
                }
            }
        }

        error!(provider = self.spec.display_name, "LLM retries exhausted");
        Message::assistant(RETRIES_EXHAUSTED)
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn display_name(&self) -> &str {
        self.spec.display_name
    }
}

fn non_retryable(e: &ProviderError) -> String {
    format!("<error>A non-retryable error occurred: {e}</error>")
}

// ─────────────────────────────────────────────
// Message encoding
// ─────────────────────────────────────────────

/// Convert conversation messages to wire format, reading any attached
/// files. Images become base64 data URLs, anything else is inlined as text.
async fn encode_messages(history: &[Message]) -> Result<Vec<ChatMessage>> {
    let mut out = Vec::with_capacity(history.len());
    for msg in history {
        let has_files = msg.parts.iter().any(|p| matches!(p, Part::File { .. }));
        let content = if has_files {
            let mut parts = Vec::with_capacity(msg.parts.len());
            for part in &msg.parts {
                parts.push(encode_part(part).await?);
            }
            ChatContent::Parts(parts)
        } else {
            let text: Vec<&str> = msg
                .parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.as_str()),
                    Part::File { .. } => None,
                })
                .collect();
            ChatContent::Text(text.join("\n"))
        };
        out.push(ChatMessage {
            role: msg.role,
            content,
        });
    }
    Ok(out)
}

async fn encode_part(part: &Part) -> Result<ContentPart> {
    match part {
        Part::Text { text } => Ok(ContentPart::Text { text: text.clone() }),
        Part::File { path, mime_type } => {
            let attachment_err = |e: std::io::Error| ProviderError::Attachment {
                path: path.clone(),
                reason: e.to_string(),
            };
            if mime_type.starts_with("image/") {
                let data = tokio::fs::read(path).await.map_err(attachment_err)?;
                Ok(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{mime_type};base64,{}", STANDARD.encode(data)),
                    },
                })
            } else {
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(attachment_err)?;
                Ok(ContentPart::Text {
                    text: format!("[file: {path}]\n{text}"),
                })
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::find_by_name;
    use std::collections::HashMap;
    use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn make_config(api_key: &str, api_base: Option<&str>) -> ProviderConfig {
        ProviderConfig {
            api_key: api_key.to_string(),
            api_base: api_base.map(String::from),
            extra_headers: None,
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_secs(5),
            backoff_factor: 0.0,
        }
    }

    fn ok_body(content: &str) -> serde_json::Value {
        serde_json::json!({
            "id": "chatcmpl-test",
            "choices": [{
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }]
        })
    }

    fn provider_for(server: &MockServer, retries: u32) -> HttpProvider {
        let spec = find_by_name("openai").unwrap();
        HttpProvider::new(&make_config("test-key", Some(&server.uri())), spec, "gpt-4o")
            .with_retry(fast_retry(retries))
    }

    // ── Unit tests ──

    #[test]
    fn test_completions_url_trailing_slash() {
        let spec = find_by_name("openai").unwrap();
        let config = make_config("key", Some("https://api.openai.com/v1/"));
        let provider = HttpProvider::new(&config, spec, "gpt-4o");
        assert_eq!(
            provider.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_default_api_base_from_spec() {
        let spec = find_by_name("gemini").unwrap();
        let provider = HttpProvider::new(&make_config("k", None), spec, "gemini-2.5-flash");
        assert_eq!(
            provider.api_base,
            "https://generativelanguage.googleapis.com/v1beta/openai"
        );
    }

    #[test]
    fn test_extra_headers() {
        let spec = find_by_name("openrouter").unwrap();
        let mut headers = HashMap::new();
        headers.insert("HTTP-Referer".to_string(), "https://example.org".to_string());
        let config = ProviderConfig {
            api_key: "key".to_string(),
            api_base: None,
            extra_headers: Some(headers),
        };
        let provider = HttpProvider::new(&config, spec, "anthropic/claude-3");
        assert!(provider.extra_headers.contains_key("http-referer"));
    }

    #[test]
    fn test_retry_delay_grows() {
        let policy = RetryPolicy {
            max_retries: 3,
            timeout: Duration::from_secs(1),
            backoff_factor: 2.0,
        };
        let first = policy.delay(0).as_secs_f64();
        let third = policy.delay(2).as_secs_f64();
        assert!((2.0..3.0).contains(&first));
        assert!((8.0..9.0).contains(&third));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_retries: 3,
            timeout: Duration::from_secs(1),
            backoff_factor: 1.0e300,
        };
        assert_eq!(policy.delay(0), MAX_BACKOFF);
        assert_eq!(policy.delay(u32::MAX), MAX_BACKOFF);

        let tiny = RetryPolicy {
            backoff_factor: 1.0,
            ..policy
        };
        assert_eq!(tiny.delay(60), MAX_BACKOFF);
    }

    #[test]
    fn test_zero_retries_still_attempts_once() {
        assert_eq!(fast_retry(0).attempts(), 1);
        assert_eq!(fast_retry(4).attempts(), 4);
    }

    // ── Integration tests with mock server ──

    #[tokio::test]
    async fn test_generate_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("<wait/>")))
            .mount(&server)
            .await;

        let provider = provider_for(&server, 3);
        let reply = provider.generate(&[Message::user("hello")]).await;

        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.text(), Some("<wait/>"));
    }

    #[tokio::test]
    async fn test_generate_with_zero_retries_makes_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("done")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server, 0);
        let reply = provider.generate(&[Message::user("hello")]).await;
        assert_eq!(reply.text(), Some("done"));
    }

    #[tokio::test]
    async fn test_generate_sends_resolved_model_and_settings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": "gemini-2.5-flash",
                "temperature": 0.2,
                "max_tokens": 512,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("ok")))
            .mount(&server)
            .await;

        let spec = find_by_name("gemini").unwrap();
        let provider = HttpProvider::new(
            &make_config("g-key", Some(&server.uri())),
            spec,
            "gemini/gemini-2.5-flash",
        )
        .with_temperature(0.2)
        .with_max_tokens(512)
        .with_retry(fast_retry(1));

        let reply = provider.generate(&[Message::user("hi")]).await;
        // A body mismatch would 404 and surface as an error
        assert_eq!(reply.text(), Some("ok"));
        assert_eq!(provider.model(), "gemini/gemini-2.5-flash");
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("recovered")))
            .mount(&server)
            .await;

        let provider = provider_for(&server, 3);
        let reply = provider.generate(&[Message::user("hello")]).await;
        assert_eq!(reply.text(), Some("recovered"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server, 3);
        let reply = provider.generate(&[Message::user("hello")]).await;
        let text = reply.text().unwrap();
        assert!(text.starts_with("<error>A non-retryable error occurred:"));
        assert!(text.contains("400"));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let provider = provider_for(&server, 2);
        let reply = provider.generate(&[Message::user("hello")]).await;
        assert_eq!(reply.text(), Some(RETRIES_EXHAUSTED));
    }

    #[tokio::test]
    async fn test_network_error_fails_closed() {
        let spec = find_by_name("openai").unwrap();
        let provider = HttpProvider::new(&make_config("key", Some("http://127.0.0.1:1")), spec, "gpt-4o")
            .with_retry(fast_retry(1));

        let reply = provider.generate(&[Message::user("hello")]).await;
        assert_eq!(reply.text(), Some(RETRIES_EXHAUSTED));
    }

    #[tokio::test]
    async fn test_empty_choices_yield_no_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})))
            .mount(&server)
            .await;

        let provider = provider_for(&server, 1);
        let reply = provider.generate(&[Message::user("hello")]).await;
        assert_eq!(reply.text(), None);
    }

    #[tokio::test]
    async fn test_image_part_sent_as_data_url() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pixel.png");
        std::fs::write(&image, b"Hello").unwrap();

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("data:image/png;base64,SGVsbG8="))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("a pixel")))
            .mount(&server)
            .await;

        let provider = provider_for(&server, 1);
        let msg = Message::user("what is this?").with_file(image.to_string_lossy(), "image/png");
        let reply = provider.generate(&[msg]).await;
        assert_eq!(reply.text(), Some("a pixel"));
    }

    #[tokio::test]
    async fn test_missing_attachment_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("unused")))
            .expect(0)
            .mount(&server)
            .await;

        let provider = provider_for(&server, 3);
        let msg = Message::user("read").with_file("/nonexistent/notes.txt", "text/plain");
        let reply = provider.generate(&[msg]).await;
        let text = reply.text().unwrap();
        assert!(text.contains("non-retryable"));
        assert!(text.contains("/nonexistent/notes.txt"));
    }
}
