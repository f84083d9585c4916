//! LLM completion transport.
//!
//! The pipeline only depends on [`LlmClient`]: a function from prompt text to
//! raw response text. The HTTP implementation supports Ollama, Anthropic, and
//! OpenAI endpoints; retry policy lives here at the transport boundary, never
//! in the grading logic (logical/parse failures go through the repair path
//! instead).

use crate::config::{GradingConfig, LlmConfig, LlmProvider};
use crate::error::{Error, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::json;
use std::time::Duration;

/// LLM completion interface for grading and line rating.
pub trait LlmClient: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Explicit retry policy: max attempts, exponential backoff, and the error
/// classes considered transient. Kept as a value so retry behavior is
/// testable in isolation from business logic.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn from_config(config: &GradingConfig) -> Self {
        Self::new(
            config.max_retries + 1,
            Duration::from_millis(config.backoff_ms),
        )
    }

    /// Execute `op`, retrying transient failures with exponential backoff.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut delay = self.initial_delay;
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tracing::debug!(
                    attempt = attempt + 1,
                    max = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying LLM call"
                );
                std::thread::sleep(delay);
                delay = std::cmp::min(delay * 2, self.max_delay);
            }

            match op() {
                Ok(value) => return Ok(value),
                Err(e) if is_retryable_error(&e) => {
                    tracing::warn!(error = %e, "Transient LLM transport error");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::GradingUnavailable("max retries exceeded".to_string())))
    }
}

/// Transient failures worth retrying: network errors, timeouts, 5xx.
/// Parse/shape problems are never retried here.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::GradingUnavailable(msg) => {
            msg.contains("timeout")
                || msg.contains("timed out")
                || msg.contains("connection")
                || msg.contains("request failed")
                || msg.contains("returned 5")
        }
        _ => false,
    }
}

/// Wrapper that applies a [`RetryPolicy`] to any client.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

impl<C: LlmClient> LlmClient for RetryingClient<C> {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.policy.run(|| self.inner.complete(prompt))
    }
}

/// Create the default HTTP-backed client with retry applied.
pub fn create_client(
    llm: &LlmConfig,
    grading: &GradingConfig,
) -> Result<Box<dyn LlmClient>> {
    let http = HttpLlmClient::new(llm)?;
    Ok(Box::new(RetryingClient::new(
        http,
        RetryPolicy::from_config(grading),
    )))
}

/// HTTP-backed LLM client.
pub struct HttpLlmClient {
    model: String,
    provider: LlmProvider,
    endpoint: String,
    api_key: Option<String>,
    temperature: f32,
    runtime: tokio::runtime::Runtime,
    http: reqwest::Client,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| config.provider.default_endpoint().to_string());
        let api_key = match config.provider {
            LlmProvider::Ollama => None,
            LlmProvider::Claude => config
                .api_key
                .clone()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok()),
            LlmProvider::OpenAI => config
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok()),
        };

        if matches!(config.provider, LlmProvider::Claude | LlmProvider::OpenAI) && api_key.is_none()
        {
            return Err(Error::Config(
                "llm.api_key (or provider env var) is required".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::GradingUnavailable(format!("failed to build tokio runtime: {e}")))?;
        let timeout_secs = config.timeout_secs.max(1);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| Error::GradingUnavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            model: config.model.clone(),
            provider: config.provider,
            endpoint,
            api_key,
            temperature: config.temperature,
            runtime,
            http,
        })
    }
}

impl LlmClient for HttpLlmClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        self.runtime.block_on(async {
            match self.provider {
                LlmProvider::Ollama => {
                    let url = format!("{}/api/generate", self.endpoint.trim_end_matches('/'));
                    let resp = self
                        .http
                        .post(url)
                        .json(&json!({
                            "model": self.model,
                            "prompt": prompt,
                            "stream": false,
                            "format": "json",
                            "options": { "temperature": self.temperature },
                        }))
                        .send()
                        .await
                        .map_err(|e| {
                            Error::GradingUnavailable(format!("ollama request failed: {e}"))
                        })?;
                    let status = resp.status();
                    let body = resp.text().await.map_err(|e| {
                        Error::GradingUnavailable(format!("ollama read body failed: {e}"))
                    })?;
                    if !status.is_success() {
                        return Err(Error::GradingUnavailable(format!(
                            "ollama returned {}: {}",
                            status.as_u16(),
                            body
                        )));
                    }
                    let json: serde_json::Value = serde_json::from_str(&body)?;
                    json.get("response")
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::LlmShape(
                                "ollama response missing string field `response`".to_string(),
                            )
                        })
                }
                LlmProvider::Claude => {
                    let url = format!("{}/v1/messages", self.endpoint.trim_end_matches('/'));
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    headers.insert(
                        "x-api-key",
                        HeaderValue::from_str(self.api_key.as_deref().unwrap_or_default())
                            .map_err(|e| Error::Config(format!("invalid claude api key header: {e}")))?,
                    );
                    headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));

                    let resp = self
                        .http
                        .post(url)
                        .headers(headers)
                        .json(&json!({
                            "model": self.model,
                            "max_tokens": 2048,
                            "temperature": self.temperature,
                            "messages": [{ "role": "user", "content": prompt }],
                        }))
                        .send()
                        .await
                        .map_err(|e| {
                            Error::GradingUnavailable(format!("claude request failed: {e}"))
                        })?;
                    let status = resp.status();
                    let body = resp.text().await.map_err(|e| {
                        Error::GradingUnavailable(format!("claude read body failed: {e}"))
                    })?;
                    if !status.is_success() {
                        return Err(Error::GradingUnavailable(format!(
                            "claude returned {}: {}",
                            status.as_u16(),
                            body
                        )));
                    }
                    let json: serde_json::Value = serde_json::from_str(&body)?;
                    json.get("content")
                        .and_then(|v| v.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|v| v.get("text"))
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::LlmShape("claude response missing content[0].text".to_string())
                        })
                }
                LlmProvider::OpenAI => {
                    let url = format!(
                        "{}/v1/chat/completions",
                        self.endpoint.trim_end_matches('/')
                    );
                    let mut headers = HeaderMap::new();
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                    headers.insert(
                        AUTHORIZATION,
                        HeaderValue::from_str(&format!(
                            "Bearer {}",
                            self.api_key.as_deref().unwrap_or_default()
                        ))
                        .map_err(|e| Error::Config(format!("invalid auth header: {e}")))?,
                    );

                    let resp = self
                        .http
                        .post(url)
                        .headers(headers)
                        .json(&json!({
                            "model": self.model,
                            "temperature": self.temperature,
                            "response_format": { "type": "json_object" },
                            "messages": [{ "role": "user", "content": prompt }],
                        }))
                        .send()
                        .await
                        .map_err(|e| {
                            Error::GradingUnavailable(format!("openai request failed: {e}"))
                        })?;
                    let status = resp.status();
                    let body = resp.text().await.map_err(|e| {
                        Error::GradingUnavailable(format!("openai read body failed: {e}"))
                    })?;
                    if !status.is_success() {
                        return Err(Error::GradingUnavailable(format!(
                            "openai returned {}: {}",
                            status.as_u16(),
                            body
                        )));
                    }
                    let json: serde_json::Value = serde_json::from_str(&body)?;
                    json.get("choices")
                        .and_then(|v| v.as_array())
                        .and_then(|arr| arr.first())
                        .and_then(|v| v.get("message"))
                        .and_then(|v| v.get("content"))
                        .and_then(|v| v.as_str())
                        .map(ToString::to_string)
                        .ok_or_else(|| {
                            Error::LlmShape(
                                "openai response missing choices[0].message.content".to_string(),
                            )
                        })
                }
            }
        })
    }
}
