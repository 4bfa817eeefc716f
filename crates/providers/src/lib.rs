//! capibara_providers
//!
//! LLM provider transport + pool. Two OpenAI-chat-completions-shaped
//! backends (OpenAI-compatible, Groq-compatible) behind one capability
//! trait, selected by a priority-ordered, lazily health-probed fallback
//! pool with per-provider request/success/failure bookkeeping.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("request timed out")]
    Timeout,
    #[error("no providers available")]
    NoProvidersAvailable,
}

impl ProviderError {
    /// Whether retrying the same provider again is worth attempting:
    /// transient/rate-limit-shaped failures are retryable, malformed
    /// responses and timeouts are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(e) => e
                .status()
                .map(|s| s.as_u16() == 429 || s.is_server_error())
                .unwrap_or(true),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMsg {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReply {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    pub provider_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub stop: Vec<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 2048,
            temperature: 0.2,
            top_p: 1.0,
            stop: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> u32;
    async fn complete(&self, req: &CompletionRequest) -> Result<ProviderReply, ProviderError>;
    async fn health_probe(&self) -> bool;
}

fn chat_completions_body<'a>(model: &'a str, req: &CompletionRequest) -> (ChatCompletionsRequest<'a>,) {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        messages.push(ChatMsg {
            role: "system".into(),
            content: system.clone(),
        });
    }
    messages.push(ChatMsg {
        role: "user".into(),
        content: req.prompt.clone(),
    });
    (ChatCompletionsRequest {
        model,
        messages,
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop.clone(),
    },)
}

#[derive(Debug, Serialize)]
struct ChatCompletionsRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMsg>,
    max_tokens: u64,
    temperature: f64,
    top_p: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

fn parse_chat_completions_response(raw: &Value) -> Result<ProviderReply, ProviderError> {
    let content = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c0| c0.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices[0].message.content".into()))?
        .to_string();

    let finish_reason = raw
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c0| c0.get("finish_reason"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let input_tokens = raw.get("usage").and_then(|u| u.get("prompt_tokens")).and_then(|v| v.as_u64());
    let output_tokens = raw
        .get("usage")
        .and_then(|u| u.get("completion_tokens"))
        .and_then(|v| v.as_u64());
    let provider_request_id = raw.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());

    Ok(ProviderReply {
        content,
        finish_reason,
        usage: Usage { input_tokens, output_tokens },
        provider_request_id,
    })
}

async fn post_chat_completions(
    client: &Client,
    base_url: &str,
    api_key: Option<&str>,
    extra_header: Option<(&str, &str)>,
    model: &str,
    req: &CompletionRequest,
) -> Result<ProviderReply, ProviderError> {
    let url = format!("{}/v1/chat/completions", base_url.trim_end_matches('/'));
    let (body,) = chat_completions_body(model, req);

    let mut builder = client.post(url).json(&body);
    if let Some(key) = api_key {
        if !key.is_empty() {
            builder = builder.bearer_auth(key);
        }
    }
    if let Some((name, value)) = extra_header {
        builder = builder.header(name, value);
    }

    let resp = builder.send().await?;
    let raw: Value = resp.json().await?;
    parse_chat_completions_response(&raw)
}

/// An OpenAI-compatible chat-completions backend (also used for any
/// self-hosted server exposing the same wire shape).
pub struct OpenAICompatProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    priority: u32,
}

impl OpenAICompatProvider {
    pub fn new(base_url: String, api_key: Option<String>, model: String, priority: u32) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
            priority,
        }
    }
}

#[async_trait]
impl Provider for OpenAICompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<ProviderReply, ProviderError> {
        post_chat_completions(&self.client, &self.base_url, self.api_key.as_deref(), None, &self.model, req).await
    }

    async fn health_probe(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let mut builder = self.client.get(url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }
}

/// A Groq-compatible chat-completions backend. Same wire shape as OpenAI's
/// chat-completions endpoint; Groq additionally accepts the key via an
/// `x-api-key` header in some deployments, so both forms are sent.
pub struct GroqCompatProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    priority: u32,
}

impl GroqCompatProvider {
    pub fn new(base_url: String, api_key: Option<String>, model: String, priority: u32) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
            priority,
        }
    }
}

#[async_trait]
impl Provider for GroqCompatProvider {
    fn name(&self) -> &str {
        "groq"
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<ProviderReply, ProviderError> {
        let extra = self.api_key.as_deref().map(|k| ("x-api-key", k));
        post_chat_completions(&self.client, &self.base_url, self.api_key.as_deref(), extra, &self.model, req).await
    }

    async fn health_probe(&self) -> bool {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let mut builder = self.client.get(url);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder.send().await.map(|r| r.status().is_success()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProviderStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub last_used_at: Option<f64>,
    pub health_status: bool,
}

struct Entry {
    provider: Box<dyn Provider>,
    enabled: bool,
    stats: RwLock<ProviderStats>,
}

/// Priority-ordered fallback pool over a set of providers, grounded on
/// the original fallback manager's selection algorithm: try the
/// preferred provider first if healthy, else walk the enabled providers
/// in priority order, freshly probing health_check as each is tried, and
/// stop at the first that answers healthy.
pub struct ProviderPool {
    entries: Vec<Entry>,
    retry_attempts: u32,
    retry_base_delay: Duration,
    call_timeout: Duration,
}

impl ProviderPool {
    pub fn new(providers: Vec<Box<dyn Provider>>) -> Self {
        let entries = providers
            .into_iter()
            .map(|provider| Entry {
                provider,
                enabled: true,
                stats: RwLock::new(ProviderStats {
                    health_status: true,
                    ..Default::default()
                }),
            })
            .collect();
        Self {
            entries,
            retry_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            call_timeout: Duration::from_secs(30),
        }
    }

    fn candidates(&self) -> Vec<&Entry> {
        let mut v: Vec<&Entry> = self.entries.iter().filter(|e| e.enabled).collect();
        v.sort_by_key(|e| e.provider.priority());
        v
    }

    async fn select(&self, preferred: Option<&str>) -> Result<&Entry, ProviderError> {
        if let Some(name) = preferred {
            if let Some(entry) = self.entries.iter().find(|e| e.provider.name() == name && e.enabled) {
                if entry.provider.health_probe().await {
                    entry.stats.write().unwrap().health_status = true;
                    return Ok(entry);
                }
                entry.stats.write().unwrap().health_status = false;
            }
        }

        for entry in self.candidates() {
            if entry.provider.health_probe().await {
                entry.stats.write().unwrap().health_status = true;
                return Ok(entry);
            }
            entry.stats.write().unwrap().health_status = false;
        }

        Err(ProviderError::NoProvidersAvailable)
    }

    fn record(&self, entry: &Entry, success: bool, now: f64) {
        let mut stats = entry.stats.write().unwrap();
        stats.requests += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.last_used_at = Some(now);
    }

    /// Dispatch a completion request through the pool: selects a healthy
    /// provider (by name if `preferred` is given, else by priority),
    /// retries with exponential backoff on retryable failures, and
    /// records per-provider bookkeeping either way.
    ///
    /// Returns the provider's name alongside its reply so callers can
    /// record which backend actually answered.
    pub async fn complete(
        &self,
        req: &CompletionRequest,
        preferred: Option<&str>,
        now: f64,
    ) -> Result<(String, ProviderReply), ProviderError> {
        let entry = self.select(preferred).await?;
        let name = entry.provider.name().to_string();

        let mut attempt = 0;
        loop {
            let result = tokio::time::timeout(self.call_timeout, entry.provider.complete(req))
                .await
                .unwrap_or(Err(ProviderError::Timeout));

            match result {
                Ok(reply) => {
                    self.record(entry, true, now);
                    return Ok((name, reply));
                }
                Err(e) if e.is_retryable() && attempt + 1 < self.retry_attempts => {
                    attempt += 1;
                    tokio::time::sleep(self.retry_base_delay * 2u32.pow(attempt - 1)).await;
                    continue;
                }
                Err(e) => {
                    self.record(entry, false, now);
                    return Err(e);
                }
            }
        }
    }

    pub fn stats(&self) -> Vec<(String, ProviderStats)> {
        self.entries
            .iter()
            .map(|e| (e.provider.name().to_string(), *e.stats.read().unwrap()))
            .collect()
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.provider.name() == name) {
            entry.enabled = enabled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        name: &'static str,
        priority: u32,
        healthy: bool,
        failures_before_success: AtomicU32,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> u32 {
            self.priority
        }
        async fn complete(&self, req: &CompletionRequest) -> Result<ProviderReply, ProviderError> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::InvalidResponse("transient".into()));
            }
            Ok(ProviderReply {
                content: format!("ok from {} for {}", self.name, req.prompt),
                finish_reason: Some("stop".into()),
                usage: Usage::default(),
                provider_request_id: None,
            })
        }
        async fn health_probe(&self) -> bool {
            self.healthy
        }
    }

    #[tokio::test]
    async fn selects_highest_priority_healthy_provider() {
        let pool = ProviderPool::new(vec![
            Box::new(FlakyProvider {
                name: "low",
                priority: 10,
                healthy: true,
                failures_before_success: AtomicU32::new(0),
            }),
            Box::new(FlakyProvider {
                name: "high",
                priority: 1,
                healthy: true,
                failures_before_success: AtomicU32::new(0),
            }),
        ]);

        let (name, _reply) = pool.complete(&CompletionRequest::new("hi"), None, 0.0).await.unwrap();
        assert_eq!(name, "high");
    }

    #[tokio::test]
    async fn falls_back_when_preferred_provider_is_unhealthy() {
        let pool = ProviderPool::new(vec![
            Box::new(FlakyProvider {
                name: "down",
                priority: 1,
                healthy: false,
                failures_before_success: AtomicU32::new(0),
            }),
            Box::new(FlakyProvider {
                name: "up",
                priority: 2,
                healthy: true,
                failures_before_success: AtomicU32::new(0),
            }),
        ]);

        let (name, _) = pool
            .complete(&CompletionRequest::new("hi"), Some("down"), 0.0)
            .await
            .unwrap();
        assert_eq!(name, "up");
    }

    #[tokio::test]
    async fn no_healthy_providers_is_an_error() {
        let pool = ProviderPool::new(vec![Box::new(FlakyProvider {
            name: "down",
            priority: 1,
            healthy: false,
            failures_before_success: AtomicU32::new(0),
        })]);

        let err = pool.complete(&CompletionRequest::new("hi"), None, 0.0).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoProvidersAvailable));
    }

    #[tokio::test]
    async fn bookkeeping_counts_requests_and_successes() {
        let pool = ProviderPool::new(vec![Box::new(FlakyProvider {
            name: "only",
            priority: 1,
            healthy: true,
            failures_before_success: AtomicU32::new(0),
        })]);

        pool.complete(&CompletionRequest::new("hi"), None, 42.0).await.unwrap();
        let stats = pool.stats();
        let (_, s) = stats.iter().find(|(n, _)| n == "only").unwrap();
        assert_eq!(s.requests, 1);
        assert_eq!(s.successes, 1);
        assert_eq!(s.last_used_at, Some(42.0));
    }
}
