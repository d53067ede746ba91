//! LLM provider abstraction: unary and streaming calls behind one trait.
//!
//! Concrete providers are thin HTTP clients. Everything cross-cutting
//! (rate limiting, bulkheading, circuit breaking, retry, deadlines) lives
//! in [`resilience`], which wraps any provider in the same trait. The
//! registry is built once at startup and read-only afterwards.

pub mod anthropic;
pub mod openai;
pub mod resilience;

use crate::config::{ProviderConfig, ReliabilityConfig, Secrets};
use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

// ── Requests & chunks ────────────────────────────────────────────

/// One fully composed chat call.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A streaming reply fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Emitted once at stream start.
    Metadata { metadata: serde_json::Value },
    Content { content: String },
    Error { error: String },
    /// Terminal on every successful stream.
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// The circuit breaker is open; the upstream was not invoked.
    #[error("provider '{provider}' circuit open")]
    CircuitOpen { provider: String },

    /// All retry attempts failed.
    #[error("provider '{provider}' failed after {attempts} attempts: {last}")]
    RetryExhausted {
        provider: String,
        attempts: u32,
        last: String,
    },

    #[error("provider call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("provider '{0}' has no credentials")]
    MissingCredentials(String),

    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Errors worth another attempt: transient network and 5xx/429.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Strip anything that looks like a credential before an error string is
/// logged or surfaced.
pub fn sanitize_api_error(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for token in message.split_whitespace() {
        let lowered = token.to_ascii_lowercase();
        if lowered.starts_with("sk-")
            || lowered.starts_with("bearer")
            || lowered.contains("api_key=")
            || lowered.contains("key=")
        {
            out.push_str("[redacted]");
        } else {
            out.push_str(token);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}

// ── Provider trait ───────────────────────────────────────────────

/// A registered LLM provider. Implementations are plain HTTP clients;
/// resilience is layered on top by [`resilience::ResilientProvider`].
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Unary call: whole reply or an error.
    async fn invoke(&self, request: &ChatRequest) -> Result<String, ProviderError>;

    /// Streaming call: lazy chunk sequence. A terminal [`StreamChunk::Done`]
    /// is emitted on success, [`StreamChunk::Error`] on failure. Dropping
    /// the stream aborts the in-flight provider call.
    async fn invoke_stream(&self, request: &ChatRequest) -> Result<ChunkStream, ProviderError>;
}

// ── Registry ─────────────────────────────────────────────────────

/// Closed map of providers, built at startup.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_name: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_name: None,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    /// Override the default provider; ignored if the name is unknown.
    pub fn set_default(&mut self, name: &str) {
        if self.providers.contains_key(name) {
            self.default_name = Some(name.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.default_name.as_deref().and_then(|n| self.get(n))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the registry from config: each configured provider is wrapped in
/// the resilience chain; providers without credentials are skipped.
/// The `default` is the configured name when present, otherwise the first
/// provider that registered (config order).
pub fn build_registry(
    configs: &[ProviderConfig],
    secrets: &Secrets,
    reliability: &ReliabilityConfig,
    default_name: Option<&str>,
) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();

    for cfg in configs {
        let Some(api_key) = secrets.provider_key(&cfg.name) else {
            tracing::debug!(provider = %cfg.name, "skipping provider without credentials");
            continue;
        };

        let inner: Arc<dyn Provider> = match cfg.kind.as_str() {
            "anthropic" => Arc::new(anthropic::AnthropicProvider::new(
                cfg.name.clone(),
                cfg.base_url.clone(),
                api_key.to_string(),
                cfg.model.clone(),
            )),
            // "openai" covers every OpenAI-compatible endpoint (OpenRouter,
            // llama.cpp servers, vLLM).
            _ => Arc::new(openai::OpenAiProvider::new(
                cfg.name.clone(),
                cfg.base_url.clone(),
                api_key.to_string(),
                cfg.model.clone(),
            )),
        };

        let resilient = resilience::ResilientProvider::new(inner, reliability);
        registry.register(Arc::new(resilient));
        tracing::info!(provider = %cfg.name, kind = %cfg.kind, "provider registered");
    }

    if let Some(name) = default_name {
        registry.set_default(name);
    }

    registry
}

// ── SSE line buffering ───────────────────────────────────────────

/// Incremental line splitter for server-sent-event bodies. Providers feed
/// raw network chunks in and drain complete lines out; a partial trailing
/// line is kept until its newline arrives.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: String,
}

impl SseLineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
    }

    /// Drain the next complete line, without its newline.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.find('\n')?;
        let mut line: String = self.buf.drain(..=pos).collect();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// `data: …` payload of an SSE line, if it is a data line.
    pub fn data_payload(line: &str) -> Option<&str> {
        line.strip_prefix("data:").map(str::trim_start)
    }
}

/// Adapt a provider's SSE response body into a [`ChunkStream`].
///
/// `parse_line` maps one SSE line to at most one chunk. The stream ends
/// after the first `Done` or `Error`; a body that closes cleanly without a
/// terminal marker still yields `Done`, a transport failure yields `Error`.
pub(crate) fn sse_chunk_stream(
    response: reqwest::Response,
    parse_line: fn(&str) -> Option<StreamChunk>,
) -> ChunkStream {
    use futures_util::StreamExt;

    struct State {
        body: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
        buf: SseLineBuffer,
        pending: std::collections::VecDeque<StreamChunk>,
        finished: bool,
    }

    let state = State {
        body: Box::pin(response.bytes_stream()),
        buf: SseLineBuffer::default(),
        pending: std::collections::VecDeque::new(),
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                if matches!(chunk, StreamChunk::Done | StreamChunk::Error { .. }) {
                    st.finished = true;
                }
                return Some((chunk, st));
            }
            if st.finished {
                return None;
            }

            while let Some(line) = st.buf.next_line() {
                if let Some(chunk) = parse_line(&line) {
                    st.pending.push_back(chunk);
                }
            }
            if !st.pending.is_empty() {
                continue;
            }

            match st.body.next().await {
                Some(Ok(bytes)) => st.buf.push(&bytes),
                Some(Err(e)) => st.pending.push_back(StreamChunk::Error {
                    error: sanitize_api_error(&e.to_string()),
                }),
                None => st.pending.push_back(StreamChunk::Done),
            }
        }
    }))
}
