// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

pub mod anthropic;
pub mod openai_compat;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::stream::{self, EventSource, StreamEmitter};

use anthropic::AnthropicClient;
use openai_compat::OpenAiCompatClient;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            prompt_tokens: None,
            completion_tokens: None,
        }
    }

    pub(crate) fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    #[cfg(test)]
    pub(crate) fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub(crate) fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Token accounting reported by a provider. Any field may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl Usage {
    pub(crate) fn new(prompt_tokens: Option<u32>, completion_tokens: Option<u32>) -> Self {
        let total_tokens = match (prompt_tokens, completion_tokens) {
            (Some(p), Some(c)) => p.checked_add(c),
            _ => None,
        };
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && self.total_tokens.is_none()
    }
}

/// Whole response from a non-streaming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Xai,
    DeepSeek,
    Ollama,
}

impl ProviderKind {
    pub(crate) fn id(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Xai => "xai",
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Ollama => "ollama",
        }
    }

    pub(crate) fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "OpenAI",
            ProviderKind::Anthropic => "Anthropic",
            ProviderKind::Xai => "xAI",
            ProviderKind::DeepSeek => "DeepSeek",
            ProviderKind::Ollama => "Ollama",
        }
    }

    pub(crate) fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Xai => "https://api.x.ai/v1",
            ProviderKind::DeepSeek => "https://api.deepseek.com/v1",
            ProviderKind::Ollama => "http://localhost:11434/v1",
        }
    }

    /// Environment variable checked first for this provider's API key.
    pub(crate) fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Xai => Some("XAI_API_KEY"),
            ProviderKind::DeepSeek => Some("DEEPSEEK_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }

    pub(crate) fn requires_api_key(&self) -> bool {
        self.api_key_env().is_some()
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Resolved settings for one model. Immutable per request.
#[derive(Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub api_key: Option<String>,
    pub base_url: String,
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl LlmConfig {
    /// Apply a request-level override, leaving `self` untouched.
    pub(crate) fn merged(&self, config_override: Option<&ConfigOverride>) -> LlmConfig {
        let mut config = self.clone();
        if let Some(o) = config_override {
            if let Some(model) = &o.model {
                config.model = model.clone();
            }
            if o.max_tokens.is_some() {
                config.max_tokens = o.max_tokens;
            }
            if o.temperature.is_some() {
                config.temperature = o.temperature;
            }
        }
        config
    }

    pub(crate) fn is_available(&self) -> bool {
        !self.provider.requires_api_key() || self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverride {
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// A chat completion backend.
pub trait Provider: Send + Sync {
    /// Send the conversation and wait for the whole response.
    fn send(
        &self,
        messages: &[Message],
        config_override: Option<&ConfigOverride>,
    ) -> impl Future<Output = Result<Response>> + Send;

    /// Start a streaming call. The returned source is connected before any
    /// network work begins.
    fn send_stream(
        &self,
        messages: Vec<Message>,
        config_override: Option<&ConfigOverride>,
    ) -> EventSource;

    /// True if a credential (or no need for one) was configured.
    fn is_available(&self) -> bool;
}

/// Checks shared by every client before a request goes out.
pub(crate) fn check_request(config: &LlmConfig, messages: &[Message]) -> Result<()> {
    if !config.is_available() {
        return Err(Error::ProviderUnavailable(
            config.provider.display_name().to_string(),
        ));
    }
    if messages.is_empty() {
        return Err(Error::InvalidRequest(
            "at least one message is required".to_string(),
        ));
    }
    Ok(())
}

/// Run a streaming request on the runtime and translate its outcome into
/// the terminal event. `run` emits fragments and returns the final text.
pub(crate) fn spawn_stream<F, Fut>(
    config: LlmConfig,
    messages: Vec<Message>,
    run: F,
) -> EventSource
where
    F: FnOnce(LlmConfig, Vec<Message>, StreamEmitter) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (emitter, source) = stream::channel();
    if let Err(e) = check_request(&config, &messages) {
        tracing::warn!(provider = %config.provider, "Refusing stream request: {e}");
        emitter.error(e);
        return source;
    }
    tokio::spawn(run(config, messages, emitter));
    source
}

/// Finish a stream with the outcome of a provider call.
pub(crate) fn complete_stream(
    emitter: StreamEmitter,
    provider: ProviderKind,
    outcome: Result<(String, Option<Usage>)>,
) {
    match outcome {
        Ok((text, usage)) => {
            tracing::info!(
                provider = %provider,
                chars = text.len(),
                ?usage,
                "Stream complete"
            );
            emitter.done(text, usage);
        }
        Err(e) => {
            tracing::warn!(provider = %provider, "Stream failed: {e}");
            emitter.error(Error::provider(provider.id(), e));
        }
    }
}

/// Concrete clients, one per wire protocol.
#[derive(Debug, Clone)]
pub enum ProviderClient {
    OpenAiCompat(OpenAiCompatClient),
    Anthropic(AnthropicClient),
}

impl ProviderClient {
    pub(crate) fn new(config: LlmConfig, http: reqwest::Client) -> Self {
        match config.provider {
            ProviderKind::Anthropic => {
                ProviderClient::Anthropic(AnthropicClient::new(config, http))
            }
            ProviderKind::OpenAi
            | ProviderKind::Xai
            | ProviderKind::DeepSeek
            | ProviderKind::Ollama => {
                ProviderClient::OpenAiCompat(OpenAiCompatClient::new(config, http))
            }
        }
    }
}

impl Provider for ProviderClient {
    async fn send(
        &self,
        messages: &[Message],
        config_override: Option<&ConfigOverride>,
    ) -> Result<Response> {
        match self {
            ProviderClient::OpenAiCompat(c) => c.send(messages, config_override).await,
            ProviderClient::Anthropic(c) => c.send(messages, config_override).await,
        }
    }

    fn send_stream(
        &self,
        messages: Vec<Message>,
        config_override: Option<&ConfigOverride>,
    ) -> EventSource {
        match self {
            ProviderClient::OpenAiCompat(c) => c.send_stream(messages, config_override),
            ProviderClient::Anthropic(c) => c.send_stream(messages, config_override),
        }
    }

    fn is_available(&self) -> bool {
        match self {
            ProviderClient::OpenAiCompat(c) => c.is_available(),
            ProviderClient::Anthropic(c) => c.is_available(),
        }
    }
}

/// Builds clients for named models.
pub trait ClientFactory {
    type Client: Provider + Clone + 'static;

    fn client_for(&self, model_name: &str) -> Result<Self::Client>;

    /// Names accepted by `client_for`, sorted.
    fn model_names(&self) -> Vec<String>;

    /// Map a name or alias typed by the user to a model name.
    fn resolve_model(&self, name: &str) -> Option<String> {
        self.model_names().into_iter().find(|n| n == name)
    }
}

/// Factory backed by the loaded configuration.
pub struct ConfigClientFactory {
    config: Arc<Config>,
    http: reqwest::Client,
}

impl ConfigClientFactory {
    pub(crate) fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

impl ClientFactory for ConfigClientFactory {
    type Client = ProviderClient;

    fn client_for(&self, model_name: &str) -> Result<ProviderClient> {
        let llm = self.config.llm_config(model_name)?;
        if !llm.is_available() {
            tracing::warn!(model = model_name, provider = %llm.provider, "No API key configured");
        }
        Ok(ProviderClient::new(llm, self.http.clone()))
    }

    fn model_names(&self) -> Vec<String> {
        self.config.model_names()
    }

    fn resolve_model(&self, name: &str) -> Option<String> {
        self.config.resolve_model_name(name)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A minimal HTTP server that answers one request with a canned body.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    pub(crate) struct CannedServer {
        pub base_url: String,
        pub request: oneshot::Receiver<String>,
    }

    /// Serve `body` once with the given status and content type. The raw
    /// request (headers and body) is sent back through `request`.
    pub(crate) async fn serve_once(status: u16, content_type: &str, body: String) -> CannedServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let content_type = content_type.to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let _ = tx.send(request);

            let response = format!(
                "HTTP/1.1 {status} OK\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        CannedServer {
            base_url: format!("http://{addr}"),
            request: rx,
        }
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    pub(crate) fn sse(events: &[&str]) -> String {
        events.iter().map(|e| format!("data: {e}\n\n")).collect()
    }
}
