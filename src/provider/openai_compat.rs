// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

//! Client for OpenAI-compatible chat completion APIs.
//!
//! Used for OpenAI itself as well as xAI, DeepSeek and Ollama, which all
//! accept the same request shape at `{base_url}/chat/completions`.

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::{
    ConfigOverride, LlmConfig, Message, Provider, ProviderKind, Response, Usage, check_request,
    complete_stream, spawn_stream,
};
use crate::sse::SseStream;
use crate::stream::{EventSource, StreamEmitter};

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    config: LlmConfig,
    http: Client,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Serialize)]
struct OpenAiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunkChoice {
    #[serde(default)]
    delta: Option<OpenAiDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl From<OpenAiUsage> for Usage {
    fn from(u: OpenAiUsage) -> Self {
        let mut usage = Usage::new(u.prompt_tokens, u.completion_tokens);
        if u.total_tokens.is_some() {
            usage.total_tokens = u.total_tokens;
        }
        usage
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletion {
    choices: Vec<OpenAiCompletionChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionChoice {
    message: OpenAiCompletionMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionMessage {
    content: Option<String>,
}

impl OpenAiCompatClient {
    pub(crate) fn new(config: LlmConfig, http: Client) -> Self {
        Self { config, http }
    }
}

fn build_request<'a>(
    config: &'a LlmConfig,
    messages: &'a [Message],
    stream: bool,
) -> OpenAiRequest<'a> {
    OpenAiRequest {
        model: &config.model,
        messages: messages
            .iter()
            .map(|m| OpenAiMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect(),
        stream,
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        // Only OpenAI reports usage on streams when asked to.
        stream_options: (stream && config.provider == ProviderKind::OpenAi)
            .then_some(StreamOptions {
                include_usage: true,
            }),
    }
}

async fn post(
    http: &Client,
    config: &LlmConfig,
    messages: &[Message],
    stream: bool,
) -> Result<reqwest::Response> {
    let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
    let request = build_request(config, messages, stream);

    tracing::info!(
        provider = %config.provider,
        model = %config.model,
        messages = messages.len(),
        stream,
        "Sending chat request"
    );

    let mut builder = http.post(&url).json(&request);
    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        builder = builder.bearer_auth(key);
    }

    let response = builder.send().await?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        tracing::warn!(provider = %config.provider, status, "Chat request failed");
        return Err(Error::Api { status, message });
    }
    Ok(response)
}

async fn execute_chat(http: &Client, config: &LlmConfig, messages: &[Message]) -> Result<Response> {
    let response = post(http, config, messages, false).await?;
    let completion: OpenAiCompletion = response.json().await?;
    let usage = completion.usage.map(Usage::from);
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Other("response contained no choices".to_string()))?;
    Ok(Response {
        content: choice.message.content.unwrap_or_default(),
        finish_reason: choice.finish_reason,
        usage,
    })
}

/// What a single data payload contributes to the stream.
#[derive(Debug, PartialEq)]
enum ChunkUpdate {
    Text(Option<String>, Option<Usage>),
    /// Not a chunk we understand; shown to the user as-is.
    Literal(String),
}

fn parse_chunk(data: &str) -> Result<ChunkUpdate> {
    let chunk = match serde_json::from_str::<OpenAiChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!("Malformed stream chunk, passing through as text: {e}");
            return Ok(ChunkUpdate::Literal(data.to_string()));
        }
    };
    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(Error::Other(message));
    }
    let text = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|t| !t.is_empty());
    Ok(ChunkUpdate::Text(text, chunk.usage.map(Usage::from)))
}

async fn stream_chat(
    http: &Client,
    config: &LlmConfig,
    messages: &[Message],
    emitter: &StreamEmitter,
) -> Result<(String, Option<Usage>)> {
    let response = post(http, config, messages, true).await?;

    let mut full_text = String::new();
    let mut usage = None;
    let mut sse = SseStream::new(Box::pin(response.bytes_stream()));

    while let Some(event) = sse.next_event().await {
        let event = event?;
        if event.is_done() {
            break;
        }
        let fragment = match parse_chunk(&event.data)? {
            ChunkUpdate::Text(text, chunk_usage) => {
                if chunk_usage.is_some() {
                    usage = chunk_usage;
                }
                text
            }
            ChunkUpdate::Literal(text) => Some(text),
        };
        if let Some(fragment) = fragment {
            full_text.push_str(&fragment);
            emitter.data(fragment);
        }
        if emitter.is_closed() {
            tracing::debug!("Stream consumer went away, stopping early");
            break;
        }
    }

    Ok((full_text, usage))
}

impl Provider for OpenAiCompatClient {
    async fn send(
        &self,
        messages: &[Message],
        config_override: Option<&ConfigOverride>,
    ) -> Result<Response> {
        let config = self.config.merged(config_override);
        check_request(&config, messages)?;
        execute_chat(&self.http, &config, messages)
            .await
            .map_err(|e| Error::provider(config.provider.id(), e))
    }

    fn send_stream(
        &self,
        messages: Vec<Message>,
        config_override: Option<&ConfigOverride>,
    ) -> EventSource {
        let http = self.http.clone();
        spawn_stream(
            self.config.merged(config_override),
            messages,
            move |config, messages, emitter| async move {
                let outcome = stream_chat(&http, &config, &messages, &emitter).await;
                complete_stream(emitter, config.provider, outcome);
            },
        )
    }

    fn is_available(&self) -> bool {
        self.config.is_available()
    }
}
