// SPDX-License-Identifier: MIT
// Copyright (c) 2025 Jason Ish

use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::provider::{
    ConfigOverride, LlmConfig, Message, Provider, Response, Role, Usage, check_request,
    complete_stream, spawn_stream,
};
use crate::sse::SseStream;
use crate::stream::{EventSource, StreamEmitter};

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The messages API requires `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicClient {
    config: LlmConfig,
    http: Client,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<StreamDelta>,
    message: Option<StreamMessage>,
    usage: Option<AnthropicUsage>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

impl AnthropicClient {
    pub(crate) fn new(config: LlmConfig, http: Client) -> Self {
        Self { config, http }
    }
}

/// System messages move to the top-level `system` field.
fn build_request<'a>(
    config: &'a LlmConfig,
    messages: &'a [Message],
    stream: bool,
) -> AnthropicRequest<'a> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    AnthropicRequest {
        model: &config.model,
        messages: messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect(),
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stream,
        temperature: config.temperature,
    }
}

async fn post(
    http: &Client,
    config: &LlmConfig,
    messages: &[Message],
    stream: bool,
) -> Result<reqwest::Response> {
    let url = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));
    let request = build_request(config, messages, stream);

    tracing::info!(
        provider = %config.provider,
        model = %config.model,
        messages = messages.len(),
        stream,
        "Sending chat request"
    );

    let response = http
        .post(&url)
        .header("x-api-key", config.api_key.as_deref().unwrap_or_default())
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&request)
        .send()
        .await?;

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
    let body: AnthropicResponse = response.json().await?;
    let content = body
        .content
        .into_iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text)
        .collect::<String>();
    Ok(Response {
        content,
        finish_reason: body.stop_reason,
        usage: body
            .usage
            .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
    })
}

/// Token counts collected from `message_start` and `message_delta`.
#[derive(Debug, Default)]
struct StreamState {
    text: String,
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    finished: bool,
}

impl StreamState {
    fn usage(&self) -> Option<Usage> {
        let usage = Usage::new(self.input_tokens, self.output_tokens);
        (!usage.is_empty()).then_some(usage)
    }

    /// Apply one data payload. Returns the text fragment it carried, if any.
    fn apply(&mut self, data: &str) -> Result<Option<String>> {
        let event = match serde_json::from_str::<StreamEvent>(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Malformed stream event, passing through as text: {e}");
                self.text.push_str(data);
                return Ok(Some(data.to_string()));
            }
        };

        match event.event_type.as_str() {
            "message_start" => {
                if let Some(u) = event.message.and_then(|m| m.usage) {
                    self.input_tokens = u.input_tokens.or(self.input_tokens);
                    self.output_tokens = u.output_tokens.or(self.output_tokens);
                }
            }
            "content_block_delta" => {
                if let Some(delta) = event.delta
                    && delta.kind.as_deref().is_none_or(|k| k == "text_delta")
                    && let Some(text) = delta.text.filter(|t| !t.is_empty())
                {
                    self.text.push_str(&text);
                    return Ok(Some(text));
                }
            }
            "message_delta" => {
                if let Some(u) = event.usage
                    && u.output_tokens.is_some()
                {
                    self.output_tokens = u.output_tokens;
                }
                if let Some(reason) = event.delta.and_then(|d| d.stop_reason) {
                    tracing::debug!(stop_reason = %reason, "Message delta");
                }
            }
            "message_stop" => self.finished = true,
            "error" => {
                let error = event.error.unwrap_or(ApiError {
                    kind: None,
                    message: None,
                });
                return Err(Error::Other(format!(
                    "{}: {}",
                    error.kind.as_deref().unwrap_or("error"),
                    error.message.as_deref().unwrap_or("unknown stream error")
                )));
            }
            _ => {}
        }
        Ok(None)
    }
}

async fn stream_chat(
    http: &Client,
    config: &LlmConfig,
    messages: &[Message],
    emitter: &StreamEmitter,
) -> Result<(String, Option<Usage>)> {
    let response = post(http, config, messages, true).await?;
    let mut state = StreamState::default();
    let mut sse = SseStream::new(Box::pin(response.bytes_stream()));

    while let Some(event) = sse.next_event().await {
        let event = event?;
        tracing::trace!(event = event.event.as_deref().unwrap_or("message"), "Stream event");
        if let Some(fragment) = state.apply(&event.data)? {
            emitter.data(fragment);
        }
        if state.finished {
            break;
        }
        if emitter.is_closed() {
            tracing::debug!("Stream consumer went away, stopping early");
            break;
        }
    }

    let usage = state.usage();
    Ok((state.text, usage))
}

impl Provider for AnthropicClient {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use crate::provider::test_support::serve_once;
    use crate::stream;

    fn client(base_url: &str, api_key: Option<&str>) -> AnthropicClient {
        AnthropicClient::new(
            LlmConfig {
                provider: ProviderKind::Anthropic,
                model: "claude-test".to_string(),
                max_tokens: None,
                temperature: None,
                api_key: api_key.map(str::to_string),
                base_url: base_url.to_string(),
            },
            Client::new(),
        )
    }

    fn event(name: &str, data: &str) -> String {
        format!("event: {name}\ndata: {data}\n\n")
    }

    #[test]
    fn test_system_messages_move_to_top_level() {
        let c = client("http://x", Some("k"));
        let messages = vec![
            Message::system("be brief"),
            Message::user("hello"),
            Message::assistant("hi"),
            Message::user("again"),
        ];
        let body = serde_json::to_value(build_request(&c.config, &messages, true)).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        let roles: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn test_stream_state_collects_usage() {
        let mut state = StreamState::default();
        state
            .apply(r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":1}}}"#)
            .unwrap();
        let text = state
            .apply(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hey"}}"#)
            .unwrap();
        assert_eq!(text.as_deref(), Some("Hey"));
        state
            .apply(r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#)
            .unwrap();
        state.apply(r#"{"type":"message_stop"}"#).unwrap();

        assert!(state.finished);
        assert_eq!(state.usage(), Some(Usage::new(Some(12), Some(9))));
    }

    #[test]
    fn test_stream_state_error_event() {
        let mut state = StreamState::default();
        let err = state
            .apply(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "overloaded_error: Overloaded");
    }

    #[test]
    fn test_stream_state_ignores_non_text_deltas() {
        let mut state = StreamState::default();
        let text = state
            .apply(r#"{"type":"content_block_delta","delta":{"type":"input_json_delta","partial_json":"{}"}}"#)
            .unwrap();
        assert!(text.is_none());
        assert!(state.apply(r#"{"type":"ping"}"#).unwrap().is_none());
        assert_eq!(state.usage(), None);
    }

    #[tokio::test]
    async fn test_stream_end_to_end() {
        let body = [
            event(
                "message_start",
                r#"{"type":"message_start","message":{"usage":{"input_tokens":7}}}"#,
            ),
            event(
                "content_block_delta",
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#,
            ),
            event(
                "content_block_delta",
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":" there"}}"#,
            ),
            event(
                "message_delta",
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
            ),
            event("message_stop", r#"{"type":"message_stop"}"#),
        ]
        .concat();
        let server = serve_once(200, "text/event-stream", body).await;
        let c = client(&server.base_url, Some("ak-test"));

        let mut source = c.send_stream(vec![Message::user("hello")], None);
        let mut fragments = Vec::new();
        let mut done = None;
        while let Some(event) = source.recv().await {
            match event {
                stream::StreamEvent::Data(s) => fragments.push(s),
                stream::StreamEvent::Done { final_text, usage } => done = Some((final_text, usage)),
                stream::StreamEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(fragments, vec!["Hi", " there"]);
        let (final_text, usage) = done.unwrap();
        assert_eq!(final_text, "Hi there");
        assert_eq!(usage, Some(Usage::new(Some(7), Some(2))));

        let request = server.request.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /v1/messages"));
        assert!(request.contains("x-api-key: ak-test"));
        assert!(request.contains("anthropic-version: 2023-06-01"));
    }

    #[tokio::test]
    async fn test_error_event_mid_stream_ends_with_single_error() {
        let body = [
            event(
                "content_block_delta",
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#,
            ),
            event(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            ),
            event(
                "content_block_delta",
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"late"}}"#,
            ),
        ]
        .concat();
        let server = serve_once(200, "text/event-stream", body).await;
        let c = client(&server.base_url, Some("k"));

        let mut source = c.send_stream(vec![Message::user("hello")], None);
        assert!(matches!(
            source.recv().await,
            Some(stream::StreamEvent::Data(s)) if s == "Hi"
        ));
        match source.recv().await {
            Some(stream::StreamEvent::Error(Error::Provider { provider, source: cause })) => {
                assert_eq!(provider, "anthropic");
                assert_eq!(cause.to_string(), "overloaded_error: Overloaded");
            }
            other => panic!("expected provider error, got {other:?}"),
        }
        assert!(source.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_joins_text_blocks() {
        let body = r#"{
            "content":[{"type":"text","text":"Hello"},{"type":"text","text":" world"}],
            "stop_reason":"end_turn",
            "usage":{"input_tokens":3,"output_tokens":2}
        }"#;
        let server = serve_once(200, "application/json", body.to_string()).await;
        let c = client(&server.base_url, Some("k"));

        let response = c.send(&[Message::user("hi")], None).await.unwrap();
        assert_eq!(response.content, "Hello world");
        assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
        assert_eq!(response.usage.and_then(|u| u.total_tokens), Some(5));
    }

    #[tokio::test]
    async fn test_unavailable_client_emits_single_error() {
        let c = client("http://127.0.0.1:9", None);
        let mut source = c.send_stream(vec![Message::user("hello")], None);
        assert!(matches!(
            source.recv().await,
            Some(stream::StreamEvent::Error(Error::ProviderUnavailable(_)))
        ));
        assert!(source.recv().await.is_none());
    }
}
