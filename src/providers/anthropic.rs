//! Anthropic Messages adapter (spec §5 "Anthropic-style adapter").
//!
//! System prompt is extracted into a top-level `system` parameter. Images
//! become `{type: image, source: {type: base64, media_type, data}}`
//! blocks. `tool_choice = none` is expressed by omitting the field
//! entirely while keeping the tools array (spec §9 Open Question,
//! resolved by spec.md itself: "the reference behaviour is to omit
//! tool_choice and keep tools").

use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{
    CompletionRequest, ContentBlock, FinishReason, LLMResponse, Message, MessageRole, ToolCall,
    ToolCallFunction, ToolCallType, ToolChoice, ToolCompletionRequest, Usage,
};

use super::{ChunkStream, Provider};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    fn split_system(messages: &[Message]) -> (Option<String>, Vec<&Message>) {
        let mut system = String::new();
        let mut rest = Vec::new();
        for message in messages {
            if message.role == MessageRole::System {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&message.extract_text());
            } else {
                rest.push(message);
            }
        }
        (if system.is_empty() { None } else { Some(system) }, rest)
    }

    fn to_wire_message(message: &Message) -> AnthropicMessage {
        let role = match message.role {
            MessageRole::Assistant => "assistant",
            _ => "user",
        }
        .to_string();

        let mut blocks = Vec::new();
        if message.role == MessageRole::Tool {
            blocks.push(AnthropicContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.extract_text(),
            });
        } else {
            for block in &message.content {
                match block {
                    ContentBlock::Text(t) => blocks.push(AnthropicContentBlock::Text { text: t.text.clone() }),
                    ContentBlock::Image(image) => blocks.push(AnthropicContentBlock::Image {
                        source: AnthropicImageSource {
                            source_type: "base64".to_string(),
                            media_type: image.media_type.as_mime().to_string(),
                            data: image.data.clone(),
                        },
                    }),
                }
            }
            if let Some(tool_calls) = &message.tool_calls {
                for call in tool_calls {
                    blocks.push(AnthropicContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: call.parsed_arguments(),
                    });
                }
            }
        }

        AnthropicMessage { role, content: blocks }
    }

    fn build_request(&self, req: &CompletionRequest, tools: Option<&ToolCompletionRequest>, stream: bool) -> AnthropicRequest {
        let (system, rest) = Self::split_system(&req.messages);
        let messages = rest.into_iter().map(Self::to_wire_message).collect();

        let (tool_values, tool_choice) = match tools {
            Some(tc) => {
                let values: Vec<serde_json::Value> = tc
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect();
                let choice = match &tc.tool_choice {
                    ToolChoice::Auto => Some(serde_json::json!({"type": "auto"})),
                    ToolChoice::None => None,
                    ToolChoice::Function { name } => Some(serde_json::json!({"type": "tool", "name": name})),
                };
                (Some(values), choice)
            }
            None => (None, None),
        };

        AnthropicRequest {
            model: req.model.clone().unwrap_or_default(),
            system,
            messages,
            max_tokens: req.max_tokens.unwrap_or(4096),
            temperature: req.temperature,
            stream,
            tools: tool_values,
            tool_choice,
        }
    }

    async fn send(&self, request: &AnthropicRequest) -> std::result::Result<reqwest::Response, ProviderError> {
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message: body });
        }
        Ok(response)
    }

    async fn complete_via_stream(&self, request: &AnthropicRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let response = self.send(request).await?;
        let mut events = parse_anthropic_events(response);
        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut current_tool: Option<(String, String, String)> = None;
        let mut input_tokens = 0u32;
        let mut output_tokens = 0u32;

        while let Some(event) = events.next().await {
            let event = event?;
            match event {
                AnthropicEvent::MessageStart { usage } => {
                    input_tokens = usage.input_tokens;
                }
                AnthropicEvent::ContentBlockStart { block } => {
                    if let AnthropicStartBlock::ToolUse { id, name } = block {
                        current_tool = Some((id, name, String::new()));
                    }
                }
                AnthropicEvent::ContentBlockDelta { delta } => match delta {
                    AnthropicDelta::TextDelta { text: t } => text.push_str(&t),
                    AnthropicDelta::InputJsonDelta { partial_json } => {
                        if let Some((_, _, ref mut buf)) = current_tool {
                            buf.push_str(&partial_json);
                        }
                    }
                },
                AnthropicEvent::ContentBlockStop => {
                    if let Some((id, name, arguments)) = current_tool.take() {
                        tool_calls.push(ToolCall {
                            id,
                            call_type: ToolCallType::Function,
                            function: ToolCallFunction { name, arguments },
                        });
                    }
                }
                AnthropicEvent::MessageDelta { usage } => {
                    output_tokens = usage.output_tokens;
                }
                AnthropicEvent::MessageStop => break,
            }
        }

        let finish_reason = if tool_calls.is_empty() { FinishReason::Stop } else { FinishReason::ToolCalls };

        Ok(LLMResponse {
            content: text,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            usage: Usage::new(input_tokens, output_tokens),
            model: request.model.clone(),
            finish_reason,
            cost: None,
        })
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let wire = self.build_request(request, None, true);
        self.complete_via_stream(&wire).await
    }

    async fn stream(&self, request: &CompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let wire = self.build_request(request, None, true);
        let response = self.send(&wire).await?;
        Ok(anthropic_event_stream_to_chunks(response))
    }

    async fn complete_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let wire = self.build_request(&request.base, Some(request), true);
        self.complete_via_stream(&wire).await
    }

    async fn stream_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let wire = self.build_request(&request.base, Some(request), true);
        let response = self.send(&wire).await?;
        Ok(anthropic_event_stream_to_chunks(response))
    }
}

/// Translates the Anthropic SSE event sequence into [`StreamChunk`]s. Each
/// event maps to zero or one chunks; state (the in-progress tool call,
/// `message_start`'s input token count) is threaded through a `scan`,
/// mirroring the teacher's `client.rs` scan-then-flatten approach for
/// turning a stateful per-chunk aggregator into a flat output stream.
fn anthropic_event_stream_to_chunks(response: reqwest::Response) -> ChunkStream {
    anthropic_events_to_chunks(parse_anthropic_events(response))
}

/// The event-to-chunk translation itself, factored out of
/// [`anthropic_event_stream_to_chunks`] so it can run over any event
/// stream — a live `reqwest::Response` body or, in tests, a canned
/// sequence — without needing a real HTTP round trip.
fn anthropic_events_to_chunks(
    events: impl futures::Stream<Item = std::result::Result<AnthropicEvent, ProviderError>> + Send + 'static,
) -> ChunkStream {
    use crate::message::{StreamChunk, ToolCallStart};

    #[derive(Default)]
    struct State {
        current_tool: Option<(String, String, String)>,
        finished_tool_calls: Vec<ToolCall>,
        input_tokens: u32,
        done: bool,
    }

    let scanned = events.scan(State::default(), |state, event| {
        if state.done {
            return futures::future::ready(None);
        }
        let chunk = match event {
            Err(e) => Err(e),
            Ok(AnthropicEvent::MessageStart { usage }) => {
                state.input_tokens = usage.input_tokens;
                Ok(None)
            }
            Ok(AnthropicEvent::ContentBlockStart { block: AnthropicStartBlock::ToolUse { id, name } }) => {
                state.current_tool = Some((id.clone(), name.clone(), String::new()));
                Ok(Some(StreamChunk {
                    tool_call_start: Some(ToolCallStart { id, name }),
                    ..Default::default()
                }))
            }
            Ok(AnthropicEvent::ContentBlockStart { block: AnthropicStartBlock::Text }) => Ok(None),
            Ok(AnthropicEvent::ContentBlockDelta { delta: AnthropicDelta::TextDelta { text } }) => {
                Ok(Some(StreamChunk::text(text)))
            }
            Ok(AnthropicEvent::ContentBlockDelta { delta: AnthropicDelta::InputJsonDelta { partial_json } }) => {
                if let Some((_, _, ref mut buf)) = state.current_tool {
                    buf.push_str(&partial_json);
                }
                Ok(None)
            }
            Ok(AnthropicEvent::ContentBlockStop) => {
                // Buffer the finished tool call rather than emitting it
                // immediately: it must only surface on the terminal
                // `done: true` chunk (spec §3 StreamChunk invariant (b)).
                if let Some((id, name, arguments)) = state.current_tool.take() {
                    state.finished_tool_calls.push(ToolCall {
                        id,
                        call_type: ToolCallType::Function,
                        function: ToolCallFunction { name, arguments },
                    });
                }
                Ok(None)
            }
            Ok(AnthropicEvent::MessageDelta { usage }) => {
                let tool_calls = if state.finished_tool_calls.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut state.finished_tool_calls))
                };
                Ok(Some(StreamChunk::final_chunk(tool_calls, Some(Usage::new(state.input_tokens, usage.output_tokens)))))
            }
            Ok(AnthropicEvent::MessageStop) => {
                state.done = true;
                Ok(None)
            }
        };
        futures::future::ready(Some(chunk))
    });

    let stream = scanned.filter_map(|item| async move {
        match item {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    });

    Box::pin(stream)
}

fn parse_anthropic_events(
    response: reqwest::Response,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = std::result::Result<AnthropicEvent, ProviderError>> + Send>> {
    let stream = response.bytes_stream().filter_map(move |result| async move {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => return Some(Err(ProviderError::Http(e))),
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                return Some(
                    serde_json::from_str::<AnthropicEvent>(data)
                        .map_err(|e| ProviderError::Stream(format!("failed to parse event: {e}"))),
                );
            }
        }
        None
    });
    Box::pin(stream)
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    Image { source: AnthropicImageSource },
    ToolUse { id: String, name: String, input: serde_json::Value },
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicUsageStart {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct AnthropicUsageDelta {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStartBlock {
    Text,
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum AnthropicDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        #[serde(rename = "message", deserialize_with = "deserialize_message_start_usage")]
        usage: AnthropicUsageStart,
    },
    ContentBlockStart {
        #[serde(rename = "content_block")]
        block: AnthropicStartBlock,
    },
    ContentBlockDelta {
        delta: AnthropicDelta,
    },
    ContentBlockStop,
    MessageDelta {
        usage: AnthropicUsageDelta,
    },
    MessageStop,
}

fn deserialize_message_start_usage<'de, D>(deserializer: D) -> std::result::Result<AnthropicUsageStart, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapper {
        usage: AnthropicUsageStart,
    }
    Wrapper::deserialize(deserializer).map(|w| w.usage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_system_extracts_and_concatenates() {
        let messages = vec![
            Message::system("be helpful"),
            Message::user("hi"),
        ];
        let (system, rest) = AnthropicProvider::split_system(&messages);
        assert_eq!(system.as_deref(), Some("be helpful"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_build_request_tool_choice_none_omits_field_keeps_tools() {
        let provider = AnthropicProvider::with_base_url("key", "http://localhost");
        let base = CompletionRequest::new(vec![Message::user("hi")]).with_model("claude-sonnet-4-20250514");
        let tool = crate::tools::ToolDefinition::new("search", "search", serde_json::json!({}));
        let mut tool_req = ToolCompletionRequest::new(base, vec![tool]).unwrap();
        tool_req.tool_choice = ToolChoice::None;

        let wire = provider.build_request(&tool_req.base, Some(&tool_req), true);
        assert!(wire.tools.is_some());
        assert!(wire.tool_choice.is_none());
    }

    #[test]
    fn test_tool_result_message_maps_to_user_role_with_tool_result_block() {
        let msg = Message::tool_result("call_1", "42").unwrap();
        let wire = AnthropicProvider::to_wire_message(&msg);
        assert_eq!(wire.role, "user");
        match &wire.content[0] {
            AnthropicContentBlock::ToolResult { tool_use_id, content } => {
                assert_eq!(tool_use_id, "call_1");
                assert_eq!(content, "42");
            }
            _ => panic!("expected tool_result block"),
        }
    }

    #[test]
    fn test_parse_anthropic_event_message_start() {
        let raw = r#"{"type":"message_start","message":{"usage":{"input_tokens":42}}}"#;
        let event: AnthropicEvent = serde_json::from_str(raw).unwrap();
        match event {
            AnthropicEvent::MessageStart { usage } => assert_eq!(usage.input_tokens, 42),
            _ => panic!("expected message_start"),
        }
    }

    #[tokio::test]
    async fn test_tool_use_event_sequence_surfaces_tool_calls_only_on_done_chunk() {
        let events: Vec<std::result::Result<AnthropicEvent, ProviderError>> = vec![
            Ok(AnthropicEvent::MessageStart { usage: AnthropicUsageStart { input_tokens: 12 } }),
            Ok(AnthropicEvent::ContentBlockStart {
                block: AnthropicStartBlock::ToolUse { id: "call_1".to_string(), name: "get_weather".to_string() },
            }),
            Ok(AnthropicEvent::ContentBlockDelta {
                delta: AnthropicDelta::InputJsonDelta { partial_json: r#"{"city":"Paris"}"#.to_string() },
            }),
            Ok(AnthropicEvent::ContentBlockStop),
            Ok(AnthropicEvent::MessageDelta { usage: AnthropicUsageDelta { output_tokens: 8 } }),
            Ok(AnthropicEvent::MessageStop),
        ];

        let chunks: Vec<_> = anthropic_events_to_chunks(futures::stream::iter(events))
            .collect()
            .await;
        let chunks: Vec<_> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert!(chunks.iter().filter(|c| !c.done).all(|c| c.tool_calls.is_none()));

        let done_chunks: Vec<_> = chunks.iter().filter(|c| c.done).collect();
        assert_eq!(done_chunks.len(), 1);
        let tool_calls = done_chunks[0].tool_calls.as_ref().expect("tool call on terminal chunk");
        assert_eq!(tool_calls.len(), 1);
        assert_eq!(tool_calls[0].id, "call_1");
        assert_eq!(tool_calls[0].function.name, "get_weather");
        assert_eq!(tool_calls[0].function.arguments, r#"{"city":"Paris"}"#);
    }
}
