//! Shared wire types and streaming utilities for the OpenAI-compatible
//! family of adapters (OpenAI, OpenRouter, Groq, Together, DeepSeek,
//! Fireworks, Perplexity, Mistral, and Ollama's compatibility endpoint).
//!
//! Adapted directly from the teacher's `types.rs` OpenAI* structs and
//! `utils.rs`'s `ToolCallAggregator`/`parse_sse_stream`, generalized to
//! emit the provider-neutral [`StreamChunk`]/[`ToolCall`] shapes instead of
//! the teacher's `ContentBlock::ToolUse`.

use std::collections::HashMap;
use std::pin::Pin;

use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{
    ContentBlock, FinishReason, ImageBlock, Message, MessageRole, StreamChunk, ToolCall,
    ToolCallFunction, ToolCallStart, ToolCallType, Usage,
};

#[derive(Debug, Clone, Serialize)]
pub struct OpenAIContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "image_url")]
    pub image_url: Option<OpenAIImageUrl>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAIImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OpenAIContent {
    Text(String),
    Parts(Vec<OpenAIContentPart>),
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<OpenAIContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAIToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: OpenAIFunctionCall,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAIFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpenAIRequest {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChunk {
    #[allow(dead_code)]
    pub id: Option<String>,
    pub choices: Vec<OpenAIChoice>,
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIChoice {
    pub delta: OpenAIDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OpenAIDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAIToolCallDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIToolCallDelta {
    pub index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<OpenAIFunctionDelta>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIFunctionDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Converts a provider-neutral [`Message`] into an OpenAI-format wire
/// message. Tool-role messages carry `tool_call_id`; assistant messages
/// with pending tool calls carry `tool_calls`.
pub fn to_openai_message(message: &Message) -> OpenAIMessage {
    let role = match message.role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
    .to_string();

    let has_images = message.content.iter().any(|b| matches!(b, ContentBlock::Image(_)));
    let content = if message.content.is_empty() {
        None
    } else if has_images {
        Some(OpenAIContent::Parts(
            message
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text(t) => OpenAIContentPart {
                        part_type: "text".to_string(),
                        text: Some(t.text.clone()),
                        image_url: None,
                    },
                    ContentBlock::Image(image) => OpenAIContentPart {
                        part_type: "image_url".to_string(),
                        text: None,
                        image_url: Some(OpenAIImageUrl {
                            url: format!("data:{};base64,{}", image.media_type.as_mime(), image.data),
                        }),
                    },
                })
                .collect(),
        ))
    } else {
        Some(OpenAIContent::Text(message.extract_text()))
    };

    let tool_calls = message.tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|call| OpenAIToolCall {
                id: call.id.clone(),
                call_type: "function".to_string(),
                function: OpenAIFunctionCall {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                },
            })
            .collect()
    });

    OpenAIMessage {
        role,
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

pub fn map_finish_reason(raw: &str) -> FinishReason {
    match raw {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Accumulates OpenAI-format streaming deltas into provider-neutral
/// [`StreamChunk`]s, generalizing the teacher's `ToolCallAggregator`
/// (`utils.rs`) to emit [`ToolCall`] instead of `ContentBlock::ToolUse` and
/// to surface every chunk (not only the terminal one).
#[derive(Default)]
pub struct StreamAccumulator {
    tool_calls: HashMap<u32, PartialToolCall>,
}

#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    started: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one chunk, returning the [`StreamChunk`] to surface to the
    /// caller. `tool_call_start` is populated the first time a given index
    /// is seen with both id and name; `tool_calls`/`done`/`usage` populate
    /// only on the terminal chunk (finish_reason present).
    pub fn process(&mut self, chunk: OpenAIChunk) -> std::result::Result<StreamChunk, ProviderError> {
        let usage = chunk.usage.map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));
        let mut content = None;
        let mut tool_call_start = None;
        let mut done = false;
        let mut finished = Vec::new();

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    content = Some(content.unwrap_or_default() + &text);
                }
            }

            if let Some(deltas) = choice.delta.tool_calls {
                for delta in deltas {
                    let entry = self.tool_calls.entry(delta.index).or_default();
                    if let Some(id) = delta.id {
                        entry.id = Some(id);
                    }
                    if let Some(function) = delta.function {
                        if let Some(name) = function.name {
                            entry.name = Some(name);
                        }
                        if let Some(args) = function.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                    if !entry.started {
                        if let (Some(id), Some(name)) = (&entry.id, &entry.name) {
                            tool_call_start = Some(ToolCallStart { id: id.clone(), name: name.clone() });
                            entry.started = true;
                        }
                    }
                }
            }

            if choice.finish_reason.is_some() {
                done = true;
                for (_, partial) in self.tool_calls.drain() {
                    if let (Some(id), Some(name)) = (partial.id, partial.name) {
                        finished.push(ToolCall {
                            id,
                            call_type: ToolCallType::Function,
                            function: ToolCallFunction { name, arguments: partial.arguments },
                        });
                    }
                }
            }
        }

        Ok(StreamChunk {
            content,
            done,
            tool_calls: if finished.is_empty() { None } else { Some(finished) },
            tool_call_start,
            usage,
        })
    }
}

/// Parses a raw SSE HTTP response body into a stream of [`OpenAIChunk`]s,
/// following the exact framing the teacher's `parse_sse_stream` implements
/// (`data: <json>\n\n`, terminated by `data: [DONE]`).
pub fn parse_sse_stream(
    body: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = std::result::Result<OpenAIChunk, ProviderError>> + Send>> {
    let stream = body.bytes_stream().filter_map(move |result| async move {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => return Some(Err(ProviderError::Http(e))),
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();

        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                if data == "[DONE]" {
                    continue;
                }
                return Some(
                    serde_json::from_str::<OpenAIChunk>(data)
                        .map_err(|e| ProviderError::Stream(format!("failed to parse chunk: {e}"))),
                );
            }
        }
        None
    });

    Box::pin(stream)
}

/// Static per-model context window table with a 4096 fallback for unknown
/// chat models (spec §5).
pub fn max_tokens_for_model(model: &str) -> u32 {
    match model {
        "claude-sonnet-4-20250514" | "claude-opus-4-20250514" => 200_000,
        "claude-haiku-4-20250514" => 200_000,
        "gpt-4o" | "gpt-4o-mini" => 128_000,
        "gpt-4" => 8_192,
        "gemini-1.5-pro" => 2_000_000,
        "gemini-1.5-flash" => 1_000_000,
        "deepseek-chat" => 64_000,
        _ => 4_096,
    }
}

#[allow(dead_code)]
pub fn image_block_to_data_url(image: &ImageBlock) -> String {
    format!("data:{};base64,{}", image.media_type.as_mime(), image.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ImageBlock, ImageMediaType, TextBlock};

    fn chunk(content: Option<&str>, finish: Option<&str>) -> OpenAIChunk {
        OpenAIChunk {
            id: None,
            choices: vec![OpenAIChoice {
                delta: OpenAIDelta { content: content.map(String::from), tool_calls: None },
                finish_reason: finish.map(String::from),
            }],
            usage: None,
        }
    }

    #[test]
    fn test_accumulator_text_streaming() {
        let mut acc = StreamAccumulator::new();
        let c1 = acc.process(chunk(Some("Hello"), None)).unwrap();
        assert_eq!(c1.content.as_deref(), Some("Hello"));
        assert!(!c1.done);

        let c2 = acc.process(chunk(Some(" world"), Some("stop"))).unwrap();
        assert_eq!(c2.content.as_deref(), Some(" world"));
        assert!(c2.done);
    }

    #[test]
    fn test_accumulator_tool_call_deltas() {
        let mut acc = StreamAccumulator::new();

        let start = OpenAIChunk {
            id: None,
            choices: vec![OpenAIChoice {
                delta: OpenAIDelta {
                    content: None,
                    tool_calls: Some(vec![OpenAIToolCallDelta {
                        index: 0,
                        id: Some("call_1".into()),
                        function: Some(OpenAIFunctionDelta {
                            name: Some("get_weather".into()),
                            arguments: Some("{\"loc".into()),
                        }),
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
        };
        let r1 = acc.process(start).unwrap();
        assert!(r1.tool_call_start.is_some());
        assert_eq!(r1.tool_call_start.unwrap().name, "get_weather");

        let finish = OpenAIChunk {
            id: None,
            choices: vec![OpenAIChoice {
                delta: OpenAIDelta {
                    content: None,
                    tool_calls: Some(vec![OpenAIToolCallDelta {
                        index: 0,
                        id: None,
                        function: Some(OpenAIFunctionDelta { name: None, arguments: Some("ation\":\"Paris\"}".into()) }),
                    }]),
                },
                finish_reason: Some("tool_calls".into()),
            }],
            usage: Some(OpenAIUsage { prompt_tokens: 10, completion_tokens: 5 }),
        };
        let r2 = acc.process(finish).unwrap();
        assert!(r2.done);
        let calls = r2.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parsed_arguments()["location"], "Paris");
        assert_eq!(r2.usage.unwrap().prompt_tokens, 10);
    }

    #[test]
    fn test_to_openai_message_text_only() {
        let message = Message::user("hi");
        let wire = to_openai_message(&message);
        assert_eq!(wire.role, "user");
        matches!(wire.content, Some(OpenAIContent::Text(ref t)) if t == "hi");
    }

    #[test]
    fn test_to_openai_message_with_image_uses_parts() {
        let message = Message::new(
            MessageRole::User,
            vec![
                ContentBlock::Text(TextBlock::new("what is this")),
                ContentBlock::Image(ImageBlock { media_type: ImageMediaType::Png, data: "AAA".into() }),
            ],
        );
        let wire = to_openai_message(&message);
        match wire.content {
            Some(OpenAIContent::Parts(parts)) => assert_eq!(parts.len(), 2),
            _ => panic!("expected multipart content"),
        }
    }

    #[test]
    fn test_max_tokens_fallback() {
        assert_eq!(max_tokens_for_model("some-unknown-model"), 4096);
        assert_eq!(max_tokens_for_model("gpt-4o"), 128_000);
    }
}
