//! The provider-neutral data model: messages, content blocks, tool calls,
//! and the request/response shapes the router hands to and receives from
//! provider adapters.
//!
//! Adapted from the teacher SDK's `types.rs`, generalized from a single
//! OpenAI-compatible wire format to the provider-neutral shape every adapter
//! translates to and from (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Role of a message sender. System messages are never forwarded in a
/// provider's turn sequence — adapters extract and concatenate them into a
/// dedicated system prompt field (spec §3 invariant c).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A text content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Supported inline image media types (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMediaType {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageMediaType {
    pub fn as_mime(&self) -> &'static str {
        match self {
            ImageMediaType::Png => "image/png",
            ImageMediaType::Jpeg => "image/jpeg",
            ImageMediaType::Gif => "image/gif",
            ImageMediaType::Webp => "image/webp",
        }
    }

    pub fn from_mime(mime: &str) -> Result<Self> {
        match mime {
            "image/png" => Ok(ImageMediaType::Png),
            "image/jpeg" | "image/jpg" => Ok(ImageMediaType::Jpeg),
            "image/gif" => Ok(ImageMediaType::Gif),
            "image/webp" => Ok(ImageMediaType::Webp),
            other => Err(Error::invalid_input(format!(
                "unsupported image media type: {other}"
            ))),
        }
    }
}

/// An image content block: a media type plus base64-encoded payload
/// (spec §3). Providers without vision support strip these (spec §4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    pub media_type: ImageMediaType,
    pub data: String,
}

impl ImageBlock {
    pub fn new(media_type: ImageMediaType, data: impl Into<String>) -> Self {
        Self {
            media_type,
            data: data.into(),
        }
    }
}

/// An assistant-issued request to invoke a named function.
///
/// `function.arguments` is stored as a JSON-encoded *string*, not a parsed
/// value, so that bit-exact re-emission is possible (spec §3, §9 "Dynamic
/// tool JSON").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: ToolCallType,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallType {
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: ToolCallType::Function,
            function: ToolCallFunction {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parses `function.arguments` as JSON, defaulting to an empty object
    /// and logging when the stored string is malformed (spec §4.2).
    pub fn parsed_arguments(&self) -> Value {
        match serde_json::from_str(&self.function.arguments) {
            Ok(v) => v,
            Err(e) => {
                log::warn!(
                    "tool call {} has malformed arguments JSON, defaulting to {{}}: {e}",
                    self.id
                );
                Value::Object(Default::default())
            }
        }
    }
}

/// A single message in a conversation (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
}

impl Message {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ContentBlock::Text(TextBlock::new(text))])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentBlock::Text(TextBlock::new(text))])
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// An assistant message carrying only tool calls may have empty text
    /// content (spec §3 invariant b).
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Vec::new(),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            name: None,
        }
    }

    /// Tool messages must carry a non-empty `tool_call_id` (spec §3
    /// invariant a); this constructor enforces it.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Result<Self> {
        let tool_call_id = tool_call_id.into();
        if tool_call_id.is_empty() {
            return Err(Error::invalid_input("tool_call_id must be non-empty"));
        }
        Ok(Self {
            role: MessageRole::Tool,
            content: vec![ContentBlock::Text(TextBlock::new(content))],
            tool_calls: None,
            tool_call_id: Some(tool_call_id),
            name: None,
        })
    }

    /// Concatenates the text of all text blocks, skipping images — the
    /// "extract text" helper named in spec §3.
    pub fn extract_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text(t) => Some(t.text.as_str()),
                ContentBlock::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Response format the caller wants back (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    JsonObject,
}

/// Tool choice for a `ToolCompletionRequest` (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Function { name: String },
}

/// A task-class label used by cost optimization to pick a cheaper or more
/// capable model (spec §4.1, GLOSSARY "Task class").
pub type TaskClass = String;

/// A unary or streaming completion request (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
            stop_sequences: None,
            response_format: ResponseFormat::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A request that additionally offers the model a set of callable tools
/// (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCompletionRequest {
    #[serde(flatten)]
    pub base: CompletionRequest,
    pub tools: Vec<crate::tools::ToolDefinition>,
    #[serde(default = "default_tool_choice")]
    pub tool_choice: ToolChoice,
}

fn default_tool_choice() -> ToolChoice {
    ToolChoice::Auto
}

impl ToolCompletionRequest {
    pub fn new(base: CompletionRequest, tools: Vec<crate::tools::ToolDefinition>) -> Result<Self> {
        if tools.is_empty() {
            return Err(Error::invalid_input(
                "ToolCompletionRequest requires a non-empty set of tools",
            ));
        }
        Ok(Self {
            base,
            tools,
            tool_choice: ToolChoice::Auto,
        })
    }
}

/// Token usage counts reported by (or estimated for) a completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Normalized terminal condition of a generation (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
}

/// Cost attached to a response by the router (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostResult {
    pub cost_usd: f64,
    pub breakdown: CostBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
}

impl CostResult {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            cost_usd: input + output,
            breakdown: CostBreakdown { input, output },
        }
    }

    pub fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
}

/// A complete, unary response from the router (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Usage,
    pub model: String,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<CostResult>,
}

/// Emitted once, when a tool-use content block begins, before its arguments
/// are known (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallStart {
    pub id: String,
    pub name: String,
}

/// One unit of a streamed response (spec §3).
///
/// Invariants enforced by adapters and the router (not by this type):
/// exactly one chunk in a successful stream has `done = true`, it is the
/// last; `tool_calls` only appears on that final chunk (or an explicit
/// mid-stream notification via `tool_call_start`), carrying fully
/// concatenated argument strings in provider-reported order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_start: Option<ToolCallStart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn final_chunk(tool_calls: Option<Vec<ToolCall>>, usage: Option<Usage>) -> Self {
        Self {
            content: None,
            done: true,
            tool_calls,
            tool_call_start: None,
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_extract_text_skips_images() {
        let msg = Message::new(
            MessageRole::User,
            vec![
                ContentBlock::Text(TextBlock::new("hello ")),
                ContentBlock::Image(ImageBlock::new(ImageMediaType::Png, "aGVsbG8=")),
                ContentBlock::Text(TextBlock::new("world")),
            ],
        );
        assert_eq!(msg.extract_text(), "hello world");
    }

    #[test]
    fn test_tool_result_requires_non_empty_id() {
        assert!(Message::tool_result("", "result").is_err());
        assert!(Message::tool_result("call_1", "result").is_ok());
    }

    #[test]
    fn test_assistant_tool_calls_allows_empty_content() {
        let msg = Message::assistant_tool_calls(vec![ToolCall::new("id1", "search", "{}")]);
        assert!(msg.content.is_empty());
        assert_eq!(msg.tool_calls.unwrap().len(), 1);
    }

    #[test]
    fn test_tool_call_parsed_arguments_roundtrip() {
        let call = ToolCall::new("id1", "ls", r#"{"path":"/tmp"}"#);
        let parsed = call.parsed_arguments();
        assert_eq!(parsed["path"], "/tmp");
    }

    #[test]
    fn test_tool_call_parsed_arguments_malformed_defaults_to_empty_object() {
        let call = ToolCall::new("id1", "ls", "{not json");
        let parsed = call.parsed_arguments();
        assert_eq!(parsed, serde_json::json!({}));
    }

    #[test]
    fn test_cost_result_invariant() {
        let cost = CostResult::new(0.003, 0.015);
        assert!((cost.cost_usd - (cost.breakdown.input + cost.breakdown.output)).abs() < 1e-10);
    }

    #[test]
    fn test_tool_completion_request_requires_tools() {
        let base = CompletionRequest::new(vec![Message::user("hi")]);
        assert!(ToolCompletionRequest::new(base, vec![]).is_err());
    }

    #[test]
    fn test_stream_chunk_final_carries_done_true() {
        let chunk = StreamChunk::final_chunk(None, Some(Usage::new(10, 5)));
        assert!(chunk.done);
        assert_eq!(chunk.usage.unwrap().total_tokens, 15);
    }
}
