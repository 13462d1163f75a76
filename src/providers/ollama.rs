//! Ollama-style local adapter (spec §5 "Ollama-style local adapter").
//!
//! Talks to the native `/api/chat` JSON-lines endpoint for plain
//! completions, and the OpenAI-compatible `/v1/chat/completions` SSE
//! endpoint when tool streaming is needed. When the native response lacks
//! `tool_calls`, degrades via prompt engineering: inject a system preamble
//! describing tools in `{"tool":"name","arguments":{...}}` form, then parse
//! the assistant's text with a three-strategy extractor. `/api/show` model
//! info is cached in memory per spec's "cached in memory" instruction.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{
    CompletionRequest, FinishReason, LLMResponse, ToolCall, ToolCallFunction, ToolCallType,
    ToolCompletionRequest, Usage,
};
use crate::tools::ToolDefinition;

use super::common::{self, OpenAIRequest, StreamAccumulator};
use super::{ChunkStream, Provider};

const UNARY_TIMEOUT: Duration = Duration::from_secs(120);
const MODEL_INFO_TIMEOUT: Duration = Duration::from_secs(5);
const MODEL_LIST_TIMEOUT: Duration = Duration::from_secs(3);

pub struct OllamaProvider {
    base_url: String,
    http: reqwest::Client,
    model_info_cache: Mutex<HashMap<String, u32>>,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            model_info_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn native_complete(&self, request: &OllamaChatRequest) -> std::result::Result<OllamaChatResponse, ProviderError> {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(UNARY_TIMEOUT)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message: body });
        }

        // Native Ollama streams JSON-lines even for a "complete" call; the
        // final line carries `done: true` with the aggregated message.
        let body = response.text().await?;
        for line in body.lines().rev() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: OllamaChatResponse = serde_json::from_str(line)
                .map_err(|e| ProviderError::Stream(format!("failed to parse ollama response: {e}")))?;
            if parsed.done {
                return Ok(parsed);
            }
        }
        Err(ProviderError::Stream("ollama stream had no done=true line".to_string()))
    }

    /// Discovers a model's context window via `/api/show`, caching the
    /// result in memory for subsequent calls.
    pub async fn model_context_window(&self, model: &str) -> std::result::Result<u32, ProviderError> {
        if let Some(cached) = self.model_info_cache.lock().unwrap().get(model) {
            return Ok(*cached);
        }

        let response = self
            .http
            .post(format!("{}/api/show", self.base_url))
            .timeout(MODEL_INFO_TIMEOUT)
            .json(&serde_json::json!({ "model": model }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(common::max_tokens_for_model(model));
        }

        let parsed: OllamaShowResponse = response.json().await.map_err(ProviderError::Http)?;
        let window = parsed.context_length.unwrap_or_else(|| common::max_tokens_for_model(model));
        self.model_info_cache.lock().unwrap().insert(model.to_string(), window);
        Ok(window)
    }

    fn tool_preamble(tools: &[ToolDefinition]) -> String {
        let descriptions: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {} (arguments schema: {})", t.name, t.description, t.parameters))
            .collect();
        format!(
            "You have access to the following tools:\n{}\n\nTo call a tool, respond with exactly one JSON object of the form {{\"tool\":\"<name>\",\"arguments\":{{...}}}} and nothing else.",
            descriptions.join("\n")
        )
    }
}

/// Extracts a `{"tool": "...", "arguments": {...}}` object from free-form
/// assistant text via three fallback strategies, per spec §5.
pub fn extract_tool_call_from_text(text: &str) -> Option<(String, serde_json::Value)> {
    // Strategy 1: a fenced ```json ... ``` or ``` ... ``` block.
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Some(result) = parse_tool_object(after[..end].trim()) {
                return Some(result);
            }
        }
    }

    // Strategy 2: the whole content is the JSON object.
    if let Some(result) = parse_tool_object(text.trim()) {
        return Some(result);
    }

    // Strategy 3: balanced-brace scan for the first complete `{...}`.
    if let Some(start) = text.find('{') {
        let mut depth = 0i32;
        for (offset, ch) in text[start..].char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + offset + ch.len_utf8()];
                        if let Some(result) = parse_tool_object(candidate) {
                            return Some(result);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    None
}

fn parse_tool_object(candidate: &str) -> Option<(String, serde_json::Value)> {
    let value: serde_json::Value = serde_json::from_str(candidate).ok()?;
    let tool = value.get("tool")?.as_str()?.to_string();
    let arguments = value.get("arguments")?.as_object()?.clone();
    Some((tool, serde_json::Value::Object(arguments)))
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let model = request.model.clone().unwrap_or_default();
        let wire = OllamaChatRequest {
            model: model.clone(),
            messages: request.messages.iter().map(to_ollama_message).collect(),
            stream: false,
            options: OllamaOptions { temperature: request.temperature },
        };
        let response = self.native_complete(&wire).await?;
        let content = response.message.map(|m| m.content).unwrap_or_default();
        Ok(LLMResponse {
            content,
            tool_calls: None,
            usage: Usage::new(response.prompt_eval_count.unwrap_or(0), response.eval_count.unwrap_or(0)),
            model,
            finish_reason: FinishReason::Stop,
            cost: None,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let model = request.model.clone().unwrap_or_default();
        let wire = OllamaChatRequest {
            model,
            messages: request.messages.iter().map(to_ollama_message).collect(),
            stream: true,
            options: OllamaOptions { temperature: request.temperature },
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(UNARY_TIMEOUT)
            .json(&wire)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message: body });
        }

        let stream = response.bytes_stream().filter_map(move |result| async move {
            let bytes = match result {
                Ok(b) => b,
                Err(e) => return Some(Err(ProviderError::Http(e))),
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            let mut last = None;
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<OllamaChatResponse>(line) {
                    Ok(parsed) => last = Some(parsed),
                    Err(e) => return Some(Err(ProviderError::Stream(format!("failed to parse line: {e}")))),
                }
            }
            last.map(|parsed| {
                Ok(crate::message::StreamChunk {
                    content: parsed.message.map(|m| m.content),
                    done: parsed.done,
                    tool_calls: None,
                    tool_call_start: None,
                    usage: if parsed.done {
                        Some(Usage::new(parsed.prompt_eval_count.unwrap_or(0), parsed.eval_count.unwrap_or(0)))
                    } else {
                        None
                    },
                })
            })
        });

        Ok(Box::pin(stream))
    }

    async fn complete_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let model = request.base.model.clone().unwrap_or_default();
        let mut messages: Vec<OllamaMessage> = request.base.messages.iter().map(to_ollama_message).collect();

        let native_tools: Vec<serde_json::Value> =
            request.tools.iter().map(|t| t.to_openai_format()).collect();
        let wire = OllamaChatRequest {
            model: model.clone(),
            messages: messages.clone(),
            stream: false,
            options: OllamaOptions { temperature: request.base.temperature },
        };
        let mut native_request = serde_json::to_value(&wire).map_err(ProviderError::Parse)?;
        native_request["tools"] = serde_json::Value::Array(native_tools);

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .timeout(UNARY_TIMEOUT)
            .json(&native_request)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message: body });
        }

        let body = response.text().await?;
        let parsed: OllamaChatResponse = body
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .and_then(|l| serde_json::from_str(l).ok())
            .ok_or_else(|| ProviderError::Stream("ollama tool response had no content".to_string()))?;

        if let Some(message) = &parsed.message {
            if let Some(native_calls) = &message.tool_calls {
                let tool_calls: Vec<ToolCall> = native_calls
                    .iter()
                    .enumerate()
                    .map(|(i, c)| ToolCall {
                        id: format!("call_{i}"),
                        call_type: ToolCallType::Function,
                        function: ToolCallFunction {
                            name: c.function.name.clone(),
                            arguments: c.function.arguments.to_string(),
                        },
                    })
                    .collect();
                return Ok(LLMResponse {
                    content: message.content.clone(),
                    tool_calls: Some(tool_calls),
                    usage: Usage::new(parsed.prompt_eval_count.unwrap_or(0), parsed.eval_count.unwrap_or(0)),
                    model,
                    finish_reason: FinishReason::ToolCalls,
                    cost: None,
                });
            }
        }

        // Degrade via prompt engineering: inject a tool preamble and retry
        // unary, then parse the assistant's text with the three-strategy
        // extractor.
        messages.insert(0, OllamaMessage {
            role: "system".to_string(),
            content: Self::tool_preamble(&request.tools),
            tool_calls: None,
        });
        let retry_wire = OllamaChatRequest {
            model: model.clone(),
            messages,
            stream: false,
            options: OllamaOptions { temperature: request.base.temperature },
        };
        let retry_response = self.native_complete(&retry_wire).await?;
        let text = retry_response.message.map(|m| m.content).unwrap_or_default();

        match extract_tool_call_from_text(&text) {
            Some((name, arguments)) => Ok(LLMResponse {
                content: String::new(),
                tool_calls: Some(vec![ToolCall {
                    id: "call_0".to_string(),
                    call_type: ToolCallType::Function,
                    function: ToolCallFunction { name, arguments: arguments.to_string() },
                }]),
                usage: Usage::new(
                    retry_response.prompt_eval_count.unwrap_or(0),
                    retry_response.eval_count.unwrap_or(0),
                ),
                model,
                finish_reason: FinishReason::ToolCalls,
                cost: None,
            }),
            None => Ok(LLMResponse {
                content: text,
                tool_calls: None,
                usage: Usage::new(
                    retry_response.prompt_eval_count.unwrap_or(0),
                    retry_response.eval_count.unwrap_or(0),
                ),
                model,
                finish_reason: FinishReason::Stop,
                cost: None,
            }),
        }
    }

    async fn stream_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        // Tool streaming goes through the OpenAI-compatible endpoint
        // (spec §5: "an OpenAI-compatible `/v1/chat/completions` for tool
        // streaming").
        let wire = OpenAIRequest {
            model: request.base.model.clone().unwrap_or_default(),
            messages: request.base.messages.iter().map(common::to_openai_message).collect(),
            stream: true,
            max_tokens: request.base.max_tokens,
            temperature: request.base.temperature,
            tools: Some(request.tools.iter().map(|t| t.to_openai_format()).collect()),
            tool_choice: None,
        };

        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .timeout(UNARY_TIMEOUT)
            .json(&wire)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message: body });
        }

        let sse = common::parse_sse_stream(response);
        let mut accumulator = StreamAccumulator::new();
        let stream = sse.map(move |chunk| chunk.and_then(|c| accumulator.process(c)));
        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let response = self
            .http
            .get(format!("{}/api/tags", self.base_url))
            .timeout(MODEL_LIST_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        #[derive(Deserialize)]
        struct TagsResponse {
            models: Vec<TagEntry>,
        }
        #[derive(Deserialize)]
        struct TagEntry {
            name: String,
        }
        let parsed: TagsResponse = response.json().await.map_err(ProviderError::Http)?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }
}

fn to_ollama_message(message: &crate::message::Message) -> OllamaMessage {
    OllamaMessage {
        role: match message.role {
            crate::message::MessageRole::System => "system",
            crate::message::MessageRole::User => "user",
            crate::message::MessageRole::Assistant => "assistant",
            crate::message::MessageRole::Tool => "tool",
        }
        .to_string(),
        content: message.extract_text(),
        tool_calls: None,
    }
}

#[derive(Debug, Clone, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Clone, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaNativeToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaNativeToolCall {
    function: OllamaNativeFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaNativeFunction {
    name: String,
    arguments: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct OllamaShowResponse {
    #[serde(default)]
    context_length: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tool_call_fenced_json_block() {
        let text = "Sure thing!\n```json\n{\"tool\":\"get_weather\",\"arguments\":{\"city\":\"Paris\"}}\n```";
        let (name, args) = extract_tool_call_from_text(text).unwrap();
        assert_eq!(name, "get_weather");
        assert_eq!(args["city"], "Paris");
    }

    #[test]
    fn test_extract_tool_call_whole_content_json() {
        let text = r#"{"tool":"search","arguments":{"q":"rust"}}"#;
        let (name, args) = extract_tool_call_from_text(text).unwrap();
        assert_eq!(name, "search");
        assert_eq!(args["q"], "rust");
    }

    #[test]
    fn test_extract_tool_call_balanced_brace_scan() {
        let text = "I will call {\"tool\":\"calc\",\"arguments\":{\"expr\":\"2+2\"}} now.";
        let (name, args) = extract_tool_call_from_text(text).unwrap();
        assert_eq!(name, "calc");
        assert_eq!(args["expr"], "2+2");
    }

    #[test]
    fn test_extract_tool_call_none_when_no_json() {
        assert!(extract_tool_call_from_text("just a regular answer").is_none());
    }

    #[test]
    fn test_tool_preamble_lists_every_tool() {
        let tools = vec![
            ToolDefinition::new("a", "does a", serde_json::json!({})),
            ToolDefinition::new("b", "does b", serde_json::json!({})),
        ];
        let preamble = OllamaProvider::tool_preamble(&tools);
        assert!(preamble.contains("a: does a"));
        assert!(preamble.contains("b: does b"));
    }
}
