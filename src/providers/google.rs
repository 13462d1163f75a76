//! Google (Gemini) GenerativeAI adapter (spec §5 "Google (Gemini) adapter").
//!
//! System prompt is a dedicated `systemInstruction` field. Role mapping:
//! assistant maps to `model`. Function calls arrive whole-object per
//! streamed chunk — no argument deltas to accumulate, unlike the OpenAI and
//! Anthropic families.

use async_trait::async_trait;
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{
    CompletionRequest, ContentBlock, FinishReason, LLMResponse, Message, MessageRole, StreamChunk, ToolCall,
    ToolCallFunction, ToolCallType, ToolCompletionRequest, Usage,
};

use super::{ChunkStream, Provider};

pub struct GoogleProvider {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    fn split_system(messages: &[Message]) -> (Option<GoogleSystemInstruction>, Vec<&Message>) {
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
        let instruction = if system.is_empty() {
            None
        } else {
            Some(GoogleSystemInstruction { parts: vec![GooglePart::Text { text: system }] })
        };
        (instruction, rest)
    }

    fn to_wire_content(message: &Message) -> GoogleContent {
        let role = match message.role {
            MessageRole::Assistant => "model",
            _ => "user",
        }
        .to_string();

        let mut parts = Vec::new();
        if message.role == MessageRole::Tool {
            parts.push(GooglePart::FunctionResponse {
                name: message.name.clone().unwrap_or_default(),
                response: serde_json::json!({ "content": message.extract_text() }),
            });
        } else {
            for block in &message.content {
                match block {
                    ContentBlock::Text(t) => parts.push(GooglePart::Text { text: t.text.clone() }),
                    ContentBlock::Image(image) => parts.push(GooglePart::InlineData {
                        inline_data: GoogleInlineData {
                            mime_type: image.media_type.as_mime().to_string(),
                            data: image.data.clone(),
                        },
                    }),
                }
            }
            if let Some(tool_calls) = &message.tool_calls {
                for call in tool_calls {
                    parts.push(GooglePart::FunctionCall {
                        name: call.function.name.clone(),
                        args: call.parsed_arguments(),
                    });
                }
            }
        }

        GoogleContent { role, parts }
    }

    fn build_request(&self, req: &CompletionRequest, tools: Option<&ToolCompletionRequest>) -> GoogleRequest {
        let (system_instruction, rest) = Self::split_system(&req.messages);
        let contents = rest.into_iter().map(Self::to_wire_content).collect();

        let tool_declarations = tools.map(|tc| {
            vec![GoogleToolSet {
                function_declarations: tc
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        })
                    })
                    .collect(),
            }]
        });

        GoogleRequest {
            system_instruction,
            contents,
            tools: tool_declarations,
            generation_config: GoogleGenerationConfig {
                temperature: req.temperature,
                max_output_tokens: req.max_tokens,
            },
        }
    }

    async fn stream_generate(&self, model: &str, request: &GoogleRequest) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );
        let response = self.http.post(&url).json(request).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message: body });
        }
        Ok(response)
    }
}

fn parse_sse_values(
    response: reqwest::Response,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = std::result::Result<GoogleStreamResponse, ProviderError>> + Send>> {
    let stream = response.bytes_stream().filter_map(move |result| async move {
        let bytes = match result {
            Ok(b) => b,
            Err(e) => return Some(Err(ProviderError::Http(e))),
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ") {
                return Some(
                    serde_json::from_str::<GoogleStreamResponse>(data)
                        .map_err(|e| ProviderError::Stream(format!("failed to parse chunk: {e}"))),
                );
            }
        }
        None
    });
    Box::pin(stream)
}

fn response_to_chunk(resp: GoogleStreamResponse) -> StreamChunk {
    let candidate = resp.candidates.into_iter().next();
    let mut content = None;
    let mut tool_calls = Vec::new();
    let mut done = false;

    if let Some(candidate) = candidate {
        done = candidate.finish_reason.is_some();
        for part in candidate.content.parts {
            match part {
                GooglePart::Text { text } => content = Some(content.unwrap_or_default() + &text),
                GooglePart::FunctionCall { name, args } => tool_calls.push(ToolCall {
                    id: format!("call_{name}"),
                    call_type: ToolCallType::Function,
                    function: ToolCallFunction { name, arguments: args.to_string() },
                }),
                _ => {}
            }
        }
    }

    StreamChunk {
        content,
        done,
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_start: None,
        usage: resp.usage_metadata.map(|u| Usage::new(u.prompt_token_count, u.candidates_token_count)),
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let model = request.model.clone().unwrap_or_default();
        let wire = self.build_request(request, None);
        let response = self.stream_generate(&model, &wire).await?;
        let mut stream = parse_sse_values(response);

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = Usage::default();

        while let Some(item) = stream.next().await {
            let chunk = response_to_chunk(item?);
            if let Some(text) = chunk.content {
                content.push_str(&text);
            }
            if let Some(calls) = chunk.tool_calls {
                tool_calls.extend(calls);
            }
            if let Some(u) = chunk.usage {
                usage = u;
            }
        }

        // `response.text()` throws when there is no text content in the
        // original SDK; here the router observes an empty string instead
        // and relies on `finish_reason`/`tool_calls` to distinguish.
        let finish_reason = if tool_calls.is_empty() { FinishReason::Stop } else { FinishReason::ToolCalls };

        Ok(LLMResponse {
            content,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            usage,
            model,
            finish_reason,
            cost: None,
        })
    }

    async fn stream(&self, request: &CompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let model = request.model.clone().unwrap_or_default();
        let wire = self.build_request(request, None);
        let response = self.stream_generate(&model, &wire).await?;
        let stream = parse_sse_values(response).map(|item| item.map(response_to_chunk));
        Ok(Box::pin(stream))
    }

    async fn complete_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let model = request.base.model.clone().unwrap_or_default();
        let wire = self.build_request(&request.base, Some(request));
        let response = self.stream_generate(&model, &wire).await?;
        let mut stream = parse_sse_values(response);

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = Usage::default();

        while let Some(item) = stream.next().await {
            let chunk = response_to_chunk(item?);
            if let Some(text) = chunk.content {
                content.push_str(&text);
            }
            if let Some(calls) = chunk.tool_calls {
                tool_calls.extend(calls);
            }
            if let Some(u) = chunk.usage {
                usage = u;
            }
        }

        let finish_reason = if tool_calls.is_empty() { FinishReason::Stop } else { FinishReason::ToolCalls };

        Ok(LLMResponse {
            content,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            usage,
            model,
            finish_reason,
            cost: None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct GoogleRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GoogleSystemInstruction>,
    contents: Vec<GoogleContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GoogleToolSet>>,
    generation_config: GoogleGenerationConfig,
}

#[derive(Debug, Clone, Serialize)]
struct GoogleGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct GoogleToolSet {
    function_declarations: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct GoogleSystemInstruction {
    parts: Vec<GooglePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GoogleContent {
    role: String,
    parts: Vec<GooglePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GoogleInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum GooglePart {
    Text { text: String },
    InlineData { inline_data: GoogleInlineData },
    FunctionCall { name: String, args: serde_json::Value },
    FunctionResponse { name: String, response: serde_json::Value },
}

#[derive(Debug, Clone, Deserialize)]
struct GoogleStreamResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GoogleUsageMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
struct GoogleCandidate {
    content: GoogleContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GoogleUsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_system_maps_assistant_to_model_role() {
        let messages = vec![Message::system("be terse"), Message::assistant(vec![ContentBlock::Text(crate::message::TextBlock::new("ok"))])];
        let (system, rest) = GoogleProvider::split_system(&messages);
        assert!(system.is_some());
        let content = GoogleProvider::to_wire_content(rest[0]);
        assert_eq!(content.role, "model");
    }

    #[test]
    fn test_response_to_chunk_collects_function_call_whole_object() {
        let resp = GoogleStreamResponse {
            candidates: vec![GoogleCandidate {
                content: GoogleContent {
                    role: "model".to_string(),
                    parts: vec![GooglePart::FunctionCall { name: "get_weather".to_string(), args: serde_json::json!({"city":"Paris"}) }],
                },
                finish_reason: Some("STOP".to_string()),
            }],
            usage_metadata: Some(GoogleUsageMetadata { prompt_token_count: 20, candidates_token_count: 5 }),
        };
        let chunk = response_to_chunk(resp);
        assert!(chunk.done);
        let calls = chunk.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(chunk.usage.unwrap().prompt_tokens, 20);
    }

    #[test]
    fn test_tool_message_maps_to_function_response_part() {
        let mut msg = Message::tool_result("call_1", "72F").unwrap();
        msg.name = Some("get_weather".to_string());
        let content = GoogleProvider::to_wire_content(&msg);
        match &content.parts[0] {
            GooglePart::FunctionResponse { name, .. } => assert_eq!(name, "get_weather"),
            _ => panic!("expected function_response part"),
        }
    }
}
