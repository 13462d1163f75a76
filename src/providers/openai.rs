//! OpenAI-compatible chat-completions adapter.
//!
//! Parameterized over `base_url`/`api_key`/provider name so a single
//! implementation covers OpenAI, OpenRouter, Groq, Together, DeepSeek,
//! Fireworks, Perplexity, and Mistral — all of which speak the same
//! `/chat/completions` SSE wire protocol (spec §5). Built directly from the
//! teacher's `client.rs`/`utils.rs` request-building and SSE-parsing logic.

use async_trait::async_trait;
use futures::stream::StreamExt;

use crate::error::ProviderError;
use crate::message::{CompletionRequest, FinishReason, LLMResponse, ToolChoice, ToolCompletionRequest, Usage};

use super::common::{self, OpenAIRequest, StreamAccumulator};
use super::{ChunkStream, Provider};

pub struct OpenAiCompatibleProvider {
    name: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    fn build_request(&self, req: &CompletionRequest, tools: Option<&ToolCompletionRequest>, stream: bool) -> OpenAIRequest {
        let messages = req.messages.iter().map(common::to_openai_message).collect();

        let (tool_values, tool_choice) = match tools {
            Some(tc) => {
                let values = tc.tools.iter().map(|t| t.to_openai_format()).collect();
                let choice = match &tc.tool_choice {
                    ToolChoice::Auto => Some(serde_json::json!("auto")),
                    ToolChoice::None => None,
                    ToolChoice::Function { name } => {
                        Some(serde_json::json!({"type": "function", "function": {"name": name}}))
                    }
                };
                (Some(values), choice)
            }
            None => (None, None),
        };

        OpenAIRequest {
            model: req.model.clone().unwrap_or_default(),
            messages,
            stream,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            tools: tool_values,
            tool_choice,
        }
    }

    async fn send(&self, request: &OpenAIRequest) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
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

    /// Buffers the full SSE stream into a single [`LLMResponse`], used for
    /// both `complete` and `complete_with_tools` since this family always
    /// streams on the wire (spec §5, teacher convention).
    async fn complete_buffered(&self, request: &OpenAIRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let response = self.send(request).await?;
        let mut sse = common::parse_sse_stream(response);
        let mut accumulator = StreamAccumulator::new();
        let mut content = String::new();
        let mut tool_calls = None;
        let mut usage = Usage::default();
        let mut finish_reason = FinishReason::Stop;
        let mut saw_finish = false;

        while let Some(chunk) = sse.next().await {
            let chunk = chunk?;
            let stream_chunk = accumulator.process(chunk)?;
            if let Some(text) = stream_chunk.content {
                content.push_str(&text);
            }
            if stream_chunk.done {
                saw_finish = true;
                tool_calls = stream_chunk.tool_calls;
                if let Some(u) = stream_chunk.usage {
                    usage = u;
                }
                finish_reason = if tool_calls.is_some() { FinishReason::ToolCalls } else { FinishReason::Stop };
            }
        }

        if !saw_finish {
            return Err(ProviderError::Stream("stream ended without a finish_reason".to_string()));
        }
        if usage.total_tokens == 0 {
            let prompt_tokens = request_estimate_prompt(request);
            let completion_tokens = crate::context::estimate_tokens_for_text(&content) as u32;
            usage = Usage::new(prompt_tokens, completion_tokens);
        }

        Ok(LLMResponse {
            content,
            tool_calls,
            usage,
            model: request.model.clone(),
            finish_reason,
            cost: None,
        })
    }
}

fn request_estimate_prompt(request: &OpenAIRequest) -> u32 {
    let total: usize = request
        .messages
        .iter()
        .map(|m| match &m.content {
            Some(super::common::OpenAIContent::Text(t)) => t.len(),
            Some(super::common::OpenAIContent::Parts(parts)) => {
                parts.iter().filter_map(|p| p.text.as_deref()).map(|t| t.len()).sum()
            }
            None => 0,
        })
        .sum();
    ((total + 3) / 4) as u32
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let wire = self.build_request(request, None, true);
        self.complete_buffered(&wire).await
    }

    async fn stream(&self, request: &CompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let wire = self.build_request(request, None, true);
        let response = self.send(&wire).await?;
        let sse = common::parse_sse_stream(response);
        let mut accumulator = StreamAccumulator::new();
        let stream = sse.map(move |chunk| chunk.and_then(|c| accumulator.process(c)));
        Ok(Box::pin(stream))
    }

    async fn complete_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let wire = self.build_request(&request.base, Some(request), true);
        self.complete_buffered(&wire).await
    }

    async fn stream_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let wire = self.build_request(&request.base, Some(request), true);
        let response = self.send(&wire).await?;
        let sse = common::parse_sse_stream(response);
        let mut accumulator = StreamAccumulator::new();
        let stream = sse.map(move |chunk| chunk.and_then(|c| accumulator.process(c)));
        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self.http.get(&url).bearer_auth(&self.api_key).send().await?;
        if !response.status().is_success() {
            return Ok(Vec::new());
        }
        #[derive(serde::Deserialize)]
        struct ModelsResponse {
            data: Vec<ModelEntry>,
        }
        #[derive(serde::Deserialize)]
        struct ModelEntry {
            id: String,
        }
        let parsed: ModelsResponse = response.json().await.map_err(ProviderError::Http)?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn test_build_request_omits_tool_choice_for_none() {
        let provider = OpenAiCompatibleProvider::new("openai", "https://api.openai.com/v1", "sk-test");
        let base = CompletionRequest::new(vec![Message::user("hi")]).with_model("gpt-4o");
        let tools = crate::tools::ToolDefinition::new("search", "search the web", serde_json::json!({}));
        let mut tool_req = ToolCompletionRequest::new(base, vec![tools]).unwrap();
        tool_req.tool_choice = ToolChoice::None;

        let wire = provider.build_request(&tool_req.base, Some(&tool_req), true);
        assert!(wire.tools.is_some());
        assert!(wire.tool_choice.is_none());
    }

    #[test]
    fn test_build_request_named_function_choice() {
        let provider = OpenAiCompatibleProvider::new("openai", "https://api.openai.com/v1", "sk-test");
        let base = CompletionRequest::new(vec![Message::user("hi")]).with_model("gpt-4o");
        let tools = crate::tools::ToolDefinition::new("search", "search the web", serde_json::json!({}));
        let mut tool_req = ToolCompletionRequest::new(base, vec![tools]).unwrap();
        tool_req.tool_choice = ToolChoice::Function { name: "search".to_string() };

        let wire = provider.build_request(&tool_req.base, Some(&tool_req), true);
        assert_eq!(wire.tool_choice.unwrap()["function"]["name"], "search");
    }

    #[test]
    fn test_request_estimate_prompt_fallback() {
        let wire = OpenAIRequest {
            model: "gpt-4o".to_string(),
            messages: vec![super::common::OpenAIMessage {
                role: "user".to_string(),
                content: Some(super::common::OpenAIContent::Text("abcd".to_string())),
                tool_calls: None,
                tool_call_id: None,
            }],
            stream: true,
            max_tokens: None,
            temperature: None,
            tools: None,
            tool_choice: None,
        };
        assert_eq!(request_estimate_prompt(&wire), 1);
    }
}
