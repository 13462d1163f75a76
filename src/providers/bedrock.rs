//! AWS Bedrock Converse adapter (spec §5 "Bedrock Converse adapter").
//!
//! The client is lazily constructed on first use — `aws-config` credential
//! discovery and the Bedrock SDK client both carry real startup cost, so a
//! router that never dispatches to Bedrock should never pay it. Gated
//! behind the `bedrock` feature since `aws-sdk-bedrockruntime` is a heavy,
//! optional dependency most deployments won't need.

use async_trait::async_trait;
use aws_sdk_bedrockruntime::types::{
    ContentBlock as BrContentBlock, ConversationRole, ConverseStreamOutput, Message as BrMessage,
    SystemContentBlock, Tool as BrTool, ToolConfiguration, ToolInputSchema, ToolResultBlock,
    ToolResultContentBlock, ToolSpecification, ToolUseBlock,
};
use aws_smithy_types::{Blob, Document};
use futures::stream::StreamExt;
use tokio::sync::OnceCell;

use crate::error::ProviderError;
use crate::message::{
    CompletionRequest, ContentBlock, FinishReason, LLMResponse, Message, MessageRole, ToolCall,
    ToolCallFunction, ToolCallType, ToolCompletionRequest, Usage,
};
use crate::tools::ToolDefinition;

use super::{ChunkStream, Provider};

pub struct BedrockProvider {
    client: OnceCell<aws_sdk_bedrockruntime::Client>,
}

impl Default for BedrockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl BedrockProvider {
    pub fn new() -> Self {
        Self { client: OnceCell::new() }
    }

    async fn client(&self) -> &aws_sdk_bedrockruntime::Client {
        self.client
            .get_or_init(|| async {
                let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_bedrockruntime::Client::new(&config)
            })
            .await
    }

    fn split_system(messages: &[Message]) -> (Vec<SystemContentBlock>, Vec<&Message>) {
        let mut system = Vec::new();
        let mut rest = Vec::new();
        for message in messages {
            if message.role == MessageRole::System {
                system.push(SystemContentBlock::Text(message.extract_text()));
            } else {
                rest.push(message);
            }
        }
        (system, rest)
    }

    fn to_wire_message(message: &Message) -> Result<BrMessage, ProviderError> {
        let role = match message.role {
            MessageRole::Assistant => ConversationRole::Assistant,
            _ => ConversationRole::User,
        };

        let mut blocks = Vec::new();

        if message.role == MessageRole::Tool {
            let tool_use_id = message.tool_call_id.clone().unwrap_or_default();
            let content = ToolResultBlock::builder()
                .tool_use_id(tool_use_id)
                .content(ToolResultContentBlock::Text(message.extract_text()))
                .build()
                .map_err(|e| ProviderError::Config(e.to_string()))?;
            blocks.push(BrContentBlock::ToolResult(content));
        } else {
            for block in &message.content {
                match block {
                    ContentBlock::Text(text) => blocks.push(BrContentBlock::Text(text.text.clone())),
                    ContentBlock::Image(_) => {
                        // Bedrock Converse image support varies by model;
                        // strip rather than guess an encoding.
                    }
                }
            }
            if let Some(tool_calls) = &message.tool_calls {
                for call in tool_calls {
                    let input: Document = serde_json::from_str(&call.function.arguments).unwrap_or(Document::Null);
                    let tool_use = ToolUseBlock::builder()
                        .tool_use_id(call.id.clone())
                        .name(call.function.name.clone())
                        .input(input)
                        .build()
                        .map_err(|e| ProviderError::Config(e.to_string()))?;
                    blocks.push(BrContentBlock::ToolUse(tool_use));
                }
            }
        }

        BrMessage::builder()
            .role(role)
            .set_content(Some(blocks))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))
    }

    fn to_wire_tool(tool: &ToolDefinition) -> Result<BrTool, ProviderError> {
        let schema: Document = serde_json::from_value(tool.parameters.clone())
            .map_err(|e| ProviderError::Config(format!("invalid tool schema for {}: {e}", tool.name)))?;
        let spec = ToolSpecification::builder()
            .name(tool.name.clone())
            .description(tool.description.clone())
            .input_schema(ToolInputSchema::Json(schema))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;
        Ok(BrTool::ToolSpec(spec))
    }
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let model = request.model.clone().unwrap_or_default();
        let (system, rest) = Self::split_system(&request.messages);
        let messages: Result<Vec<_>, _> = rest.into_iter().map(Self::to_wire_message).collect();
        let messages = messages?;

        let client = self.client().await;
        let response = client
            .converse()
            .model_id(&model)
            .set_system(Some(system))
            .set_messages(Some(messages))
            .send()
            .await
            .map_err(|e| ProviderError::Api { status: 0, message: e.to_string() })?;

        let mut content = String::new();
        if let Some(output) = response.output() {
            if let Ok(msg) = output.clone().as_message() {
                for block in msg.content() {
                    if let BrContentBlock::Text(text) = block {
                        content.push_str(text);
                    }
                }
            }
        }

        let usage = response
            .usage()
            .map(|u| Usage::new(u.input_tokens() as u32, u.output_tokens() as u32))
            .unwrap_or_default();

        let finish_reason = map_stop_reason(response.stop_reason().as_str());

        Ok(LLMResponse { content, tool_calls: None, usage, model, finish_reason, cost: None })
    }

    async fn stream(&self, request: &CompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let model = request.model.clone().unwrap_or_default();
        let (system, rest) = Self::split_system(&request.messages);
        let messages: Result<Vec<_>, _> = rest.into_iter().map(Self::to_wire_message).collect();
        let messages = messages?;

        let client = self.client().await;
        let response = client
            .converse_stream()
            .model_id(&model)
            .set_system(Some(system))
            .set_messages(Some(messages))
            .send()
            .await
            .map_err(|e| ProviderError::Api { status: 0, message: e.to_string() })?;

        Ok(converse_stream_to_chunks(response.stream))
    }

    async fn complete_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<LLMResponse, ProviderError> {
        let model = request.base.model.clone().unwrap_or_default();
        let (system, rest) = Self::split_system(&request.base.messages);
        let messages: Result<Vec<_>, _> = rest.into_iter().map(Self::to_wire_message).collect();
        let messages = messages?;
        let tools: Result<Vec<_>, _> = request.tools.iter().map(Self::to_wire_tool).collect();
        let tool_config = ToolConfiguration::builder()
            .set_tools(Some(tools?))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        let client = self.client().await;
        let response = client
            .converse()
            .model_id(&model)
            .set_system(Some(system))
            .set_messages(Some(messages))
            .tool_config(tool_config)
            .send()
            .await
            .map_err(|e| ProviderError::Api { status: 0, message: e.to_string() })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(output) = response.output() {
            if let Ok(msg) = output.clone().as_message() {
                for block in msg.content() {
                    match block {
                        BrContentBlock::Text(text) => content.push_str(text),
                        BrContentBlock::ToolUse(tool_use) => {
                            tool_calls.push(ToolCall {
                                id: tool_use.tool_use_id().to_string(),
                                call_type: ToolCallType::Function,
                                function: ToolCallFunction {
                                    name: tool_use.name().to_string(),
                                    arguments: document_to_json_string(tool_use.input()),
                                },
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        let usage = response
            .usage()
            .map(|u| Usage::new(u.input_tokens() as u32, u.output_tokens() as u32))
            .unwrap_or_default();

        let finish_reason = if tool_calls.is_empty() {
            map_stop_reason(response.stop_reason().as_str())
        } else {
            FinishReason::ToolCalls
        };

        Ok(LLMResponse {
            content,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            usage,
            model,
            finish_reason,
            cost: None,
        })
    }

    async fn stream_with_tools(&self, request: &ToolCompletionRequest) -> std::result::Result<ChunkStream, ProviderError> {
        let model = request.base.model.clone().unwrap_or_default();
        let (system, rest) = Self::split_system(&request.base.messages);
        let messages: Result<Vec<_>, _> = rest.into_iter().map(Self::to_wire_message).collect();
        let messages = messages?;
        let tools: Result<Vec<_>, _> = request.tools.iter().map(Self::to_wire_tool).collect();
        let tool_config = ToolConfiguration::builder()
            .set_tools(Some(tools?))
            .build()
            .map_err(|e| ProviderError::Config(e.to_string()))?;

        let client = self.client().await;
        let response = client
            .converse_stream()
            .model_id(&model)
            .set_system(Some(system))
            .set_messages(Some(messages))
            .tool_config(tool_config)
            .send()
            .await
            .map_err(|e| ProviderError::Api { status: 0, message: e.to_string() })?;

        Ok(converse_stream_to_chunks(response.stream))
    }
}

fn map_stop_reason(raw: &str) -> FinishReason {
    match raw.to_lowercase().as_str() {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "content_filtered" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn document_to_json_string(doc: &Document) -> String {
    serde_json::to_value(doc).map(|v| v.to_string()).unwrap_or_else(|_| "{}".to_string())
}

#[derive(Default)]
struct PartialToolUse {
    id: String,
    name: String,
    input_buffer: String,
}

#[derive(Default)]
struct ConverseState {
    current_tool: Option<PartialToolUse>,
    finished_tool_calls: Vec<ToolCall>,
}

/// Applies one Converse stream event to `state`, returning the
/// [`StreamChunk`] it produces (if any). `contentBlockStart.start.toolUse`
/// opens an accumulator entry, `contentBlockDelta.delta.text`/`.toolUse.input`
/// append to the current block, `contentBlockStop` finalizes a tool call
/// into the buffer rather than emitting it — it must only surface on the
/// terminal `done: true` chunk (spec §3 StreamChunk invariant (b)) — and
/// `metadata.usage`/`messageStop` close out the stream, draining the
/// buffered tool calls onto whichever fires first (spec §5).
fn apply_converse_event(state: &mut ConverseState, event: ConverseStreamOutput) -> Option<crate::message::StreamChunk> {
    match event {
        ConverseStreamOutput::ContentBlockStart(start) => {
            let block_start = start.start()?;
            let tool_use = block_start.clone().as_tool_use().ok()?;
            let tool = PartialToolUse {
                id: tool_use.tool_use_id().unwrap_or_default().to_string(),
                name: tool_use.name().unwrap_or_default().to_string(),
                input_buffer: String::new(),
            };
            let chunk = crate::message::StreamChunk {
                content: None,
                done: false,
                tool_calls: None,
                tool_call_start: Some(crate::message::ToolCallStart { id: tool.id.clone(), name: tool.name.clone() }),
                usage: None,
            };
            state.current_tool = Some(tool);
            Some(chunk)
        }
        ConverseStreamOutput::ContentBlockDelta(delta_event) => {
            let delta = delta_event.delta()?;
            if let Ok(text) = delta.clone().as_text() {
                return Some(crate::message::StreamChunk::text(text.clone()));
            }
            if let Ok(tool_use_delta) = delta.clone().as_tool_use() {
                if let Some(tool) = state.current_tool.as_mut() {
                    tool.input_buffer.push_str(tool_use_delta.input().unwrap_or_default());
                }
            }
            None
        }
        ConverseStreamOutput::ContentBlockStop(_) => {
            if let Some(tool) = state.current_tool.take() {
                let arguments = if tool.input_buffer.is_empty() { "{}".to_string() } else { tool.input_buffer };
                state.finished_tool_calls.push(ToolCall {
                    id: tool.id,
                    call_type: ToolCallType::Function,
                    function: ToolCallFunction { name: tool.name, arguments },
                });
            }
            None
        }
        ConverseStreamOutput::Metadata(metadata) => {
            let usage = metadata.usage().map(|u| Usage::new(u.input_tokens() as u32, u.output_tokens() as u32))?;
            let tool_calls = if state.finished_tool_calls.is_empty() { None } else { Some(std::mem::take(&mut state.finished_tool_calls)) };
            Some(crate::message::StreamChunk::final_chunk(tool_calls, Some(usage)))
        }
        ConverseStreamOutput::MessageStop(_) => {
            let tool_calls = if state.finished_tool_calls.is_empty() { None } else { Some(std::mem::take(&mut state.finished_tool_calls)) };
            Some(crate::message::StreamChunk::final_chunk(tool_calls, None))
        }
        _ => None,
    }
}

fn converse_stream_to_chunks(
    stream: aws_sdk_bedrockruntime::operation::converse_stream::ConverseStreamOutput,
) -> ChunkStream {
    let events = stream.event_receiver;
    let state = ConverseState::default();

    let chunks = futures::stream::unfold((events, state), |(mut events, mut state)| async move {
        loop {
            match events.recv().await {
                Ok(Some(event)) => {
                    if let Some(chunk) = apply_converse_event(&mut state, event) {
                        return Some((Ok(chunk), (events, state)));
                    }
                    continue;
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(ProviderError::Stream(e.to_string())), (events, state))),
            }
        }
    });

    Box::pin(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_stop_reason_tool_use() {
        assert_eq!(map_stop_reason("tool_use"), FinishReason::ToolCalls);
    }

    #[test]
    fn test_map_stop_reason_max_tokens() {
        assert_eq!(map_stop_reason("max_tokens"), FinishReason::Length);
    }

    #[test]
    fn test_split_system_extracts_only_system_role() {
        let messages = vec![
            Message::system("be helpful"),
            Message::user("hi"),
        ];
        let (system, rest) = BedrockProvider::split_system(&messages);
        assert_eq!(system.len(), 1);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_tool_use_event_sequence_surfaces_tool_calls_only_on_done_chunk() {
        use aws_sdk_bedrockruntime::types::{
            ContentBlockDelta, ContentBlockDeltaEvent, ContentBlockStart, ContentBlockStartEvent,
            ContentBlockStopEvent, ConverseStreamMetadataEvent, MessageStopEvent, StopReason,
            TokenUsage, ToolUseBlockDelta, ToolUseBlockStart,
        };

        let events = vec![
            ConverseStreamOutput::ContentBlockStart(
                ContentBlockStartEvent::builder()
                    .content_block_index(0)
                    .start(ContentBlockStart::ToolUse(
                        ToolUseBlockStart::builder()
                            .tool_use_id("call_1")
                            .name("get_weather")
                            .build()
                            .unwrap(),
                    ))
                    .build()
                    .unwrap(),
            ),
            ConverseStreamOutput::ContentBlockDelta(
                ContentBlockDeltaEvent::builder()
                    .content_block_index(0)
                    .delta(ContentBlockDelta::ToolUse(
                        ToolUseBlockDelta::builder().input(r#"{"city":"Paris"}"#).build().unwrap(),
                    ))
                    .build()
                    .unwrap(),
            ),
            ConverseStreamOutput::ContentBlockStop(
                ContentBlockStopEvent::builder().content_block_index(0).build().unwrap(),
            ),
            ConverseStreamOutput::Metadata(
                ConverseStreamMetadataEvent::builder()
                    .usage(TokenUsage::builder().input_tokens(12).output_tokens(8).total_tokens(20).build().unwrap())
                    .build(),
            ),
            ConverseStreamOutput::MessageStop(
                MessageStopEvent::builder().stop_reason(StopReason::ToolUse).build().unwrap(),
            ),
        ];

        let mut state = ConverseState::default();
        let chunks: Vec<_> = events.into_iter().filter_map(|e| apply_converse_event(&mut state, e)).collect();

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
