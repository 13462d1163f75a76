//! The Provider Abstraction: a uniform async contract over heterogeneous
//! remote chat-completion APIs (spec §1, §5).
//!
//! Grounded on `traits.rs`'s `LlmProvider` trait from the sibling
//! `cognilexa-merco-llmproxy` package, generalized with the streaming and
//! tool-calling operations the teacher's own `client.rs`/`utils.rs` already
//! implement for a single (local, OpenAI-compatible) backend.

pub mod anthropic;
#[cfg(feature = "bedrock")]
pub mod bedrock;
pub mod common;
pub mod google;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

use crate::error::ProviderError;
use crate::message::{CompletionRequest, LLMResponse, StreamChunk, ToolCompletionRequest};

pub type ChunkStream = Pin<Box<dyn Stream<Item = std::result::Result<StreamChunk, ProviderError>> + Send>>;

/// A remote chat-completion backend. One implementation per upstream wire
/// protocol (Anthropic Messages, OpenAI-compatible chat completions, Google
/// GenerativeAI, Ollama, Bedrock Converse).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider identifier used in the pricing table, circuit
    /// breaker, and fallback configuration (e.g. `"anthropic"`).
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> std::result::Result<LLMResponse, ProviderError>;

    async fn stream(&self, request: &CompletionRequest) -> std::result::Result<ChunkStream, ProviderError>;

    async fn complete_with_tools(
        &self,
        request: &ToolCompletionRequest,
    ) -> std::result::Result<LLMResponse, ProviderError>;

    /// Native streaming-with-tools. Providers without one should leave the
    /// default, which reports `Unsupported` so the router can skip them as
    /// a fallback for this call (spec §4.1 "Streaming-with-tools failover").
    async fn stream_with_tools(
        &self,
        _request: &ToolCompletionRequest,
    ) -> std::result::Result<ChunkStream, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "{} does not support native streaming with tools",
            self.name()
        )))
    }

    /// `ceil(len(text)/4)` unless the provider offers a real tokenizer
    /// endpoint (spec §5 "Token counting").
    fn count_tokens(&self, text: &str) -> u32 {
        crate::context::estimate_tokens_for_text(text) as u32
    }

    /// Static per-model context window, falling back to 4096 for unknown
    /// chat models (spec §5).
    fn max_tokens_for_model(&self, model: &str) -> u32 {
        common::max_tokens_for_model(model)
    }

    async fn list_models(&self) -> std::result::Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }
}
