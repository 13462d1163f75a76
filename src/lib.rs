//! # nimbus-core
//!
//! A provider-agnostic LLM router core: alias resolution, retry/failover
//! across heterogeneous provider wire protocols, per-provider circuit
//! breakers, static cost accounting, and a subprocess-based hook execution
//! engine for gating tool use.
//!
//! ## Architecture
//!
//! - **router**: Request entry point — alias resolution, provider
//!   selection, budget enforcement, retry, failover, cost accounting.
//! - **providers**: One adapter per upstream wire protocol (Anthropic
//!   Messages, OpenAI-compatible chat completions, Google GenerativeAI,
//!   Ollama, AWS Bedrock Converse), behind a single `Provider` trait.
//! - **circuit_breaker**: Per-provider three-state machine with cooldown.
//! - **hooks**: YAML-configured subprocess supervisor run around tool
//!   invocations.
//! - **credentials**: Per-provider API-key / base-URL resolution with a
//!   short-TTL cache, file value over environment fallback.
//! - **usage**: Fire-and-forget append-only usage row sink.
//! - **message**, **tools**: The provider-neutral data model.
//! - **alias**, **pricing**, **context**, **retry**, **error**: Supporting
//!   utilities shared across the above.

mod alias;
mod circuit_breaker;
mod context;
mod credentials;
mod error;
pub mod hooks;
mod message;
mod pricing;
pub mod providers;
mod retry;
mod router;
mod tools;
mod usage;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use credentials::{Credential, CredentialResolver};
pub use error::{Error, ProviderAttempt, ProviderError, Result};
pub use message::{
    CompletionRequest, ContentBlock, CostBreakdown, CostResult, FinishReason, ImageBlock,
    ImageMediaType, LLMResponse, Message, MessageRole, ResponseFormat, StreamChunk, TextBlock,
    ToolCall, ToolCallFunction, ToolCallStart, ToolCallType, ToolChoice, ToolCompletionRequest,
    Usage,
};
pub use providers::{ChunkStream, Provider};
pub use retry::{retry_with_backoff, retry_with_backoff_conditional, RetryConfig};
pub use router::{
    CostOptimizationConfig, FallbackConfig, Router, RouterConfig, RouteMeta, TokenBudgetConfig,
};
pub use tools::{ToolDefinition, ToolRegistry};
pub use usage::{JsonlUsageSink, NullUsageSink, UsageRow, UsageSink};

pub use context::{estimate_tokens, estimate_tokens_for_text, is_approaching_limit, truncate_messages};
pub use alias::{detect_provider_by_pattern, preserves_prefix, resolve_alias, split_provider_prefix};
pub use pricing::compute_cost;

/// Convenience module bringing the commonly used router-facing types into
/// scope with `use nimbus_core::prelude::*;`.
pub mod prelude {
    pub use crate::{
        CompletionRequest, ContentBlock, CostResult, Error, FinishReason, LLMResponse, Message,
        MessageRole, Provider, Result, Router, RouterConfig, RouteMeta, StreamChunk, ToolCall,
        ToolCompletionRequest, ToolDefinition, ToolRegistry, Usage,
    };
}
