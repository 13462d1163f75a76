//! The Router (spec §4.1): alias resolution, provider selection, budget
//! enforcement, retry, circuit-breaker-aware failover, cost accounting, and
//! usage emission sit behind four public operations mirroring the
//! teacher's own `Client` surface (`complete`/`stream`/tool variants).

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};

use crate::alias::{
    detect_provider_by_pattern, is_vendor_namespace_prefix, preserves_prefix, resolve_alias,
    split_provider_prefix,
};
use crate::circuit_breaker::CircuitBreaker;
use crate::context::estimate_tokens_for_text;
use crate::error::{Error, ProviderAttempt, Result};
use crate::message::{
    CompletionRequest, FinishReason, LLMResponse, StreamChunk, ToolCompletionRequest, Usage,
};
use crate::pricing::compute_cost;
use crate::providers::Provider;
use crate::retry::{retry_with_backoff_conditional, RetryConfig};
use crate::usage::{UsageRow, UsageSink};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const DEFAULT_TOKEN_BUDGET: u32 = 32_768;

/// Cost-optimization model choice for a labeled task class (spec §4.1
/// `cost_optimization.cheap_for` / `expensive_for`).
#[derive(Debug, Clone, Default)]
pub struct CostOptimizationConfig {
    pub enabled: bool,
    pub cheap_model: Option<String>,
    pub expensive_model: Option<String>,
    pub cheap_for: Vec<String>,
    pub expensive_for: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub providers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TokenBudgetConfig {
    pub max_tokens_per_request: u32,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self { max_tokens_per_request: DEFAULT_TOKEN_BUDGET }
    }
}

/// Router configuration record (spec §4.1 "Configuration").
#[derive(Debug, Clone, Default)]
pub struct RouterConfig {
    pub default_provider: String,
    pub default_model: Option<String>,
    pub cost_optimization: CostOptimizationConfig,
    pub fallback: FallbackConfig,
    pub token_budget: TokenBudgetConfig,
}

/// Metadata surfaced after a request (or a completed stream) about which
/// provider actually served it (spec §4.1 "Failover").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMeta {
    pub active_provider: String,
    pub original_failed_provider: Option<String>,
    pub is_fallback: bool,
}

pub struct Router {
    config: RouterConfig,
    providers: HashMap<String, Arc<dyn Provider>>,
    circuit_breaker: CircuitBreaker,
    retry_config: RetryConfig,
    usage_sink: Arc<dyn UsageSink>,
}

impl Router {
    pub fn new(config: RouterConfig, usage_sink: Arc<dyn UsageSink>) -> Self {
        Self {
            config,
            providers: HashMap::new(),
            circuit_breaker: CircuitBreaker::default(),
            retry_config: RetryConfig::default(),
            usage_sink,
        }
    }

    /// Registers a provider under `name`. The registered set is read-only
    /// after startup (spec §5 "Shared resources").
    pub fn register_provider(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn available_providers(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn disabled_providers(&self) -> Vec<String> {
        self.circuit_breaker.open_circuits()
    }

    pub async fn available_models(&self) -> HashMap<String, Vec<String>> {
        let mut result = HashMap::new();
        for (name, provider) in &self.providers {
            let models = provider.list_models().await.unwrap_or_default();
            result.insert(name.clone(), models);
        }
        result
    }

    /// Resolves the request's alias, determines the owning provider and
    /// candidate failover order (spec §4.1 "Provider selection").
    fn resolve_target(&self, request: &CompletionRequest, task_class: Option<&str>) -> Result<(String, String)> {
        let requested_model = request.model.clone().unwrap_or_else(|| {
            self.config.default_model.clone().unwrap_or_default()
        });
        let resolved = resolve_alias(&requested_model);

        if let Some((prefix, bare)) = split_provider_prefix(&resolved) {
            if self.providers.contains_key(prefix) && !is_vendor_namespace_prefix(prefix) {
                return Ok((prefix.to_string(), bare.to_string()));
            }
            // `prefix` names a model vendor (or is unregistered), not a
            // literal dispatch target: fall through to the aggregator with
            // the prefix preserved (spec §4.1 step 1, spec §8 S2).
            if self.providers.contains_key("openrouter") {
                return Ok(("openrouter".to_string(), resolved.clone()));
            }
        } else if let Some(owner) = detect_provider_by_pattern(&resolved) {
            if self.providers.contains_key(owner) {
                return Ok((owner.to_string(), resolved));
            }
        }

        if self.config.cost_optimization.enabled {
            if let Some(class) = task_class {
                let co = &self.config.cost_optimization;
                if co.cheap_for.iter().any(|c| c == class) {
                    if let Some(model) = &co.cheap_model {
                        if let Some(owner) = detect_provider_by_pattern(model) {
                            if self.providers.contains_key(owner) {
                                return Ok((owner.to_string(), model.clone()));
                            }
                        }
                    }
                } else if co.expensive_for.iter().any(|c| c == class) {
                    if let Some(model) = &co.expensive_model {
                        if let Some(owner) = detect_provider_by_pattern(model) {
                            if self.providers.contains_key(owner) {
                                return Ok((owner.to_string(), model.clone()));
                            }
                        }
                    }
                }
            }
        }

        if self.providers.contains_key(&self.config.default_provider) {
            return Ok((self.config.default_provider.clone(), resolved));
        }

        if let Some(name) = self.providers.keys().next() {
            return Ok((name.clone(), resolved));
        }

        Err(Error::no_provider_available(Some(requested_model)))
    }

    /// `[primary, ...fallback_providers excluding primary]` when fallback
    /// is enabled; otherwise just `[primary]` (spec §4.1 "Failover").
    fn failover_order(&self, primary: &str) -> Vec<String> {
        if !self.config.fallback.enabled {
            return vec![primary.to_string()];
        }
        let mut order = vec![primary.to_string()];
        for candidate in &self.config.fallback.providers {
            if candidate != primary {
                order.push(candidate.clone());
            }
        }
        order
    }

    fn apply_budget(&self, request: &mut CompletionRequest) {
        let configured = self.config.token_budget.max_tokens_per_request;
        let cap = if configured == 0 { DEFAULT_TOKEN_BUDGET } else { configured };
        let requested = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
        request.max_tokens = Some(requested.min(cap));
    }

    fn bare_model(&self, provider: &str, model: &str) -> String {
        if preserves_prefix(provider) {
            model.to_string()
        } else {
            split_provider_prefix(model).map(|(_, bare)| bare.to_string()).unwrap_or_else(|| model.to_string())
        }
    }

    fn record_cost_and_usage(&self, provider: &str, response: &mut LLMResponse) {
        let cost = compute_cost(provider, &response.model, response.usage.prompt_tokens, response.usage.completion_tokens);
        self.usage_sink.record(UsageRow::completion(
            uuid_like(),
            response.usage.total_tokens as f64,
            cost.cost_usd,
            serde_json::json!({
                "model": response.model,
                "provider": provider,
                "prompt_tokens": response.usage.prompt_tokens,
                "completion_tokens": response.usage.completion_tokens,
            }),
        ));
        response.cost = Some(cost);
    }

    /// Unary completion with retry-per-provider and circuit-breaker-aware
    /// failover (spec §4.1 "Public operations").
    pub async fn complete(&self, mut request: CompletionRequest, task_class: Option<&str>) -> Result<LLMResponse> {
        let (primary, model) = self.resolve_target(&request, task_class)?;
        self.apply_budget(&mut request);

        let mut attempts = Vec::new();
        let mut original_failed = None;

        for (index, provider_name) in self.failover_order(&primary).into_iter().enumerate() {
            if !self.circuit_breaker.is_available(&provider_name) {
                continue;
            }
            let Some(provider) = self.providers.get(&provider_name) else { continue };

            let mut attempt_request = request.clone();
            attempt_request.model = Some(self.bare_model(&provider_name, &model));

            let result = retry_with_backoff_conditional(&self.retry_config, || provider.complete(&attempt_request)).await;

            match result {
                Ok(mut response) => {
                    self.circuit_breaker.record_success(&provider_name);
                    self.record_cost_and_usage(&provider_name, &mut response);
                    let _ = (index, &attempts);
                    return Ok(response);
                }
                Err(err) => {
                    self.circuit_breaker.record_failure(&provider_name);
                    if original_failed.is_none() && index == 0 {
                        original_failed = Some(provider_name.clone());
                    }
                    attempts.push(ProviderAttempt { provider: provider_name, error: err.to_string() });
                }
            }
        }

        Err(Error::AllProvidersFailed(attempts))
    }

    pub async fn complete_with_tools(
        &self,
        mut request: ToolCompletionRequest,
        task_class: Option<&str>,
    ) -> Result<LLMResponse> {
        let (primary, model) = self.resolve_target(&request.base, task_class)?;
        self.apply_budget(&mut request.base);

        let mut attempts = Vec::new();

        for provider_name in self.failover_order(&primary) {
            if !self.circuit_breaker.is_available(&provider_name) {
                continue;
            }
            let Some(provider) = self.providers.get(&provider_name) else { continue };

            let mut attempt_request = request.clone();
            attempt_request.base.model = Some(self.bare_model(&provider_name, &model));

            let result =
                retry_with_backoff_conditional(&self.retry_config, || provider.complete_with_tools(&attempt_request)).await;

            match result {
                Ok(mut response) => {
                    self.circuit_breaker.record_success(&provider_name);
                    self.record_cost_and_usage(&provider_name, &mut response);
                    return Ok(response);
                }
                Err(err) => {
                    self.circuit_breaker.record_failure(&provider_name);
                    attempts.push(ProviderAttempt { provider: provider_name, error: err.to_string() });
                }
            }
        }

        Err(Error::AllProvidersFailed(attempts))
    }

    /// Streaming failover buffers the full chunk sequence per attempt in
    /// memory, replaying it only once a provider completes cleanly (spec
    /// §4.1 "Streaming failover — the subtle case").
    pub async fn stream(
        &self,
        mut request: CompletionRequest,
        task_class: Option<&str>,
    ) -> Result<(impl Stream<Item = StreamChunk>, RouteMeta)> {
        let (primary, model) = self.resolve_target(&request, task_class)?;
        self.apply_budget(&mut request);

        let order = self.failover_order(&primary);
        let mut original_failed = None;

        for (index, provider_name) in order.iter().enumerate() {
            if !self.circuit_breaker.is_available(provider_name) {
                continue;
            }
            let Some(provider) = self.providers.get(provider_name) else { continue };

            let mut attempt_request = request.clone();
            attempt_request.model = Some(self.bare_model(provider_name, &model));

            match buffer_stream(provider.stream(&attempt_request).await, provider.as_ref(), &attempt_request).await {
                Ok(chunks) => {
                    self.circuit_breaker.record_success(provider_name);
                    self.emit_usage_for_stream(provider_name, &model, &request, &chunks);
                    let meta = RouteMeta {
                        active_provider: provider_name.clone(),
                        original_failed_provider: original_failed,
                        is_fallback: index > 0,
                    };
                    return Ok((stream::iter(chunks), meta));
                }
                Err(_) => {
                    self.circuit_breaker.record_failure(provider_name);
                    if index == 0 {
                        original_failed = Some(provider_name.clone());
                    }
                }
            }
        }

        Err(Error::no_provider_available(Some(model)))
    }

    /// Streaming-with-tools failover: identical buffering; providers
    /// without native support are skipped, with a final degradation to a
    /// non-streaming tool completion re-packaged as a two-chunk sequence
    /// (spec §4.1 "Streaming-with-tools failover").
    pub async fn stream_with_tools(
        &self,
        mut request: ToolCompletionRequest,
        task_class: Option<&str>,
    ) -> Result<(impl Stream<Item = StreamChunk>, RouteMeta)> {
        let (primary, model) = self.resolve_target(&request.base, task_class)?;
        self.apply_budget(&mut request.base);

        let order = self.failover_order(&primary);
        let mut original_failed = None;

        for (index, provider_name) in order.iter().enumerate() {
            if !self.circuit_breaker.is_available(provider_name) {
                continue;
            }
            let Some(provider) = self.providers.get(provider_name) else { continue };

            let mut attempt_request = request.clone();
            attempt_request.base.model = Some(self.bare_model(provider_name, &model));

            match provider.stream_with_tools(&attempt_request).await {
                Ok(raw_stream) => match drain_chunk_stream(raw_stream).await {
                    Ok(chunks) => {
                        self.circuit_breaker.record_success(provider_name);
                        self.emit_usage_for_stream(provider_name, &model, &attempt_request.base, &chunks);
                        let meta = RouteMeta {
                            active_provider: provider_name.clone(),
                            original_failed_provider: original_failed,
                            is_fallback: index > 0,
                        };
                        return Ok((stream::iter(chunks), meta));
                    }
                    Err(_) => {
                        self.circuit_breaker.record_failure(provider_name);
                        if index == 0 {
                            original_failed = Some(provider_name.clone());
                        }
                    }
                },
                Err(_) => {
                    // No native streaming-with-tools support: degrade to a
                    // non-streaming tool completion for this provider.
                    match provider.complete_with_tools(&attempt_request).await {
                        Ok(response) => {
                            self.circuit_breaker.record_success(provider_name);
                            let chunks = degrade_to_chunks(response);
                            let meta = RouteMeta {
                                active_provider: provider_name.clone(),
                                original_failed_provider: original_failed,
                                is_fallback: index > 0,
                            };
                            return Ok((stream::iter(chunks), meta));
                        }
                        Err(_) => {
                            self.circuit_breaker.record_failure(provider_name);
                            if index == 0 {
                                original_failed = Some(provider_name.clone());
                            }
                        }
                    }
                }
            }
        }

        Err(Error::no_provider_available(Some(model)))
    }

    fn emit_usage_for_stream(&self, provider_name: &str, model: &str, request: &CompletionRequest, chunks: &[StreamChunk]) {
        let content: String = chunks.iter().filter_map(|c| c.content.as_deref()).collect();
        let reported_usage = chunks.iter().find_map(|c| c.usage);

        let usage = reported_usage.unwrap_or_else(|| {
            let input_tokens: usize = request.messages.iter().map(|m| estimate_tokens_for_text(&m.extract_text())).sum();
            let output_tokens = estimate_tokens_for_text(&content);
            Usage::new(input_tokens as u32, output_tokens as u32)
        });

        let cost = compute_cost(provider_name, model, usage.prompt_tokens, usage.completion_tokens);
        self.usage_sink.record(UsageRow::completion(
            uuid_like(),
            usage.total_tokens as f64,
            cost.cost_usd,
            serde_json::json!({
                "model": model,
                "provider": provider_name,
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
            }),
        ));
    }
}

/// Drives `provider.stream(...)` to completion in memory, discarding the
/// buffer on any mid-stream error so a failed attempt never surfaces
/// partial chunks (spec §4.1).
async fn buffer_stream(
    stream_result: std::result::Result<crate::providers::ChunkStream, crate::error::ProviderError>,
    _provider: &dyn Provider,
    _request: &CompletionRequest,
) -> std::result::Result<Vec<StreamChunk>, crate::error::ProviderError> {
    let stream = stream_result?;
    drain_chunk_stream(stream).await
}

async fn drain_chunk_stream(
    mut stream: crate::providers::ChunkStream,
) -> std::result::Result<Vec<StreamChunk>, crate::error::ProviderError> {
    let mut chunks = Vec::new();
    let mut saw_done = false;

    while let Some(item) = stream.next().await {
        let chunk = item?;
        if chunk.done {
            saw_done = true;
        }
        chunks.push(chunk);
    }

    if !saw_done {
        return Err(crate::error::ProviderError::Stream(
            "stream ended without a done=true chunk".to_string(),
        ));
    }

    Ok(chunks)
}

/// Repackages a non-streaming tool completion as a two-chunk sequence: one
/// content chunk (if text present), then a terminal done chunk carrying
/// tool_calls and usage (spec §4.1 "Streaming-with-tools failover").
fn degrade_to_chunks(response: LLMResponse) -> Vec<StreamChunk> {
    let mut chunks = Vec::new();
    if !response.content.is_empty() {
        chunks.push(StreamChunk::text(response.content));
    }
    chunks.push(StreamChunk {
        content: None,
        done: true,
        tool_calls: response.tool_calls,
        tool_call_start: None,
        usage: Some(response.usage),
    });
    chunks
}

fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("usage-{:x}-{n}", std::process::id())
}

#[allow(dead_code)]
fn finish_reason_is_terminal(reason: FinishReason) -> bool {
    matches!(reason, FinishReason::Stop | FinishReason::Length | FinishReason::ContentFilter | FinishReason::ToolCalls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CompletionRequest, Message};
    use std::sync::Mutex as StdMutex;

    struct StubProvider {
        name: String,
        responses: StdMutex<Vec<std::result::Result<LLMResponse, crate::error::ProviderError>>>,
    }

    #[async_trait::async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(&self, _request: &CompletionRequest) -> std::result::Result<LLMResponse, crate::error::ProviderError> {
            self.responses.lock().unwrap().remove(0)
        }

        async fn stream(&self, _request: &CompletionRequest) -> std::result::Result<crate::providers::ChunkStream, crate::error::ProviderError> {
            Err(crate::error::ProviderError::Unsupported("not used in this test".to_string()))
        }

        async fn complete_with_tools(
            &self,
            _request: &ToolCompletionRequest,
        ) -> std::result::Result<LLMResponse, crate::error::ProviderError> {
            Err(crate::error::ProviderError::Unsupported("not used in this test".to_string()))
        }
    }

    fn make_response(model: &str) -> LLMResponse {
        LLMResponse {
            content: "hi".to_string(),
            tool_calls: None,
            usage: Usage::new(10, 5),
            model: model.to_string(),
            finish_reason: FinishReason::Stop,
            cost: None,
        }
    }

    #[tokio::test]
    async fn test_complete_routes_by_pattern_and_records_cost() {
        let mut router = Router::new(
            RouterConfig {
                default_provider: "anthropic".to_string(),
                ..Default::default()
            },
            Arc::new(crate::usage::NullUsageSink),
        );
        router.register_provider(
            "anthropic",
            Arc::new(StubProvider {
                name: "anthropic".to_string(),
                responses: StdMutex::new(vec![Ok(make_response("claude-sonnet-4-20250514"))]),
            }),
        );

        let request = CompletionRequest::new(vec![Message::user("hi")]).with_model("sonnet");
        let response = router.complete(request, None).await.unwrap();
        assert!(response.cost.is_some());
        assert!(response.cost.unwrap().cost_usd > 0.0);
    }

    #[tokio::test]
    async fn test_complete_fails_over_to_next_provider() {
        let mut router = Router::new(
            RouterConfig {
                default_provider: "anthropic".to_string(),
                fallback: FallbackConfig { enabled: true, providers: vec!["anthropic".to_string(), "openai".to_string()] },
                ..Default::default()
            },
            Arc::new(crate::usage::NullUsageSink),
        );
        router.register_provider(
            "anthropic",
            Arc::new(StubProvider {
                name: "anthropic".to_string(),
                responses: StdMutex::new(vec![Err(crate::error::ProviderError::Config("bad key".to_string()))]),
            }),
        );
        router.register_provider(
            "openai",
            Arc::new(StubProvider {
                name: "openai".to_string(),
                responses: StdMutex::new(vec![Ok(make_response("gpt-4o"))]),
            }),
        );

        let request = CompletionRequest::new(vec![Message::user("hi")]).with_model("claude-sonnet-4-20250514");
        let response = router.complete(request, None).await.unwrap();
        assert_eq!(response.model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_complete_no_provider_available() {
        let router = Router::new(RouterConfig::default(), Arc::new(crate::usage::NullUsageSink));
        let request = CompletionRequest::new(vec![Message::user("hi")]);
        let result = router.complete(request, None).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_budget_caps_to_token_budget() {
        let router = Router::new(
            RouterConfig { token_budget: TokenBudgetConfig { max_tokens_per_request: 100 }, ..Default::default() },
            Arc::new(crate::usage::NullUsageSink),
        );
        let mut request = CompletionRequest::new(vec![Message::user("hi")]);
        request.max_tokens = Some(10_000);
        router.apply_budget(&mut request);
        assert_eq!(request.max_tokens, Some(100));
    }

    #[test]
    fn test_apply_budget_default_when_unset() {
        let router = Router::new(RouterConfig::default(), Arc::new(crate::usage::NullUsageSink));
        let mut request = CompletionRequest::new(vec![Message::user("hi")]);
        router.apply_budget(&mut request);
        assert_eq!(request.max_tokens, Some(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn test_degrade_to_chunks_two_chunk_sequence() {
        let mut response = make_response("gpt-4o");
        response.tool_calls = Some(vec![crate::message::ToolCall::new("call_1", "search", "{}")]);
        let chunks = degrade_to_chunks(response);
        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].done);
        assert!(chunks[1].done);
        assert!(chunks[1].tool_calls.is_some());
    }
}
