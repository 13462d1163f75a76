//! Model alias resolution and provider-owner detection (spec §4.1).

/// Lowercases `model` and resolves it through a static alias table.
/// Unknown aliases pass through unchanged (lowercased). Idempotent:
/// `resolve_alias(resolve_alias(x)) == resolve_alias(x)` (spec §8 invariant 8),
/// since every table value is either absent from the table itself or maps
/// to itself.
pub fn resolve_alias(model: &str) -> String {
    let lower = model.to_lowercase();
    match lower.as_str() {
        "sonnet" => "claude-sonnet-4-20250514".to_string(),
        "haiku" => "claude-haiku-4-20250514".to_string(),
        "opus" => "claude-opus-4-20250514".to_string(),
        "gpt4o" | "gpt-4o" => "gpt-4o".to_string(),
        "gpt4" | "gpt-4" => "gpt-4".to_string(),
        "gemini" => "gemini-1.5-flash".to_string(),
        "gemini-pro" => "gemini-1.5-pro".to_string(),
        other => other.to_string(),
    }
}

/// The provider that owns a bare (alias-resolved) model id, used when
/// `request.model` carries no `prefix/name` form (spec §4.1 step 1).
pub fn detect_provider_by_pattern(model: &str) -> Option<&'static str> {
    let lower = model.to_lowercase();
    if lower.starts_with("claude") {
        Some("anthropic")
    } else if lower.starts_with("gpt") {
        Some("openai")
    } else if lower.starts_with("gemini") {
        Some("google")
    } else if lower.starts_with("deepseek") {
        Some("deepseek")
    } else if lower.starts_with("llama") || lower.starts_with("mistral") || lower.starts_with("codellama") || lower.starts_with("phi") {
        Some("ollama")
    } else {
        None
    }
}

/// Splits a `provider/model` form. Returns `None` if `model` carries no
/// `/` separator.
pub fn split_provider_prefix(model: &str) -> Option<(&str, &str)> {
    model.split_once('/')
}

/// Providers whose wire protocol expects the `provider/model` prefix kept
/// intact rather than stripped before dispatch (spec §4.1: "except for
/// providers (OpenRouter) whose wire protocol expects the prefixed form").
pub fn preserves_prefix(provider: &str) -> bool {
    provider == "openrouter"
}

/// Segments that name a model's *vendor* rather than a dispatch target,
/// e.g. the `anthropic` in `anthropic/claude-3.5-sonnet`. A `prefix/name`
/// request whose prefix is one of these must fall through to the
/// aggregator (OpenRouter) with the prefix preserved, even when a provider
/// literally named `prefix` happens to be registered (spec §4.1 step 1,
/// spec §8 S2). Contrast with a genuine literal host-selection prefix
/// (`groq/llama3-70b`, `together/...`), which dispatches directly to the
/// provider of that name with the prefix stripped.
pub fn is_vendor_namespace_prefix(prefix: &str) -> bool {
    matches!(
        prefix.to_lowercase().as_str(),
        "anthropic" | "openai" | "google" | "deepseek" | "meta-llama" | "mistralai"
    )
}
