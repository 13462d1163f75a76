//! Error types for the router core.
//!
//! `Error` is the top-level failure type returned by public operations.
//! `ProviderError` is the narrower failure type adapters raise; the router
//! classifies each one as retryable or fatal and wraps it into `Error::Provider`
//! once all retry/failover options for the current attempt are exhausted.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// One provider's contribution to a failed multi-provider attempt, kept for
/// the composite `AllProvidersFailed` message (spec §7: "a single clear
/// message naming the operation").
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider: String,
    pub error: String,
}

/// Failures an adapter can raise. Kept separate from `Error` so the router
/// can classify retryability without matching on the full error surface.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("provider configuration error: {0}")]
    Config(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("unsupported operation for this provider: {0}")]
    Unsupported(String),

    #[error("request timed out")]
    Timeout,
}

impl ProviderError {
    /// Spec §4.1: "A failure is retryable iff it carries HTTP status 429 or
    /// 5xx, or its message matches rate-limit / overloaded / 503 patterns
    /// (case-insensitive)."
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Api { status, message } => {
                *status == 429 || (500..600).contains(status) || matches_retry_pattern(message)
            }
            ProviderError::Http(e) => e.status().map(|s| s.as_u16() >= 500).unwrap_or(true),
            ProviderError::Timeout | ProviderError::Stream(_) => true,
            ProviderError::Config(_) | ProviderError::Parse(_) | ProviderError::Unsupported(_) => {
                false
            }
        }
    }
}

fn matches_retry_pattern(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("overloaded") || lower.contains("503")
}

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Spec §7: no registered provider can serve the request at all.
    #[error("no provider available to serve model {requested:?}")]
    NoProviderAvailable { requested: Option<String> },

    /// Spec §7: every candidate provider (primary + fallbacks) failed.
    #[error("all providers failed: {}", format_attempts(.0))]
    AllProvidersFailed(Vec<ProviderAttempt>),

    /// A single adapter-level failure that was not retried further
    /// (non-retryable, or retries/failover exhausted for this attempt).
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Spec §4.4: hook config failed to load; names the file and the
    /// offending definition's index within its event list.
    #[error("invalid hook configuration in {path}, definition #{index}: {reason}")]
    HookConfigInvalid {
        path: String,
        index: usize,
        reason: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("request timeout")]
    Timeout,

    #[error("error: {0}")]
    Other(String),
}

fn format_attempts(attempts: &[ProviderAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.provider, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn timeout() -> Self {
        Error::Timeout
    }

    pub fn no_provider_available(requested: Option<impl Into<String>>) -> Self {
        Error::NoProviderAvailable {
            requested: requested.map(Into::into),
        }
    }

    pub fn hook_config_invalid(
        path: impl Into<String>,
        index: usize,
        reason: impl Into<String>,
    ) -> Self {
        Error::HookConfigInvalid {
            path: path.into(),
            index,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_retryable_status() {
        let err = ProviderError::Api {
            status: 429,
            message: "Too Many Requests".into(),
        };
        assert!(err.is_retryable());

        let err = ProviderError::Api {
            status: 503,
            message: "Service Unavailable".into(),
        };
        assert!(err.is_retryable());

        let err = ProviderError::Api {
            status: 401,
            message: "Unauthorized".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_error_retryable_message_pattern() {
        let err = ProviderError::Api {
            status: 400,
            message: "Model is currently overloaded, please retry".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_provider_error_non_retryable() {
        assert!(!ProviderError::Config("missing api key".into()).is_retryable());
        assert!(!ProviderError::Unsupported("stream_with_tools".into()).is_retryable());
    }

    #[test]
    fn test_all_providers_failed_message() {
        let err = Error::AllProvidersFailed(vec![
            ProviderAttempt {
                provider: "anthropic".into(),
                error: "429".into(),
            },
            ProviderAttempt {
                provider: "openai".into(),
                error: "timeout".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("anthropic: 429"));
        assert!(msg.contains("openai: timeout"));
    }

    #[test]
    fn test_error_config() {
        let err = Error::config("Invalid model");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "invalid configuration: Invalid model");
    }

    #[test]
    fn test_error_timeout() {
        let err = Error::timeout();
        assert!(matches!(err, Error::Timeout));
    }

    #[test]
    fn test_hook_config_invalid_message() {
        let err = Error::hook_config_invalid(".nimbus/hooks.yaml", 2, "empty match pattern");
        assert_eq!(
            err.to_string(),
            "invalid hook configuration in .nimbus/hooks.yaml, definition #2: empty match pattern"
        );
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
