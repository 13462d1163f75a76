//! Credential Resolver boundary (spec §4.5).
//!
//! Synchronous, per-provider lookup of `{api_key?, base_url?, model?}`.
//! Source of truth is `~/.nimbus/auth.json` with a 5-second in-process
//! cache; on any read or parse error, falls back to environment variables
//! using a fixed per-provider mapping. Never raises — returns `None`/empty
//! fields instead (spec §7: "the credential resolver never raises — it
//! returns undefined").

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

const CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credential {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthFile {
    #[allow(dead_code)]
    version: Option<u32>,
    providers: HashMap<String, AuthFileProvider>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthFileProvider {
    #[serde(rename = "apiKey")]
    api_key: Option<String>,
    #[serde(rename = "baseUrl")]
    base_url: Option<String>,
    model: Option<String>,
}

struct Cache {
    loaded_at: Instant,
    providers: HashMap<String, AuthFileProvider>,
}

/// Synchronous credential resolver with a 5-second TTL cache over
/// `~/.nimbus/auth.json`.
pub struct CredentialResolver {
    auth_path: PathBuf,
    cache: Mutex<Option<Cache>>,
}

impl CredentialResolver {
    pub fn new() -> Self {
        let home = std::env::var("HOME").unwrap_or_default();
        Self {
            auth_path: PathBuf::from(home).join(".nimbus").join("auth.json"),
            cache: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_path(auth_path: PathBuf) -> Self {
        Self {
            auth_path,
            cache: Mutex::new(None),
        }
    }

    fn refresh_if_stale(&self) {
        let mut cache = self.cache.lock().unwrap();
        let stale = match cache.as_ref() {
            Some(c) => c.loaded_at.elapsed() >= CACHE_TTL,
            None => true,
        };
        if !stale {
            return;
        }

        match std::fs::read_to_string(&self.auth_path) {
            Ok(contents) => match serde_json::from_str::<AuthFile>(&contents) {
                Ok(parsed) => {
                    *cache = Some(Cache {
                        loaded_at: Instant::now(),
                        providers: parsed.providers,
                    });
                }
                Err(e) => {
                    log::debug!("failed to parse {}: {e}", self.auth_path.display());
                    *cache = Some(Cache {
                        loaded_at: Instant::now(),
                        providers: HashMap::new(),
                    });
                }
            },
            Err(e) => {
                log::debug!("failed to read {}: {e}", self.auth_path.display());
                *cache = Some(Cache {
                    loaded_at: Instant::now(),
                    providers: HashMap::new(),
                });
            }
        }
    }

    /// Resolves credentials for `provider`, preferring the auth file and
    /// falling back to the fixed env-var mapping per spec §4.5/§6.
    pub fn resolve(&self, provider: &str) -> Credential {
        self.refresh_if_stale();

        let from_file = {
            let cache = self.cache.lock().unwrap();
            cache
                .as_ref()
                .and_then(|c| c.providers.get(provider))
                .map(|p| Credential {
                    api_key: p.api_key.clone(),
                    base_url: p.base_url.clone(),
                    model: p.model.clone(),
                })
        };

        let mut credential = from_file.unwrap_or_default();

        if credential.api_key.is_none() {
            credential.api_key = env_key_for_provider(provider).and_then(|var| std::env::var(var).ok());
        }
        if credential.base_url.is_none() && provider == "ollama" {
            credential.base_url = std::env::var("OLLAMA_BASE_URL")
                .ok()
                .or_else(|| Some("http://localhost:11434".to_string()));
        }

        credential
    }

    /// True iff a key exists in either source. Ollama requires only a base
    /// URL (spec §4.5).
    pub fn is_configured(&self, provider: &str) -> bool {
        let credential = self.resolve(provider);
        if provider == "ollama" {
            credential.base_url.is_some()
        } else {
            credential.api_key.is_some()
        }
    }
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn env_key_for_provider(provider: &str) -> Option<&'static str> {
    match provider {
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "google" => Some("GOOGLE_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        "groq" => Some("GROQ_API_KEY"),
        "together" => Some("TOGETHER_API_KEY"),
        "deepseek" => Some("DEEPSEEK_API_KEY"),
        "fireworks" => Some("FIREWORKS_API_KEY"),
        "perplexity" => Some("PERPLEXITY_API_KEY"),
        "ollama" => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_falls_back_to_env() {
        unsafe {
            std::env::set_var("ANTHROPIC_API_KEY", "env-key-123");
        }
        let resolver = CredentialResolver::with_path(PathBuf::from("/nonexistent/auth.json"));
        let cred = resolver.resolve("anthropic");
        assert_eq!(cred.api_key.as_deref(), Some("env-key-123"));
        unsafe {
            std::env::remove_var("ANTHROPIC_API_KEY");
        }
    }

    #[test]
    fn test_malformed_file_falls_back_to_env() {
        let dir = std::env::temp_dir().join(format!("nimbus-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("auth.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, "not json at all").unwrap();

        unsafe {
            std::env::set_var("OPENAI_API_KEY", "fallback-key");
        }
        let resolver = CredentialResolver::with_path(path);
        let cred = resolver.resolve("openai");
        assert_eq!(cred.api_key.as_deref(), Some("fallback-key"));
        unsafe {
            std::env::remove_var("OPENAI_API_KEY");
        }
    }

    #[test]
    fn test_valid_file_takes_priority_over_env() {
        let dir = std::env::temp_dir().join(format!("nimbus-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("auth.json");
        std::fs::write(
            &path,
            r#"{"version":1,"providers":{"anthropic":{"apiKey":"file-key"}}}"#,
        )
        .unwrap();

        unsafe {
            std::env::set_var("ANTHROPIC_API_KEY", "env-key-should-not-win");
        }
        let resolver = CredentialResolver::with_path(path);
        let cred = resolver.resolve("anthropic");
        assert_eq!(cred.api_key.as_deref(), Some("file-key"));
        unsafe {
            std::env::remove_var("ANTHROPIC_API_KEY");
        }
    }

    #[test]
    fn test_ollama_configured_via_base_url_only() {
        let resolver = CredentialResolver::with_path(PathBuf::from("/nonexistent/auth.json"));
        assert!(resolver.is_configured("ollama"));
    }

    #[test]
    fn test_is_configured_false_without_any_source() {
        unsafe {
            std::env::remove_var("FIREWORKS_API_KEY");
        }
        let resolver = CredentialResolver::with_path(PathBuf::from("/nonexistent/auth.json"));
        assert!(!resolver.is_configured("fireworks"));
    }
}
