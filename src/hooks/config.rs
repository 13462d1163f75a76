//! YAML config loader for `.nimbus/hooks.yaml` (spec §4.4, §6).
//!
//! Grounded on the teacher's `config.rs` pattern of a typed struct loaded
//! via `serde_yaml` with validation folded into the loader rather than left
//! to callers. `regex` is promoted from a hook-matching dependency to the
//! config-validation path: an invalid `match` pattern is caught at load
//! time, not on first dispatch.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};

pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 30_000;

/// The three hook lifecycle events a `.nimbus/hooks.yaml` may configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    PermissionRequest,
}

impl HookEvent {
    fn from_yaml_key(key: &str) -> Option<Self> {
        match key {
            "PreToolUse" => Some(Self::PreToolUse),
            "PostToolUse" => Some(Self::PostToolUse),
            "PermissionRequest" => Some(Self::PermissionRequest),
            _ => None,
        }
    }
}

/// One hook definition: a regex gating which tool names it applies to, the
/// shell command to run, and a timeout (spec §3 `HookDefinition`).
#[derive(Debug, Clone)]
pub struct HookDefinition {
    pub pattern: Regex,
    pub command: String,
    pub timeout_ms: u64,
}

/// Raw, pre-validation shape matching the YAML on disk.
#[derive(Debug, Deserialize)]
struct RawHookDefinition {
    #[serde(rename = "match")]
    match_pattern: String,
    command: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHooksFile {
    #[serde(default)]
    hooks: HashMap<String, Vec<RawHookDefinition>>,
}

/// An ordered sequence of `HookDefinition` per event (spec §3 `HookEventConfig`).
#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    pub pre_tool_use: Vec<HookDefinition>,
    pub post_tool_use: Vec<HookDefinition>,
    pub permission_request: Vec<HookDefinition>,
}

impl HookConfig {
    pub fn for_event(&self, event: HookEvent) -> &[HookDefinition] {
        match event {
            HookEvent::PreToolUse => &self.pre_tool_use,
            HookEvent::PostToolUse => &self.post_tool_use,
            HookEvent::PermissionRequest => &self.permission_request,
        }
    }

    /// Loads `<project>/.nimbus/hooks.yaml`. A missing file is not an error
    /// — the engine operates with empty lists (spec §4.4).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::hook_config_invalid(path.display().to_string(), 0, e.to_string()));
            }
        };
        Self::parse(&contents, path)
    }

    /// Test-only helper to build a config directly from a YAML string
    /// without touching the filesystem.
    #[cfg(test)]
    pub fn load_from_str_for_test(contents: &str) -> Self {
        Self::parse(contents, Path::new("hooks.yaml")).expect("valid test fixture")
    }

    fn parse(contents: &str, path: &Path) -> Result<Self> {
        let raw: RawHooksFile = serde_yaml::from_str(contents)
            .map_err(|e| Error::hook_config_invalid(path.display().to_string(), 0, e.to_string()))?;

        let mut config = Self::default();
        for (event_name, definitions) in raw.hooks {
            let event = HookEvent::from_yaml_key(&event_name).ok_or_else(|| {
                Error::hook_config_invalid(
                    path.display().to_string(),
                    0,
                    format!("unknown hook event '{event_name}'"),
                )
            })?;

            let mut validated = Vec::with_capacity(definitions.len());
            for (index, raw_def) in definitions.into_iter().enumerate() {
                validated.push(validate_definition(raw_def, path, index)?);
            }

            match event {
                HookEvent::PreToolUse => config.pre_tool_use = validated,
                HookEvent::PostToolUse => config.post_tool_use = validated,
                HookEvent::PermissionRequest => config.permission_request = validated,
            }
        }

        Ok(config)
    }
}

fn validate_definition(raw: RawHookDefinition, path: &Path, index: usize) -> Result<HookDefinition> {
    if raw.match_pattern.is_empty() {
        return Err(Error::hook_config_invalid(
            path.display().to_string(),
            index,
            "match must be a non-empty string",
        ));
    }
    if raw.command.is_empty() {
        return Err(Error::hook_config_invalid(
            path.display().to_string(),
            index,
            "command must be a non-empty string",
        ));
    }
    if let Some(timeout) = raw.timeout_ms {
        if timeout == 0 {
            return Err(Error::hook_config_invalid(
                path.display().to_string(),
                index,
                "timeout_ms must be a positive number",
            ));
        }
    }

    let pattern = Regex::new(&raw.match_pattern).map_err(|e| {
        Error::hook_config_invalid(
            path.display().to_string(),
            index,
            format!("match does not compile as a regex: {e}"),
        )
    })?;

    Ok(HookDefinition {
        pattern,
        command: raw.command,
        timeout_ms: raw.timeout_ms.unwrap_or(DEFAULT_HOOK_TIMEOUT_MS),
    })
}
