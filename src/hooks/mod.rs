//! Hook Execution Engine (spec §1, §4.4): an out-of-process subprocess
//! supervisor for user-declared shell commands around tool invocations.
//!
//! Supersedes the teacher's in-process `Hooks` callback registry
//! (`hooks.rs`) — that design works for a single-process embedding but the
//! spec's hook model is deliberately out-of-process: commands declared in
//! YAML, run through a shell, with JSON on stdin and an exit-code
//! contract, so hooks can be written in any language and sandboxed
//! independently of the router's own process.

pub mod config;
pub mod process;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use config::{HookConfig, HookDefinition, HookEvent};

/// Passed to the hook subprocess on stdin as JSON (spec §3 `HookContext`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookContext {
    pub tool: String,
    pub input: Value,
    pub session_id: String,
    pub agent: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<HookToolResult>,
}

/// PostToolUse-only payload describing what the tool produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookToolResult {
    pub output: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Allowed,
    Blocked,
    AllowedWithWarning,
}

/// The result of running one hook (spec §4.4 step 5-6).
#[derive(Debug, Clone)]
pub struct HookResult {
    pub outcome: HookOutcome,
    pub message: Option<String>,
    pub duration: Duration,
}

impl HookResult {
    pub fn is_allowed(&self) -> bool {
        !matches!(self.outcome, HookOutcome::Blocked)
    }
}

/// Aggregate verdict from `run_pre_tool_hooks` / `run_permission_hooks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookDecision {
    pub allowed: bool,
    pub message: Option<String>,
}

impl HookDecision {
    fn allow() -> Self {
        Self { allowed: true, message: None }
    }

    fn block(message: Option<String>) -> Self {
        Self { allowed: false, message }
    }
}

fn matching_hooks<'a>(definitions: &'a [HookDefinition], tool_name: &str) -> Vec<&'a HookDefinition> {
    definitions.iter().filter(|d| d.pattern.is_match(tool_name)).collect()
}

fn env_vars(context: &HookContext) -> Vec<(&'static str, String)> {
    vec![
        ("NIMBUS_HOOK_EVENT", context.tool.clone()),
        ("NIMBUS_HOOK_AGENT", context.agent.clone()),
        ("NIMBUS_HOOK_SESSION", context.session_id.clone()),
    ]
}

/// Runs every PreToolUse hook matching `context.tool`, in order. Returns
/// blocked the moment any hook blocks (message = that hook's message);
/// otherwise allowed (spec §4.4 "Aggregate decisions").
pub async fn run_pre_tool_hooks(config: &HookConfig, context: &HookContext) -> HookDecision {
    run_gating_hooks(matching_hooks(config.for_event(HookEvent::PreToolUse), &context.tool), context).await
}

/// Runs every PermissionRequest hook matching `context.tool`. Same
/// aggregation rule as `run_pre_tool_hooks`.
pub async fn run_permission_hooks(config: &HookConfig, context: &HookContext) -> HookDecision {
    run_gating_hooks(matching_hooks(config.for_event(HookEvent::PermissionRequest), &context.tool), context).await
}

async fn run_gating_hooks(hooks: Vec<&HookDefinition>, context: &HookContext) -> HookDecision {
    for definition in hooks {
        let result = process::run_hook_with_env(definition, context, &env_vars(context)).await;
        if result.outcome == HookOutcome::Blocked {
            return HookDecision::block(result.message);
        }
    }
    HookDecision::allow()
}

/// Runs every PostToolUse hook matching `context.tool`. Fire-and-forget:
/// results exist for side effects (formatting, auditing), not aggregated
/// into a decision (spec §4.4).
pub async fn run_post_tool_hooks(config: &HookConfig, context: &HookContext) {
    for definition in matching_hooks(config.for_event(HookEvent::PostToolUse), &context.tool) {
        let _ = process::run_hook_with_env(definition, context, &env_vars(context)).await;
    }
}

/// Loads `.nimbus/hooks.yaml` under `project_dir`. A missing file yields an
/// empty config (spec §4.4).
pub fn load_hook_config(project_dir: impl AsRef<Path>) -> crate::error::Result<HookConfig> {
    HookConfig::load(project_dir.as_ref().join(".nimbus").join("hooks.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::HookEvent as Event;

    fn context(tool: &str) -> HookContext {
        HookContext {
            tool: tool.to_string(),
            input: serde_json::json!({}),
            session_id: "s1".to_string(),
            agent: "default".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            result: None,
        }
    }

    #[tokio::test]
    async fn test_pre_tool_hooks_block_on_exit_two() {
        let yaml = r#"
hooks:
  PreToolUse:
    - match: "^edit_"
      command: "echo -n 'Blocked by policy' 1>&2; exit 2"
"#;
        let config = HookConfig::load_from_str_for_test(yaml);
        let decision = run_pre_tool_hooks(&config, &context("edit_file")).await;
        assert!(!decision.allowed);
        assert_eq!(decision.message, Some("Blocked by policy".to_string()));
    }

    #[tokio::test]
    async fn test_pre_tool_hooks_allow_when_no_match() {
        let yaml = r#"
hooks:
  PreToolUse:
    - match: "^delete_"
      command: "exit 2"
"#;
        let config = HookConfig::load_from_str_for_test(yaml);
        let decision = run_pre_tool_hooks(&config, &context("edit_file")).await;
        assert!(decision.allowed);
    }

    #[test]
    fn test_matching_hooks_preserves_order() {
        let yaml = r#"
hooks:
  PreToolUse:
    - match: ".*"
      command: "first"
    - match: ".*"
      command: "second"
"#;
        let config = HookConfig::load_from_str_for_test(yaml);
        let matched = matching_hooks(config.for_event(Event::PreToolUse), "any_tool");
        assert_eq!(matched[0].command, "first");
        assert_eq!(matched[1].command, "second");
    }
}
