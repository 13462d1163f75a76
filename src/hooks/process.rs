//! Subprocess execution for a single hook invocation (spec §4.4).
//!
//! Spawns the hook's `command` through the system shell in its own process
//! group, writes the serialized `HookContext` to stdin, and races the
//! child's exit against a timeout. On timeout, the whole process group is
//! killed with `SIGKILL` via `killpg` — a single `child.kill()` only
//! signals the immediate shell, leaving any grandchildren it spawned
//! running, which is why the teacher's own subprocess code isn't reused
//! as-is here.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::config::HookDefinition;
use super::{HookContext, HookOutcome, HookResult};

pub async fn run_hook(definition: &HookDefinition, context: &HookContext) -> HookResult {
    run_hook_with_env(definition, context, &[]).await
}

/// Same as [`run_hook`], additionally setting `envs` on the child process
/// (spec §6 "Hook subprocess environment").
pub async fn run_hook_with_env(
    definition: &HookDefinition,
    context: &HookContext,
    envs: &[(&'static str, String)],
) -> HookResult {
    let started = Instant::now();

    let context_json = match serde_json::to_string(context) {
        Ok(json) => json,
        Err(e) => {
            return HookResult {
                outcome: HookOutcome::AllowedWithWarning,
                message: Some(format!("failed to serialize hook context: {e}")),
                duration: started.elapsed(),
            };
        }
    };

    let mut command = build_command(&definition.command);
    for (key, value) in envs {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return HookResult {
                outcome: HookOutcome::AllowedWithWarning,
                message: Some(format!("failed to spawn hook command: {e}")),
                duration: started.elapsed(),
            };
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(context_json.as_bytes()).await;
        drop(stdin);
    }

    let pid = child.id();
    let wait = async {
        let output = child.wait_with_output().await;
        output
    };

    let duration_budget = Duration::from_millis(definition.timeout_ms);
    match timeout(duration_budget, wait).await {
        Ok(Ok(output)) => {
            let duration = started.elapsed();
            classify_exit(output.status.code(), &output.stdout, &output.stderr, duration)
        }
        Ok(Err(e)) => HookResult {
            outcome: HookOutcome::AllowedWithWarning,
            message: Some(format!("hook process I/O error: {e}")),
            duration: started.elapsed(),
        },
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            HookResult {
                outcome: HookOutcome::AllowedWithWarning,
                message: Some(format!("hook timed out after {}ms", definition.timeout_ms)),
                duration: started.elapsed(),
            }
        }
    }
}

#[cfg(unix)]
fn build_command(shell_command: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(shell_command);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    // Own process group so a timeout kill can take the whole tree with it.
    command.process_group(0);
    command
}

#[cfg(not(unix))]
fn build_command(shell_command: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(shell_command);
    command.stdin(Stdio::piped());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: killpg with a valid pid as a negated group id only sends a
    // signal; it cannot invalidate memory. Failure (e.g. group already
    // reaped) is swallowed — falling back to a direct kill of the pid.
    let result = unsafe { libc::killpg(pid as i32, libc::SIGKILL) };
    if result != 0 {
        let _ = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn classify_exit(code: Option<i32>, stdout: &[u8], stderr: &[u8], duration: Duration) -> HookResult {
    let stdout = String::from_utf8_lossy(stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();

    match code {
        Some(0) => HookResult {
            outcome: HookOutcome::Allowed,
            message: non_empty(stderr).or_else(|| non_empty(stdout)),
            duration,
        },
        Some(2) => HookResult {
            outcome: HookOutcome::Blocked,
            message: Some(non_empty(stderr).or_else(|| non_empty(stdout)).unwrap_or_else(|| "Blocked by hook".to_string())),
            duration,
        },
        Some(other) => HookResult {
            outcome: HookOutcome::AllowedWithWarning,
            message: Some(format!("hook exited with status {other}")),
            duration,
        },
        None => HookResult {
            outcome: HookOutcome::AllowedWithWarning,
            message: Some("hook terminated by signal".to_string()),
            duration,
        },
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_exit_zero_is_allowed() {
        let result = classify_exit(Some(0), b"", b"", Duration::from_millis(1));
        assert_eq!(result.outcome, HookOutcome::Allowed);
        assert!(result.message.is_none());
    }

    #[test]
    fn test_classify_exit_two_is_blocked_with_stderr() {
        let result = classify_exit(Some(2), b"", b"Blocked by policy", Duration::from_millis(1));
        assert_eq!(result.outcome, HookOutcome::Blocked);
        assert_eq!(result.message, Some("Blocked by policy".to_string()));
    }

    #[test]
    fn test_classify_exit_two_defaults_message_when_silent() {
        let result = classify_exit(Some(2), b"", b"", Duration::from_millis(1));
        assert_eq!(result.message, Some("Blocked by hook".to_string()));
    }

    #[test]
    fn test_classify_exit_other_is_warning() {
        let result = classify_exit(Some(1), b"", b"", Duration::from_millis(1));
        assert_eq!(result.outcome, HookOutcome::AllowedWithWarning);
    }

    #[tokio::test]
    async fn test_run_hook_allows_on_exit_zero() {
        let definition = HookDefinition {
            pattern: regex::Regex::new(".*").unwrap(),
            command: "cat >/dev/null; exit 0".to_string(),
            timeout_ms: 5000,
        };
        let context = HookContext {
            tool: "edit_file".to_string(),
            input: serde_json::json!({}),
            session_id: "s1".to_string(),
            agent: "default".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            result: None,
        };
        let result = run_hook(&definition, &context).await;
        assert_eq!(result.outcome, HookOutcome::Allowed);
    }

    #[tokio::test]
    async fn test_run_hook_times_out_and_kills_group() {
        let definition = HookDefinition {
            pattern: regex::Regex::new(".*").unwrap(),
            command: "sleep 5".to_string(),
            timeout_ms: 50,
        };
        let context = HookContext {
            tool: "slow_tool".to_string(),
            input: serde_json::json!({}),
            session_id: "s1".to_string(),
            agent: "default".to_string(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            result: None,
        };
        let result = run_hook(&definition, &context).await;
        assert_eq!(result.outcome, HookOutcome::AllowedWithWarning);
        assert!(result.message.unwrap().contains("timed out"));
    }
}
