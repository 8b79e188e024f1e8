//! # Action Executor
//!
//! Runs a single policy action, or describes it in dry-run mode.
//!
//! Supported action types:
//! - `shell` / `cmd`: the platform shell (`sh -c`, or `cmd /C` on Windows)
//! - `powershell`: `powershell -NoProfile -Command` on Windows, the platform
//!   shell elsewhere
//! - `webhook`: HTTP POST of the alert as JSON to the URL in `command`
//!
//! Execution never returns an error. Failures become a non-zero return code
//! and an `ERROR:` output so the caller can record them and move on.

use std::process::Command;
use std::time::Duration;

use super::policy::Action;
use crate::Alert;

/// Return code and combined output of one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub return_code: i32,
    pub output: String,
}

impl ActionOutcome {
    fn error(message: impl std::fmt::Display) -> Self {
        Self {
            return_code: 1,
            output: format!("ERROR: {}", message),
        }
    }
}

/// Execute `action` for `alert`.
///
/// # Arguments
/// * `action` - The policy action.
/// * `alert` - The alert that matched; sent as the webhook payload.
/// * `dry_run` - Describe the action instead of running it.
/// * `webhook_timeout` - Timeout for HTTP actions.
pub fn execute(action: &Action, alert: &Alert, dry_run: bool, webhook_timeout: Duration) -> ActionOutcome {
    if dry_run {
        return ActionOutcome {
            return_code: 0,
            output: format!("DRY-RUN {}: {}", action.kind, action.command),
        };
    }

    match action.kind.to_ascii_lowercase().as_str() {
        "shell" | "cmd" => run_process(shell_command(&action.command)),
        "powershell" => run_process(powershell_command(&action.command)),
        "webhook" => post_webhook(&action.command, alert, webhook_timeout),
        other => ActionOutcome::error(format!("unsupported action type '{}'", other)),
    }
}

fn shell_command(script: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", script]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }
}

fn powershell_command(script: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-Command", script]);
        cmd
    } else {
        shell_command(script)
    }
}

fn run_process(mut command: Command) -> ActionOutcome {
    match command.output() {
        Ok(output) => {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            ActionOutcome {
                // Killed by a signal: no code.
                return_code: output.status.code().unwrap_or(1),
                output: text.trim().to_string(),
            }
        }
        Err(e) => ActionOutcome::error(format!("failed to start {:?}: {}", command.get_program(), e)),
    }
}

fn post_webhook(url: &str, alert: &Alert, timeout: Duration) -> ActionOutcome {
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return ActionOutcome::error(format!(
            "webhook URL must start with http:// or https://, got: {}",
            url
        ));
    }

    let payload = match serde_json::to_string(alert) {
        Ok(p) => p,
        Err(e) => return ActionOutcome::error(e),
    };

    let agent = ureq::AgentBuilder::new().timeout(timeout).build();
    let result = agent
        .post(url)
        .set("Content-Type", "application/json")
        .send_string(&payload);

    match result {
        Ok(response) => ActionOutcome {
            return_code: 0,
            output: format!("POST {} -> {}", url, response.status()),
        },
        Err(ureq::Error::Status(code, _)) => ActionOutcome {
            return_code: i32::from(code),
            output: format!("POST {} -> {}", url, code),
        },
        Err(e) => ActionOutcome::error(format!("POST {} failed: {}", url, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EnsembleRecord;
    use chrono::Utc;

    fn alert() -> Alert {
        Alert {
            record: EnsembleRecord {
                timestamp: Utc::now(),
                host: Some("h1".to_string()),
                user: None,
                source_ip: None,
                destination_ip: None,
                session_id: Some(3),
                score_a: 0.1,
                score_b: Some(40.0),
                score_a_norm: 0.0,
                score_b_norm: 1.0,
                ensemble_score: 1.0,
            },
            threshold: 0.9,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_dry_run_never_executes() {
        let action = Action::new("shell", "definitely-not-a-command");
        let out = execute(&action, &alert(), true, TIMEOUT);
        assert_eq!(out.return_code, 0);
        assert_eq!(out.output, "DRY-RUN shell: definitely-not-a-command");
    }

    #[test]
    fn test_unknown_type_is_recorded_as_error() {
        let out = execute(&Action::new("carrier-pigeon", "x"), &alert(), false, TIMEOUT);
        assert_eq!(out.return_code, 1);
        assert!(out.output.starts_with("ERROR:"));
    }

    #[test]
    fn test_bad_webhook_url() {
        let out = execute(&Action::new("webhook", "ftp://nope"), &alert(), false, TIMEOUT);
        assert_eq!(out.return_code, 1);
        assert!(out.output.contains("http://"));
    }

    #[cfg(unix)]
    #[test]
    fn test_shell_captures_output_and_code() {
        let out = execute(&Action::new("shell", "echo out; echo err 1>&2; exit 3"), &alert(), false, TIMEOUT);
        assert_eq!(out.return_code, 3);
        assert_eq!(out.output, "out\nerr");
    }

    #[cfg(unix)]
    #[test]
    fn test_powershell_falls_back_to_shell() {
        let out = execute(&Action::new("powershell", "echo ok"), &alert(), false, TIMEOUT);
        assert_eq!(out, ActionOutcome { return_code: 0, output: "ok".to_string() });
    }
}
