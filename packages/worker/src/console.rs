//! The stock `Console` handlers.
//!
//! `run_console` interprets the task configuration as a shell command line
//! and runs it through the OS shell; `run_powershell` does the same through
//! PowerShell. Both capture stdout/stderr and map exit 0 to success and
//! anything else to a non-retryable failure.
//!
//! The worker enforces the wall-clock budget by dropping the handler
//! future; children are spawned with `kill_on_drop` so the drop takes the
//! process down with it. Grandchildren a shell forked off may survive a
//! kill; that is the documented best-effort boundary.

use std::process::Stdio;
use std::time::Duration;

use runinator_core::handler::{ActionRegistry, HandlerOutcome};

/// Cap on the stderr excerpt carried in failure messages.
const STDERR_EXCERPT_LEN: usize = 512;

/// Registry with the stock handlers installed.
pub fn default_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register("Console", "run_console", run_console);
    registry.register("Console", "run_powershell", run_powershell);
    registry
}

async fn run_console(configuration: Vec<u8>, _budget: Duration) -> HandlerOutcome {
    let Some(command_line) = decode_command(configuration) else {
        return invalid_configuration();
    };
    if cfg!(windows) {
        run_shell("cmd", &["/C"], &command_line).await
    } else {
        run_shell("sh", &["-c"], &command_line).await
    }
}

async fn run_powershell(configuration: Vec<u8>, _budget: Duration) -> HandlerOutcome {
    let Some(command_line) = decode_command(configuration) else {
        return invalid_configuration();
    };
    if cfg!(windows) {
        run_shell("powershell", &["-NoProfile", "-Command"], &command_line).await
    } else {
        run_shell("pwsh", &["-NoProfile", "-Command"], &command_line).await
    }
}

fn decode_command(configuration: Vec<u8>) -> Option<String> {
    let command = String::from_utf8(configuration).ok()?;
    if command.trim().is_empty() {
        return None;
    }
    Some(command)
}

fn invalid_configuration() -> HandlerOutcome {
    HandlerOutcome::Failure {
        message: "configuration is not a usable command line".to_string(),
        retryable: false,
    }
}

async fn run_shell(program: &str, args: &[&str], command_line: &str) -> HandlerOutcome {
    let child = tokio::process::Command::new(program)
        .args(args)
        .arg(command_line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return HandlerOutcome::Failure {
                message: format!("failed to spawn {program}: {e}"),
                retryable: false,
            }
        }
    };

    match child.wait_with_output().await {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            HandlerOutcome::Success {
                stdout: if stdout.is_empty() { None } else { Some(stdout) },
            }
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT_LEN).collect();
            HandlerOutcome::Failure {
                message: match output.status.code() {
                    Some(code) => format!("exit code {code}: {}", excerpt.trim()),
                    None => format!("terminated by signal: {}", excerpt.trim()),
                },
                retryable: false,
            }
        }
        Err(e) => HandlerOutcome::Failure {
            message: format!("failed to collect {program} output: {e}"),
            retryable: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> Duration {
        Duration::from_secs(5)
    }

    #[test]
    fn test_stock_handlers_are_registered() {
        let registry = default_registry();
        assert!(registry.is_registered("Console", "run_console"));
        assert!(registry.is_registered("Console", "run_powershell"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_console_captures_stdout() {
        let outcome = run_console(b"echo hi".to_vec(), budget()).await;
        match outcome {
            HandlerOutcome::Success { stdout } => {
                assert_eq!(stdout.as_deref().map(str::trim), Some("hi"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_console_nonzero_exit_is_failure() {
        let outcome = run_console(b"echo oops >&2; exit 3".to_vec(), budget()).await;
        match outcome {
            HandlerOutcome::Failure { message, retryable } => {
                assert!(message.contains("exit code 3"));
                assert!(message.contains("oops"));
                assert!(!retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_configuration_is_rejected() {
        let outcome = run_console(vec![0xff, 0xfe, 0x00], budget()).await;
        assert!(matches!(
            outcome,
            HandlerOutcome::Failure { retryable: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_blank_configuration_is_rejected() {
        let outcome = run_console(b"   ".to_vec(), budget()).await;
        assert!(matches!(
            outcome,
            HandlerOutcome::Failure { retryable: false, .. }
        ));
    }
}
