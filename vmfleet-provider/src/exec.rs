//! External command execution.
//!
//! Shell-driven backends go through [`CommandRunner`] so their command
//! sequences can be inspected in tests without touching the host.

use async_trait::async_trait;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ProviderError, Result};

/// Runs shell command lines.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` through the shell, wait for it and return its combined
    /// stdout and stderr. A non-zero exit is a [`ProviderError::CommandFailed`]
    /// carrying that output.
    async fn run(&self, command: &str) -> Result<String>;

    /// Launch `command` through the shell without waiting for it. Output is
    /// discarded unless the command line redirects it.
    async fn spawn_detached(&self, command: &str) -> Result<()>;
}

/// [`CommandRunner`] backed by a real shell.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self { shell: shell.into() }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<String> {
        debug!(command = %command, "Running shell command");

        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        check_output(command, output)
    }

    async fn spawn_detached(&self, command: &str) -> Result<()> {
        debug!(command = %command, "Launching detached shell command");

        Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProviderError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        Ok(())
    }
}

/// Run `program` with `args` directly (no shell) and return combined output.
///
/// Dropping the future kills the child.
pub async fn run_program(program: &str, args: &[&str]) -> Result<String> {
    let cmdline = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    debug!(command = %cmdline, "Running command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProviderError::Spawn {
            command: cmdline.clone(),
            source: e,
        })?;

    check_output(&cmdline, output)
}

/// Quote `word` for a POSIX shell command line.
///
/// Words made only of characters the shell treats literally are returned
/// unchanged; anything else is single-quoted.
pub fn shell_quote(word: &str) -> String {
    let literal = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '/' | '.' | '_' | '-' | '+' | ',' | ':' | '=' | '@' | '%')
        });
    if literal {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

fn check_output(command: &str, output: Output) -> Result<String> {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if output.status.success() {
        Ok(combined)
    } else {
        warn!(command = %command, status = %output.status, "Command failed");
        Err(ProviderError::CommandFailed {
            command: command.to_string(),
            status: output.status.to_string(),
            output: combined.trim().to_string(),
        })
    }
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shell_runner_returns_stdout() {
        let output = ShellRunner::default().run("echo hello").await.unwrap();
        assert_eq!(output.trim(), "hello");
    }

    #[tokio::test]
    async fn test_shell_runner_failure_carries_combined_output() {
        let err = ShellRunner::default()
            .run("echo to-stdout; echo to-stderr 1>&2; exit 3")
            .await
            .unwrap_err();

        match err {
            ProviderError::CommandFailed { status, output, .. } => {
                assert!(status.contains('3'), "status was {status}");
                assert!(output.contains("to-stdout"));
                assert!(output.contains("to-stderr"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_program_returns_output() {
        let output = run_program("echo", &["disk", "ready"]).await.unwrap();
        assert_eq!(output.trim(), "disk ready");
    }

    #[test]
    fn test_shell_quote_leaves_plain_paths_alone() {
        assert_eq!(
            shell_quote("/var/lib/vmfleet/images/web.img"),
            "/var/lib/vmfleet/images/web.img"
        );
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("my disk"), "'my disk'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_quoted_words_reach_the_program_verbatim() {
        let words = ["web.img; touch /tmp/vmfleet-injected #", "two  spaces", "it's", "$HOME `id`"];
        for word in words {
            let output = ShellRunner::default()
                .run(&format!("printf %s {}", shell_quote(word)))
                .await
                .unwrap();
            assert_eq!(output, word);
        }
    }

    #[tokio::test]
    async fn test_cancelled_program_is_killed() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 1 && touch {}", shell_quote(&marker.to_string_lossy()));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(100), run_program("sh", &["-c", &script])).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = run_program("vmfleet-definitely-missing", &[]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Spawn { .. }));
    }
}
