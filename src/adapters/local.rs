//! Local process adapter
//!
//! Runs commands on the host the engine lives in, via `tokio::process`.
//! Shell-mode commands go through `/bin/sh -c` (or the configured shell);
//! no-shell commands exec their argv directly.

use async_trait::async_trait;

use super::subprocess::{self, SpawnSpec};
use super::Adapter;
use crate::command::{Command, ShellMode};
use crate::error::Result;
use crate::escape::Platform;
use crate::result::ExecutionResult;

/// Adapter for the local host.
pub struct LocalAdapter;

impl LocalAdapter {
    /// New local adapter.
    pub fn new() -> Self {
        Self
    }

    fn build_argv(command: &Command) -> Result<Vec<String>> {
        match command.shell_program() {
            Some(shell) => Ok(vec![
                shell,
                "-c".to_string(),
                command.command_string(Platform::Unix),
            ]),
            None => command.argv(),
        }
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for LocalAdapter {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, command: Command) -> Result<ExecutionResult> {
        let argv = Self::build_argv(&command)?;
        subprocess::run(
            "local",
            &command,
            SpawnSpec {
                argv,
                apply_cwd: true,
                apply_env: true,
            },
        )
        .await
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::StdinPayload;
    use crate::error::Error;
    use std::time::Duration;

    #[tokio::test]
    async fn test_echo() {
        let adapter = LocalAdapter::new();
        let result = adapter
            .execute(Command::shell("echo hello"))
            .await
            .unwrap();
        assert!(result.ok());
        assert_eq!(result.text(), "hello");
        assert_eq!(result.adapter, "local");
    }

    #[tokio::test]
    async fn test_argv_no_shell() {
        let adapter = LocalAdapter::new();
        let result = adapter
            .execute(Command::new("echo").arg("a b").no_shell())
            .await
            .unwrap();
        assert_eq!(result.text(), "a b");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_result() {
        let adapter = LocalAdapter::new();
        let result = adapter.execute(Command::shell("exit 7")).await.unwrap();
        assert_eq!(result.exit_code, Some(7));
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let adapter = LocalAdapter::new();
        let result = adapter
            .execute(
                Command::shell("echo $MARKER && pwd")
                    .env_var("MARKER", "present")
                    .cwd("/tmp"),
            )
            .await
            .unwrap();
        let lines = result.lines();
        assert_eq!(lines[0], "present");
        // /tmp may be a symlink (macOS); compare the resolved path.
        let expected = std::fs::canonicalize("/tmp").unwrap();
        assert_eq!(
            std::fs::canonicalize(&lines[1]).unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_stdin_payload() {
        let adapter = LocalAdapter::new();
        let result = adapter
            .execute(Command::shell("cat").stdin(StdinPayload::text("piped in")))
            .await
            .unwrap();
        assert_eq!(result.text(), "piped in");
    }

    #[tokio::test]
    async fn test_timeout_throws_without_nothrow() {
        let adapter = LocalAdapter::new();
        let err = adapter
            .execute(Command::shell("sleep 5").timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_timeout_nothrow_synthesizes_124() {
        let adapter = LocalAdapter::new();
        let started = std::time::Instant::now();
        let result = adapter
            .execute(
                Command::shell("sleep 5")
                    .timeout(Duration::from_millis(200))
                    .nothrow(),
            )
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(result.exit_code, Some(124));
        assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let adapter = LocalAdapter::new();
        let cmd = Command::shell("sleep 5");
        let token = cmd.cancel.clone();
        let run = tokio::spawn(async move { adapter.execute(cmd).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let err = run.await.unwrap().unwrap_err();
        match err {
            Error::Adapter { message, .. } => assert_eq!(message, "aborted"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stderr_capture() {
        let adapter = LocalAdapter::new();
        let result = adapter
            .execute(Command::shell("echo out && echo err >&2"))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
        assert!(result.stdall().contains("out"));
        assert!(result.stdall().contains("err"));
    }
}
