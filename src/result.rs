//! Uniform execution result record
//!
//! Every adapter resolves to the same [`ExecutionResult`] shape regardless
//! of where the command ran.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Outcome of one command execution.
///
/// Invariant: [`ok`](ExecutionResult::ok) holds exactly when the exit code
/// is zero and no terminating signal was delivered.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,

    /// Captured standard error (lossy UTF-8).
    pub stderr: String,

    /// Exit code; `None` when the process died to a signal without a code.
    pub exit_code: Option<i32>,

    /// Terminating signal name (`SIGTERM`, `SIGKILL`, …), if any.
    pub signal: Option<String>,

    /// When the adapter started the command.
    pub started_at: DateTime<Utc>,

    /// When the command finished (or was given up on).
    pub finished_at: DateTime<Utc>,

    /// The command string as executed (post-quoting, post-sudo-wrapping
    /// excluded: the original caller-visible form).
    pub command: String,

    /// Working directory the command ran in, when one was set.
    pub cwd: Option<PathBuf>,

    /// Name of the adapter that produced this result.
    pub adapter: String,

    /// Adapter-specific metadata (pool key, container id, pod name, …).
    pub metadata: HashMap<String, String>,
}

impl ExecutionResult {
    /// Whether the command succeeded.
    pub fn ok(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }

    /// Wall time between start and finish.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Combined stdout and stderr, stdout first.
    pub fn stdall(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }

    /// Trimmed stdout.
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }

    /// Parse trimmed stdout as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.text()).map_err(|e| {
            Error::adapter("result", format!("failed to parse stdout as JSON: {}", e))
        })
    }

    /// Non-empty stdout lines.
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Raw stdout bytes.
    pub fn buffer(&self) -> &[u8] {
        self.stdout.as_bytes()
    }

    /// Build the synthetic timeout result used under `nothrow`: exit code
    /// 124 with a synthesized `SIGTERM`.
    pub fn synthetic_timeout(
        command: String,
        cwd: Option<PathBuf>,
        adapter: &str,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(124),
            signal: Some("SIGTERM".to_string()),
            started_at,
            finished_at: Utc::now(),
            command,
            cwd,
            adapter: adapter.to_string(),
            metadata: HashMap::new(),
        }
    }

    /// Convert into the matching [`Error::Command`] for the throwing path.
    pub fn into_command_error(self) -> Error {
        let duration = self.duration();
        Error::Command {
            command: self.command,
            exit_code: self.exit_code,
            signal: self.signal,
            stdout: self.stdout,
            stderr: self.stderr,
            duration,
        }
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Construction helper used by adapters and tests.
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    command: String,
    cwd: Option<PathBuf>,
    adapter: String,
    started_at: DateTime<Utc>,
    metadata: HashMap<String, String>,
}

impl ResultBuilder {
    /// Start a result for the given command; records the start timestamp.
    pub fn start(command: impl Into<String>, adapter: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            adapter: adapter.into(),
            started_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Set the working directory recorded on the result.
    pub fn cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    /// Attach adapter-specific metadata.
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The recorded start timestamp.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Finish the result with the given streams and status.
    pub fn finish(
        self,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: Option<i32>,
        signal: Option<String>,
    ) -> ExecutionResult {
        ExecutionResult {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            signal,
            started_at: self.started_at,
            finished_at: Utc::now(),
            command: self.command,
            cwd: self.cwd,
            adapter: self.adapter,
            metadata: self.metadata,
        }
    }

    /// Finish as the synthetic `nothrow` timeout result.
    pub fn finish_timed_out(self) -> ExecutionResult {
        ExecutionResult::synthetic_timeout(self.command, self.cwd, &self.adapter, self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stdout: &str, code: i32) -> ExecutionResult {
        ResultBuilder::start("echo test", "mock").finish(
            stdout.as_bytes().to_vec(),
            Vec::new(),
            Some(code),
            None,
        )
    }

    #[test]
    fn test_ok_invariant() {
        assert!(sample("", 0).ok());
        assert!(!sample("", 1).ok());

        let mut signalled = sample("", 0);
        signalled.signal = Some("SIGTERM".into());
        assert!(!signalled.ok());
    }

    #[test]
    fn test_text_and_display_trim() {
        let r = sample("  hello\n", 0);
        assert_eq!(r.text(), "hello");
        assert_eq!(r.to_string(), "hello");
    }

    #[test]
    fn test_json_decoding() {
        let r = sample("{\"a\": 1}\n", 0);
        let v: serde_json::Value = r.json().unwrap();
        assert_eq!(v["a"], 1);

        let bad = sample("not json", 0);
        assert!(bad.json::<serde_json::Value>().is_err());
    }

    #[test]
    fn test_lines_skips_empty() {
        let r = sample("a\n\nb\n", 0);
        assert_eq!(r.lines(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_synthetic_timeout_shape() {
        let r = ExecutionResult::synthetic_timeout("sleep 5".into(), None, "local", Utc::now());
        assert_eq!(r.exit_code, Some(124));
        assert_eq!(r.signal.as_deref(), Some("SIGTERM"));
        assert!(!r.ok());
    }
}
