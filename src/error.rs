//! Error taxonomy for the execution engine
//!
//! One flat sum type covers every failure class an execution can produce.
//! Adapters wrap transport faults they cannot classify further in
//! [`Error::Adapter`], but let connection, timeout, and command failures
//! through unchanged so callers can drive rollback logic on the kind.

use std::time::Duration;

use thiserror::Error;

use crate::result::ExecutionResult;

/// Broad classification of an [`Error`], independent of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Remote command finished with a non-zero exit code.
    Command,
    /// Deadline elapsed before the command finished.
    Timeout,
    /// Authentication/handshake failure or unreachable host.
    Connection,
    /// Transport or runtime fault the adapter could not classify.
    Adapter,
    /// Container tooling fault (container missing, daemon unreachable).
    Docker,
    /// Pod tooling fault (pod not ready, kubectl absent).
    Kubernetes,
    /// Retry budget exhausted.
    Retry,
    /// Secret unavailable or undecryptable.
    Secret,
    /// Plain I/O failure.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Command => "command",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::Adapter => "adapter",
            ErrorKind::Docker => "docker",
            ErrorKind::Kubernetes => "kubernetes",
            ErrorKind::Retry => "retry",
            ErrorKind::Secret => "secret",
            ErrorKind::Io => "io",
        };
        write!(f, "{}", name)
    }
}

/// Error type for all engine operations
#[derive(Debug, Error)]
pub enum Error {
    /// A command ran to completion but exited non-zero. Only surfaced when
    /// the command's `nothrow` flag is off.
    #[error("command exited with {}: {command}", exit_display(*exit_code, signal))]
    Command {
        /// Sanitized command string (see [`crate::command::Command::sanitize`]).
        command: String,
        /// Exit code, absent for signal-only termination.
        exit_code: Option<i32>,
        /// Terminating signal name, when one was delivered.
        signal: Option<String>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
        /// Wall time the command ran for.
        duration: Duration,
    },

    /// The configured deadline elapsed.
    #[error("command timed out after {timeout:?}: {command}")]
    Timeout {
        command: String,
        timeout: Duration,
    },

    /// Could not reach or authenticate against the target host.
    #[error("connection to {host} failed: {reason}")]
    Connection {
        host: String,
        reason: String,
    },

    /// A transport or runtime fault the adapter could not classify further.
    #[error("{adapter} adapter error: {message}")]
    Adapter {
        adapter: &'static str,
        message: String,
    },

    /// Docker daemon or container fault.
    #[error("docker error: {0}")]
    Docker(String),

    /// Kubernetes tooling fault.
    #[error("kubernetes error: {0}")]
    Kubernetes(String),

    /// Every retry attempt failed.
    #[error("retries exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Number of attempts made (retries + the initial try).
        attempts: u32,
        /// Message of the last transport error, if the final attempt errored
        /// rather than exiting non-zero.
        last_error: Option<String>,
        /// Every interim result, in attempt order.
        results: Vec<ExecutionResult>,
    },

    /// Secret store fault: missing key, failed decryption, disposed handler.
    #[error("secret error: {0}")]
    Secret(String),

    /// I/O fault outside any adapter transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Command { .. } => ErrorKind::Command,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Connection { .. } => ErrorKind::Connection,
            Error::Adapter { .. } => ErrorKind::Adapter,
            Error::Docker(_) => ErrorKind::Docker,
            Error::Kubernetes(_) => ErrorKind::Kubernetes,
            Error::RetryExhausted { .. } => ErrorKind::Retry,
            Error::Secret(_) => ErrorKind::Secret,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for an [`Error::Adapter`] with a formatted message.
    pub fn adapter(adapter: &'static str, message: impl Into<String>) -> Self {
        Error::Adapter {
            adapter,
            message: message.into(),
        }
    }

    /// The aborted-before-start error every adapter raises when a command's
    /// cancellation token fires before any I/O happened.
    pub fn aborted(adapter: &'static str) -> Self {
        Error::Adapter {
            adapter,
            message: "aborted".to_string(),
        }
    }

    /// Whether the error represents a command that ran but exited non-zero,
    /// as opposed to a transport fault.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Error::Command { .. })
    }
}

// Clone by hand: `std::io::Error` is not `Clone`, so rebuild it from its
// kind and message. Needed so coalesced cache waiters can all observe the
// leader's failure.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Command {
                command,
                exit_code,
                signal,
                stdout,
                stderr,
                duration,
            } => Error::Command {
                command: command.clone(),
                exit_code: *exit_code,
                signal: signal.clone(),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                duration: *duration,
            },
            Error::Timeout { command, timeout } => Error::Timeout {
                command: command.clone(),
                timeout: *timeout,
            },
            Error::Connection { host, reason } => Error::Connection {
                host: host.clone(),
                reason: reason.clone(),
            },
            Error::Adapter { adapter, message } => Error::Adapter {
                adapter,
                message: message.clone(),
            },
            Error::Docker(message) => Error::Docker(message.clone()),
            Error::Kubernetes(message) => Error::Kubernetes(message.clone()),
            Error::RetryExhausted {
                attempts,
                last_error,
                results,
            } => Error::RetryExhausted {
                attempts: *attempts,
                last_error: last_error.clone(),
                results: results.clone(),
            },
            Error::Secret(message) => Error::Secret(message.clone()),
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(e: bollard::errors::Error) -> Self {
        Error::Docker(e.to_string())
    }
}

impl From<russh::Error> for Error {
    fn from(e: russh::Error) -> Self {
        Error::Adapter {
            adapter: "ssh",
            message: e.to_string(),
        }
    }
}

fn exit_display(exit_code: Option<i32>, signal: &Option<String>) -> String {
    match (exit_code, signal) {
        (_, Some(sig)) => format!("signal {}", sig),
        (Some(code), None) => format!("code {}", code),
        (None, None) => "unknown status".to_string(),
    }
}

/// Result type for all engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let e = Error::Timeout {
            command: "sleep 5".into(),
            timeout: Duration::from_millis(200),
        };
        assert_eq!(e.kind(), ErrorKind::Timeout);

        let e = Error::adapter("ssh", "sftp-disabled");
        assert_eq!(e.kind(), ErrorKind::Adapter);
        assert!(e.to_string().contains("sftp-disabled"));
    }

    #[test]
    fn test_command_error_display() {
        let e = Error::Command {
            command: "false".into(),
            exit_code: Some(1),
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(3),
        };
        assert!(e.to_string().contains("code 1"));

        let e = Error::Command {
            command: "cat".into(),
            exit_code: None,
            signal: Some("SIGKILL".into()),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(3),
        };
        assert!(e.to_string().contains("signal SIGKILL"));
    }

    #[test]
    fn test_clone_preserves_io_kind() {
        let e = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        match e.clone() {
            Error::Io(inner) => {
                assert_eq!(inner.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected clone: {:?}", other),
        }
    }
}
