//! Deterministic mock adapter for tests
//!
//! Responses come from a table keyed by the rendered command string.
//! Unmatched commands get the configurable default. Every call is
//! recorded for assertion.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::Adapter;
use crate::command::Command;
use crate::error::{Error, Result};
use crate::escape::Platform;
use crate::result::{ExecutionResult, ResultBuilder};

/// Canned response for one command.
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// Stdout to report.
    pub stdout: String,
    /// Stderr to report.
    pub stderr: String,
    /// Exit code to report.
    pub exit_code: i32,
    /// Simulated execution time.
    pub delay: Option<Duration>,
    /// Fail the call with an adapter error instead of completing.
    pub error: Option<String>,
}

impl MockResponse {
    /// Successful response with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            delay: None,
            error: None,
        }
    }

    /// Failing response with the given exit code and stderr.
    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
            delay: None,
            error: None,
        }
    }

    /// Transport-error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            delay: None,
            error: Some(message.into()),
        }
    }

    /// Add a simulated delay.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Adapter backed by a response table.
pub struct MockAdapter {
    responses: parking_lot::Mutex<HashMap<String, MockResponse>>,
    default: parking_lot::Mutex<MockResponse>,
    calls: parking_lot::Mutex<Vec<String>>,
}

impl MockAdapter {
    /// Adapter whose default response is an empty success.
    pub fn new() -> Self {
        Self {
            responses: parking_lot::Mutex::new(HashMap::new()),
            default: parking_lot::Mutex::new(MockResponse::ok("")),
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Register the response for an exact command string.
    pub fn respond_to(&self, command: impl Into<String>, response: MockResponse) {
        self.responses.lock().insert(command.into(), response);
    }

    /// Replace the default response for unmatched commands.
    pub fn default_response(&self, response: MockResponse) {
        *self.default.lock() = response;
    }

    /// Every command string executed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// How many times the exact command string was executed.
    pub fn call_count(&self, command: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == command).count()
    }

    /// Forget recorded calls.
    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn execute(&self, command: Command) -> Result<ExecutionResult> {
        if command.cancel.is_cancelled() {
            return Err(Error::aborted("mock"));
        }

        let command_string = command.command_string(Platform::Unix);
        self.calls.lock().push(command_string.clone());

        let response = self
            .responses
            .lock()
            .get(&command_string)
            .cloned()
            .unwrap_or_else(|| self.default.lock().clone());

        let builder = ResultBuilder::start(command.display_string(), "mock")
            .cwd(command.cwd.clone());

        if let Some(delay) = response.delay {
            match command.timeout {
                Some(deadline) if deadline < delay => {
                    tokio::time::sleep(deadline).await;
                    if command.nothrow {
                        return Ok(builder.finish_timed_out());
                    }
                    return Err(Error::Timeout {
                        command: command.display_string(),
                        timeout: deadline,
                    });
                }
                _ => tokio::time::sleep(delay).await,
            }
        }

        if let Some(message) = response.error {
            return Err(Error::adapter("mock", message));
        }

        Ok(builder.finish(
            response.stdout.into_bytes(),
            response.stderr.into_bytes(),
            Some(response.exit_code),
            None,
        ))
    }

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_response() {
        let mock = MockAdapter::new();
        mock.respond_to("uname -r", MockResponse::ok("6.1.0\n"));

        let result = mock
            .execute(Command::new("uname").arg("-r"))
            .await
            .unwrap();
        assert_eq!(result.text(), "6.1.0");
        assert_eq!(mock.call_count("uname -r"), 1);
    }

    #[tokio::test]
    async fn test_default_response() {
        let mock = MockAdapter::new();
        mock.default_response(MockResponse::fail(1, "unknown command"));

        let result = mock.execute(Command::shell("anything")).await.unwrap();
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.stderr, "unknown command");
    }

    #[tokio::test]
    async fn test_error_response() {
        let mock = MockAdapter::new();
        mock.respond_to("boom", MockResponse::error("host unreachable"));
        let err = mock.execute(Command::shell("boom")).await.unwrap_err();
        assert!(err.to_string().contains("host unreachable"));
    }

    #[tokio::test]
    async fn test_delay_honors_timeout() {
        let mock = MockAdapter::new();
        mock.respond_to(
            "slow",
            MockResponse::ok("late").after(Duration::from_secs(10)),
        );

        let result = mock
            .execute(
                Command::shell("slow")
                    .timeout(Duration::from_millis(20))
                    .nothrow(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(124));
    }

    #[tokio::test]
    async fn test_calls_recorded_in_order() {
        let mock = MockAdapter::new();
        mock.execute(Command::shell("first")).await.unwrap();
        mock.execute(Command::shell("second")).await.unwrap();
        assert_eq!(mock.calls(), vec!["first".to_string(), "second".to_string()]);
    }
}
