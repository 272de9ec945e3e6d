//! Process promises and piping
//!
//! A [`ProcessPromise`] is a lazily-started execution handle: the command
//! runs when the promise is awaited (it implements [`IntoFuture`]).
//! Until then it composes — configuration builders apply to the command,
//! and pipes chain further commands fed by the previous stdout.

use std::future::IntoFuture;
use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::command::{Command, StdinPayload};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::result::ExecutionResult;

/// Chain of commands where each link's stdout feeds the next's stdin.
enum Plan {
    Single(Command),
    Piped { source: Box<Plan>, target: Command },
}

impl Plan {
    fn last_mut(&mut self) -> &mut Command {
        match self {
            Plan::Single(cmd) => cmd,
            Plan::Piped { target, .. } => target,
        }
    }

    /// Flatten into execution order, first command first.
    fn into_chain(self) -> Vec<Command> {
        let mut chain = Vec::new();
        let mut current = self;
        loop {
            match current {
                Plan::Single(cmd) => {
                    chain.push(cmd);
                    break;
                }
                Plan::Piped { source, target } => {
                    chain.push(target);
                    current = *source;
                }
            }
        }
        chain.reverse();
        chain
    }
}

/// An in-flight (not yet started) execution.
///
/// Builder methods configure the final command of the chain; `pipe`
/// appends a stage. Awaiting the promise runs the whole chain and
/// resolves to the last stage's result.
pub struct ProcessPromise {
    engine: Engine,
    plan: Plan,
}

impl ProcessPromise {
    pub(crate) fn new(engine: Engine, command: Command) -> Self {
        Self {
            engine,
            plan: Plan::Single(command),
        }
    }

    /// Return failures as results instead of errors.
    pub fn nothrow(mut self) -> Self {
        self.plan.last_mut().nothrow = true;
        self
    }

    /// Suppress per-line output tracing.
    pub fn quiet(mut self) -> Self {
        self.plan.last_mut().quiet = true;
        self
    }

    /// Set the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.plan.last_mut().timeout = Some(timeout);
        self
    }

    /// Set the working directory.
    pub fn cd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plan.last_mut().cwd = Some(dir.into());
        self
    }

    /// Set one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.plan
            .last_mut()
            .env
            .insert(key.into(), value.into());
        self
    }

    /// The cancellation token of the final command.
    pub fn cancel_token(&self) -> CancellationToken {
        match &self.plan {
            Plan::Single(cmd) => cmd.cancel.clone(),
            Plan::Piped { target, .. } => target.cancel.clone(),
        }
    }

    /// Pipe this promise's stdout into another command's stdin. The
    /// source resolves first; a failing source aborts the pipe unless its
    /// `nothrow` flag is set.
    pub fn pipe(self, target: Command) -> Self {
        Self {
            engine: self.engine.clone(),
            plan: Plan::Piped {
                source: Box::new(self.plan),
                target,
            },
        }
    }

    /// Run the chain to completion.
    pub async fn run(self) -> Result<ExecutionResult> {
        let chain = self.plan.into_chain();
        let engine = self.engine;

        let mut previous: Option<ExecutionResult> = None;
        for mut command in chain {
            if let Some(prev) = previous.take() {
                command.stdin = StdinPayload::text(prev.stdout);
            }
            // A failing stage without nothrow raises here and aborts the
            // chain; with nothrow its (possibly empty) stdout flows on.
            let result = engine.execute_now(command).await?;
            previous = Some(result);
        }
        previous.ok_or_else(|| Error::adapter("engine", "empty execution chain"))
    }

    /// Resolve the promise and stream its stdout into a byte sink.
    pub async fn pipe_into<W>(self, mut sink: W) -> Result<ExecutionResult>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let result = self.run().await?;
        sink.write_all(result.stdout.as_bytes())
            .await
            .map_err(Error::Io)?;
        sink.flush().await.map_err(Error::Io)?;
        Ok(result)
    }

    /// Resolve the promise and invoke `handler` once per non-empty
    /// stdout line.
    pub async fn pipe_lines<F>(self, mut handler: F) -> Result<ExecutionResult>
    where
        F: FnMut(&str) + Send,
    {
        let result = self.run().await?;
        for line in result.stdout.lines() {
            if !line.is_empty() {
                handler(line);
            }
        }
        Ok(result)
    }

    /// Resolve the promise, then let `factory` decide on a follow-up
    /// command fed with the stdout. `None` short-circuits.
    pub async fn pipe_when<F>(self, factory: F) -> Result<Option<ExecutionResult>>
    where
        F: FnOnce(&ExecutionResult) -> Option<Command> + Send,
    {
        let engine = self.engine.clone();
        let result = self.run().await?;
        match factory(&result) {
            Some(mut command) => {
                command.stdin = StdinPayload::text(result.stdout);
                engine.execute_now(command).await.map(Some)
            }
            None => Ok(None),
        }
    }
}

impl IntoFuture for ProcessPromise {
    type Output = Result<ExecutionResult>;
    type IntoFuture = BoxFuture<'static, Result<ExecutionResult>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockResponse;

    #[tokio::test]
    async fn test_pipe_feeds_stdout_to_stdin() {
        let engine = Engine::new();
        let result = engine
            .sh("printf 'one\\ntwo\\nthree\\n'")
            .pipe(Command::shell("wc -l"))
            .await
            .unwrap();
        assert_eq!(result.text(), "3");
    }

    #[tokio::test]
    async fn test_pipe_chain_of_three() {
        let engine = Engine::new();
        let result = engine
            .sh("printf 'b\\na\\nc\\n'")
            .pipe(Command::shell("sort"))
            .pipe(Command::shell("head -n 1"))
            .await
            .unwrap();
        assert_eq!(result.text(), "a");
    }

    #[tokio::test]
    async fn test_failed_source_aborts_pipe() {
        let engine = Engine::new().mock();
        engine
            .mock_adapter()
            .respond_to("fail", MockResponse::fail(3, ""));
        engine
            .mock_adapter()
            .respond_to("sink", MockResponse::ok("never"));

        let err = engine
            .run(Command::shell("fail"))
            .pipe(Command::shell("sink"))
            .await
            .unwrap_err();
        assert!(err.is_command_failure());
        assert_eq!(engine.mock_adapter().call_count("sink"), 0);
    }

    #[tokio::test]
    async fn test_pipe_into_writer() {
        let engine = Engine::new();
        let mut sink = Vec::new();
        engine
            .sh("printf 'captured'")
            .pipe_into(&mut sink)
            .await
            .unwrap();
        assert_eq!(sink, b"captured");
    }

    #[tokio::test]
    async fn test_pipe_lines() {
        let engine = Engine::new();
        let mut seen = Vec::new();
        engine
            .sh("printf 'x\\n\\ny\\n'")
            .pipe_lines(|line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn test_pipe_when_conditional() {
        let engine = Engine::new();
        let followed = engine
            .sh("echo 42")
            .pipe_when(|result| {
                if result.text() == "42" {
                    Some(Command::shell("cat"))
                } else {
                    None
                }
            })
            .await
            .unwrap();
        assert_eq!(followed.unwrap().text(), "42");

        let skipped = engine
            .sh("echo 1")
            .pipe_when(|_| None)
            .await
            .unwrap();
        assert!(skipped.is_none());
    }

    #[tokio::test]
    async fn test_builder_methods_apply_to_last_stage() {
        let engine = Engine::new().mock();
        let promise = engine
            .run(Command::shell("a"))
            .pipe(Command::shell("b"))
            .env("K", "v")
            .nothrow();
        match &promise.plan {
            Plan::Piped { target, .. } => {
                assert!(target.nothrow);
                assert_eq!(target.env.get("K").map(String::as_str), Some("v"));
            }
            _ => panic!("expected piped plan"),
        }
    }

    #[tokio::test]
    async fn test_json_through_pipe() {
        let engine = Engine::new();
        let result = engine
            .sh("printf '{\"a\":1}'")
            .pipe(Command::shell("cat"))
            .await
            .unwrap();
        let value: serde_json::Value = result.json().unwrap();
        assert_eq!(value["a"], 1);
    }
}
