//! Shared subprocess driver
//!
//! The local and Kubernetes adapters both spawn a child process and need
//! the same plumbing: stdin feeding, bounded capture of both output
//! streams, deadline enforcement with a kill, and cancellation. This
//! module is that plumbing.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tracing::{debug, warn};

use crate::command::{Command, OutputMode, StdinPayload};
use crate::error::{Error, Result};
use crate::result::{ExecutionResult, ResultBuilder};
use crate::stream::{LineCallback, OutputCollector, OverflowBehavior, StreamError};

/// How to spawn: the argv to run and whether the command's cwd/env apply
/// to the child itself (local) or were already baked into the argv
/// (kubectl wrapping a remote shell).
pub(crate) struct SpawnSpec {
    pub argv: Vec<String>,
    pub apply_cwd: bool,
    pub apply_env: bool,
}

enum DriveOutcome {
    Finished {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        status: std::process::ExitStatus,
    },
    Overflow(StreamError),
}

/// Spawn per `spawn`, run to completion under the command's deadline and
/// cancellation token, and build the uniform result.
pub(crate) async fn run(
    adapter: &'static str,
    command: &Command,
    spawn: SpawnSpec,
) -> Result<ExecutionResult> {
    if spawn.argv.is_empty() {
        return Err(Error::adapter(adapter, "empty command"));
    }
    if command.cancel.is_cancelled() {
        return Err(Error::aborted(adapter));
    }

    let display = command.display_string();
    let builder = ResultBuilder::start(display.clone(), adapter).cwd(command.cwd.clone());

    let mut child_cmd = tokio::process::Command::new(&spawn.argv[0]);
    child_cmd.args(&spawn.argv[1..]);
    if spawn.apply_cwd {
        if let Some(cwd) = &command.cwd {
            child_cmd.current_dir(cwd);
        }
    }
    if spawn.apply_env {
        child_cmd.envs(&command.env);
    }
    child_cmd
        .stdin(match command.stdin {
            StdinPayload::None => Stdio::null(),
            StdinPayload::Bytes(_) => Stdio::piped(),
        })
        .stdout(stdio_for(command.stdout))
        .stderr(stdio_for(command.stderr))
        .kill_on_drop(true);

    let mut child = child_cmd
        .spawn()
        .map_err(|e| Error::adapter(adapter, format!("spawn failed: {}", e)))?;

    // Feed stdin up front; the payload is inline and bounded.
    if let Some(bytes) = command.stdin.as_bytes() {
        if let Some(mut stdin) = child.stdin.take() {
            let payload = bytes.to_vec();
            if let Err(e) = stdin.write_all(&payload).await {
                warn!(error = %e, "failed to write stdin payload");
            }
            // Drop closes the pipe and delivers EOF.
        }
    }

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let quiet = command.quiet;

    let drive = async {
        let on_line: Option<LineCallback> = if quiet {
            None
        } else {
            Some(Arc::new(move |line: &str| debug!(target: "uex::output", "{}", line)))
        };
        let (stdout, stderr, status) = tokio::join!(
            read_stream(stdout_pipe, on_line.clone()),
            read_stream(stderr_pipe, None),
            child.wait(),
        );
        let status = status?;
        match (stdout, stderr) {
            (Ok(stdout), Ok(stderr)) => Ok(DriveOutcome::Finished {
                stdout,
                stderr,
                status,
            }),
            (Err(e), _) | (_, Err(e)) => Ok(DriveOutcome::Overflow(e)),
        }
    };

    let outcome: std::io::Result<DriveOutcome> = tokio::select! {
        biased;
        _ = command.cancel.cancelled() => {
            return Err(Error::aborted(adapter));
        }
        outcome = async {
            match command.timeout {
                Some(deadline) => tokio::time::timeout(deadline, drive).await.ok(),
                None => Some(drive.await),
            }
        } => {
            match outcome {
                Some(r) => r,
                None => {
                    // Deadline fired; the drive future (and its borrow of
                    // the child) is gone, so the kill can proceed.
                    if command.nothrow {
                        return Ok(builder.finish_timed_out());
                    }
                    return Err(Error::Timeout {
                        command: display,
                        timeout: command.timeout.unwrap_or_default(),
                    });
                }
            }
        }
    };

    match outcome {
        Ok(DriveOutcome::Finished {
            stdout,
            stderr,
            status,
        }) => {
            let (exit_code, signal) = decode_status(status);
            Ok(builder.finish(stdout, stderr, exit_code, signal))
        }
        Ok(DriveOutcome::Overflow(e)) => Err(Error::adapter(adapter, e.to_string())),
        Err(e) => Err(Error::adapter(adapter, format!("wait failed: {}", e))),
    }
}

fn stdio_for(mode: OutputMode) -> Stdio {
    match mode {
        OutputMode::Pipe => Stdio::piped(),
        OutputMode::Inherit => Stdio::inherit(),
        OutputMode::Ignore => Stdio::null(),
    }
}

async fn read_stream(
    pipe: Option<impl AsyncRead + Unpin>,
    on_line: Option<LineCallback>,
) -> std::result::Result<Vec<u8>, StreamError> {
    let Some(mut pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut collector = OutputCollector::with_limit(
        crate::stream::DEFAULT_MAX_CAPTURE,
        OverflowBehavior::Error,
    );
    if let Some(cb) = on_line {
        collector = collector.on_line(cb);
    }
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => collector.push(&buf[..n])?,
            Err(_) => break,
        }
    }
    Ok(collector.finish())
}

fn decode_status(status: std::process::ExitStatus) -> (Option<i32>, Option<String>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (status.code(), Some(super::signal_name(sig)));
        }
    }
    (status.code(), None)
}
