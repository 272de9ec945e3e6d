//! Docker exec adapter
//!
//! Runs commands inside a running container via the Docker API (exec
//! create/start/inspect) and moves files in and out with `docker cp`.
//! The client connects lazily on first use so constructing an engine
//! works on hosts with no Docker daemon.

use std::path::Path;

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::subprocess::{self, SpawnSpec};
use super::Adapter;
use crate::command::{Command, DockerOptions, StdinPayload, Target};
use crate::error::{Error, Result};
use crate::escape::Platform;
use crate::events::{EventBus, EventPayload};
use crate::result::{ExecutionResult, ResultBuilder};
use crate::stream::{OutputCollector, OverflowBehavior};

/// Adapter for Docker containers.
pub struct DockerAdapter {
    client: parking_lot::Mutex<Option<Docker>>,
    events: EventBus,
}

impl DockerAdapter {
    /// New adapter publishing lifecycle events on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            client: parking_lot::Mutex::new(None),
            events,
        }
    }

    /// Connect (once) and return the client.
    fn client(&self) -> Result<Docker> {
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = Docker::connect_with_local_defaults()?;
        self.events.publish_for(
            "docker",
            EventPayload::ConnectionOpen {
                host: "docker-daemon".to_string(),
            },
        );
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Fail with a domain error unless the container exists and runs.
    async fn ensure_running(&self, client: &Docker, container: &str) -> Result<()> {
        let info = client
            .inspect_container(container, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => Error::Docker(format!("container not found: {}", container)),
                other => Error::Docker(other.to_string()),
            })?;

        let running = info.state.and_then(|s| s.running).unwrap_or(false);
        if !running {
            return Err(Error::Docker(format!(
                "container not running: {}",
                container
            )));
        }
        Ok(())
    }

    fn exec_cmd(command: &Command) -> Result<Vec<String>> {
        match command.shell_program() {
            Some(shell) => Ok(vec![
                shell,
                "-c".to_string(),
                command.command_string(Platform::Unix),
            ]),
            None => command.argv(),
        }
    }

    async fn run_exec(
        &self,
        client: &Docker,
        opts: &DockerOptions,
        command: &Command,
    ) -> Result<ExecutionResult> {
        let display = command.display_string();
        let builder = ResultBuilder::start(display.clone(), "docker")
            .cwd(command.cwd.clone())
            .meta("container", opts.container.clone());

        let env: Vec<String> = command
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let working_dir = command
            .cwd
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .or_else(|| opts.workdir.clone());

        let create = CreateExecOptions {
            attach_stdin: Some(command.stdin.as_bytes().is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(opts.tty),
            cmd: Some(Self::exec_cmd(command)?),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir,
            user: opts.user.clone(),
            ..Default::default()
        };

        let exec = client.create_exec(&opts.container, create).await?;
        let started = client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?;

        let drain = async {
            let mut stdout =
                OutputCollector::with_limit(crate::stream::DEFAULT_MAX_CAPTURE, OverflowBehavior::Error);
            let mut stderr =
                OutputCollector::with_limit(crate::stream::DEFAULT_MAX_CAPTURE, OverflowBehavior::Error);

            if let StartExecResults::Attached {
                mut output,
                mut input,
            } = started
            {
                if let Some(bytes) = command.stdin.as_bytes() {
                    if let Err(e) = input.write_all(bytes).await {
                        warn!(error = %e, "failed to write exec stdin");
                    }
                    let _ = input.shutdown().await;
                }

                while let Some(chunk) = output.next().await {
                    use bollard::container::LogOutput;
                    match chunk {
                        Ok(LogOutput::StdOut { message })
                        | Ok(LogOutput::Console { message }) => stdout
                            .push(&message)
                            .map_err(|e| Error::adapter("docker", e.to_string()))?,
                        Ok(LogOutput::StdErr { message }) => stderr
                            .push(&message)
                            .map_err(|e| Error::adapter("docker", e.to_string()))?,
                        Ok(LogOutput::StdIn { .. }) => {}
                        Err(e) => return Err(Error::Docker(e.to_string())),
                    }
                }
            }

            Ok((stdout.finish(), stderr.finish()))
        };

        let drained = tokio::select! {
            biased;
            _ = command.cancel.cancelled() => return Err(Error::aborted("docker")),
            drained = async {
                match command.timeout {
                    Some(deadline) => tokio::time::timeout(deadline, drain).await.ok(),
                    None => Some(drain.await),
                }
            } => drained,
        };

        let (stdout_bytes, stderr_bytes) = match drained {
            Some(outcome) => outcome?,
            None => {
                // No kill endpoint for an exec instance; the remote command
                // keeps running and we stop waiting. Best-effort semantics.
                debug!(container = %opts.container, "exec timed out, abandoning");
                if command.nothrow {
                    return Ok(builder.finish_timed_out());
                }
                return Err(Error::Timeout {
                    command: display,
                    timeout: command.timeout.unwrap_or_default(),
                });
            }
        };

        let inspect = client.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.map(|c| c as i32);
        Ok(builder.finish(stdout_bytes, stderr_bytes, exit_code, None))
    }

    /// Upload a local file or directory into the container at
    /// `remote_path` via `docker cp`. Returns the source byte count.
    pub async fn copy_to(
        &self,
        container: &str,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<u64> {
        let client = self.client()?;
        self.ensure_running(&client, container).await?;
        self.run_cp(
            &local_path.to_string_lossy(),
            &format!("{}:{}", container, remote_path),
        )
        .await?;
        Ok(local_size(local_path))
    }

    /// Download a file or directory from the container into `local_dest`
    /// via `docker cp`. Returns the destination byte count.
    pub async fn copy_from(
        &self,
        container: &str,
        remote_path: &str,
        local_dest: &Path,
    ) -> Result<u64> {
        let client = self.client()?;
        self.ensure_running(&client, container).await?;
        if let Some(parent) = local_dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.run_cp(
            &format!("{}:{}", container, remote_path),
            &local_dest.to_string_lossy(),
        )
        .await?;
        Ok(local_size(local_dest))
    }

    async fn run_cp(&self, from: &str, to: &str) -> Result<()> {
        let argv = vec![
            "docker".to_string(),
            "cp".to_string(),
            from.to_string(),
            to.to_string(),
        ];
        let cp = Command::new("docker").no_shell().quiet();
        let result = subprocess::run(
            "docker",
            &cp,
            SpawnSpec {
                argv,
                apply_cwd: false,
                apply_env: false,
            },
        )
        .await?;
        if !result.ok() {
            return Err(Error::Docker(format!(
                "docker cp failed: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Total byte size of a local file or tree.
fn local_size(path: &Path) -> u64 {
    if path.is_file() {
        return std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    }
    walkdir::WalkDir::new(path)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[async_trait]
impl Adapter for DockerAdapter {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        match self.client() {
            Ok(client) => client.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn execute(&self, command: Command) -> Result<ExecutionResult> {
        if command.cancel.is_cancelled() {
            return Err(Error::aborted("docker"));
        }
        let Target::Docker(opts) = command.target.clone() else {
            return Err(Error::adapter("docker", "command target is not docker"));
        };
        let client = self.client()?;
        self.ensure_running(&client, &opts.container).await?;
        self.run_exec(&client, &opts, &command).await
    }

    async fn dispose(&self) -> Result<()> {
        if self.client.lock().take().is_some() {
            self.events.publish_for(
                "docker",
                EventPayload::ConnectionClose {
                    host: "docker-daemon".to_string(),
                },
            );
        }
        Ok(())
    }
}
