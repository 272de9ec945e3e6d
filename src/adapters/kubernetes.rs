//! Kubernetes pod adapter
//!
//! Drives `kubectl` as a subprocess: `exec` for commands, `cp` for file
//! transfer, `logs` for streaming, and `port-forward` with a tracked
//! handle. The remote exit code propagates through kubectl's own exit
//! status.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::subprocess::{self, SpawnSpec};
use super::Adapter;
use crate::command::{Command, K8sOptions, Target};
use crate::error::{Error, Result};
use crate::escape::{self, Platform};
use crate::result::ExecutionResult;

/// A running `kubectl port-forward`, killed on close. Close is idempotent.
pub struct PortForwardHandle {
    /// Local listening port.
    pub local_port: u16,
    /// Remote (pod) port.
    pub remote_port: u16,
    child: parking_lot::Mutex<Option<tokio::process::Child>>,
    open: AtomicBool,
}

impl PortForwardHandle {
    /// Whether the forward is still running.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop the forward. Safe to call more than once.
    pub async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// Adapter for Kubernetes pods.
pub struct KubernetesAdapter {
    kubectl: String,
    forwards: parking_lot::Mutex<Vec<Arc<PortForwardHandle>>>,
    dispose_token: CancellationToken,
}

impl KubernetesAdapter {
    /// Adapter using `kubectl` from `PATH`.
    pub fn new() -> Self {
        Self::with_kubectl("kubectl")
    }

    /// Adapter using an explicit kubectl binary.
    pub fn with_kubectl(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
            forwards: parking_lot::Mutex::new(Vec::new()),
            dispose_token: CancellationToken::new(),
        }
    }

    /// Common flags for a target: context, namespace.
    fn base_args(&self, opts: &K8sOptions) -> Vec<String> {
        let mut args = vec![self.kubectl.clone()];
        if let Some(context) = &opts.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        if let Some(ns) = &opts.namespace {
            args.push("-n".to_string());
            args.push(ns.clone());
        }
        args
    }

    /// Wrap the command for the remote shell, folding in cwd and env
    /// (kubectl exec has no native support for either).
    fn remote_script(command: &Command) -> String {
        let mut script = String::new();
        if let Some(cwd) = &command.cwd {
            script.push_str(&format!(
                "cd {} && ",
                escape::quote_unix(&cwd.to_string_lossy())
            ));
        }
        if !command.env.is_empty() {
            let env: std::collections::BTreeMap<String, String> = command
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            script.push_str(&escape::env_prefix(&env, Platform::Unix));
            script.push(' ');
        }
        script.push_str(&command.command_string(Platform::Unix));
        script
    }

    /// Whether the named pod is in the `Running` phase.
    pub async fn pod_ready(&self, opts: &K8sOptions) -> Result<bool> {
        let mut args = self.base_args(opts);
        args.extend([
            "get".to_string(),
            "pod".to_string(),
            opts.pod.clone(),
            "-o".to_string(),
            "json".to_string(),
        ]);

        let probe = Command::new(&args[0]).no_shell().quiet();
        let result = subprocess::run(
            "k8s",
            &probe,
            SpawnSpec {
                argv: args,
                apply_cwd: false,
                apply_env: false,
            },
        )
        .await?;

        if !result.ok() {
            return Err(Error::Kubernetes(format!(
                "pod not found: {} ({})",
                opts.pod,
                result.stderr.trim()
            )));
        }
        let parsed: serde_json::Value = result
            .json()
            .map_err(|e| Error::Kubernetes(format!("unparseable pod JSON: {}", e)))?;
        Ok(parsed["status"]["phase"].as_str() == Some("Running"))
    }

    /// Copy a local path into the pod (`kubectl cp`).
    pub async fn copy_to(
        &self,
        opts: &K8sOptions,
        local_path: &Path,
        remote_path: &str,
    ) -> Result<()> {
        let target = format!("{}:{}", opts.pod, remote_path);
        self.run_cp(opts, &local_path.to_string_lossy(), &target)
            .await
    }

    /// Copy a path out of the pod (`kubectl cp`).
    pub async fn copy_from(
        &self,
        opts: &K8sOptions,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()> {
        let source = format!("{}:{}", opts.pod, remote_path);
        self.run_cp(opts, &source, &local_path.to_string_lossy())
            .await
    }

    async fn run_cp(&self, opts: &K8sOptions, from: &str, to: &str) -> Result<()> {
        let mut args = self.base_args(opts);
        args.push("cp".to_string());
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        args.push(from.to_string());
        args.push(to.to_string());

        let cp = Command::new(&args[0]).no_shell().quiet();
        let result = subprocess::run(
            "k8s",
            &cp,
            SpawnSpec {
                argv: args,
                apply_cwd: false,
                apply_env: false,
            },
        )
        .await?;
        if !result.ok() {
            return Err(Error::Kubernetes(format!(
                "kubectl cp failed: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Stream log lines from the pod. Lines arrive on the returned
    /// channel until the stream ends or `cancel` fires.
    pub async fn stream_logs(
        &self,
        opts: &K8sOptions,
        follow: bool,
        tail: Option<u32>,
        cancel: CancellationToken,
    ) -> Result<mpsc::UnboundedReceiver<String>> {
        let mut args = self.base_args(opts);
        args.push("logs".to_string());
        if follow {
            args.push("-f".to_string());
        }
        if let Some(lines) = tail {
            args.push(format!("--tail={}", lines));
        }
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        args.push(opts.pod.clone());

        let mut child = tokio::process::Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Kubernetes(format!("failed to spawn kubectl logs: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Kubernetes("kubectl logs produced no stdout".to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        _ => break,
                    },
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        });

        Ok(rx)
    }

    /// Forward a local port to a pod port. `local_port` 0 lets the kernel
    /// pick; the chosen port is parsed from kubectl's announcement line.
    pub async fn port_forward(
        &self,
        opts: &K8sOptions,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Arc<PortForwardHandle>> {
        let mut args = self.base_args(opts);
        args.push("port-forward".to_string());
        args.push(format!("pod/{}", opts.pod));
        if local_port == 0 {
            args.push(format!(":{}", remote_port));
        } else {
            args.push(format!("{}:{}", local_port, remote_port));
        }

        let mut child = tokio::process::Command::new(&args[0])
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Kubernetes(format!("failed to spawn port-forward: {}", e)))?;

        // kubectl prints "Forwarding from 127.0.0.1:PORT -> PORT" once the
        // listener is up.
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Kubernetes("port-forward produced no stdout".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let announced = tokio::time::timeout(std::time::Duration::from_secs(15), async {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "port-forward output");
                if let Some(port) = parse_forward_port(&line) {
                    return Some(port);
                }
            }
            None
        })
        .await
        .map_err(|_| Error::Kubernetes("port-forward did not come up in time".to_string()))?;

        let Some(bound_port) = announced else {
            let _ = child.start_kill();
            return Err(Error::Kubernetes(
                "port-forward exited before announcing a port".to_string(),
            ));
        };

        let handle = Arc::new(PortForwardHandle {
            local_port: bound_port,
            remote_port,
            child: parking_lot::Mutex::new(Some(child)),
            open: AtomicBool::new(true),
        });
        self.forwards.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}

/// Parse the bound local port out of kubectl's announcement line.
fn parse_forward_port(line: &str) -> Option<u16> {
    let rest = line.strip_prefix("Forwarding from ")?;
    let addr = rest.split_whitespace().next()?;
    let port = addr.rsplit(':').next()?;
    port.parse().ok()
}

impl Default for KubernetesAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for KubernetesAdapter {
    fn name(&self) -> &'static str {
        "k8s"
    }

    async fn is_available(&self) -> bool {
        tokio::process::Command::new(&self.kubectl)
            .args(["version", "--client", "--output=json"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn execute(&self, command: Command) -> Result<ExecutionResult> {
        if self.dispose_token.is_cancelled() {
            return Err(Error::adapter("k8s", "adapter disposed"));
        }
        let Target::K8s(opts) = command.target.clone() else {
            return Err(Error::adapter("k8s", "command target is not k8s"));
        };

        let mut args = self.base_args(&opts);
        args.push("exec".to_string());
        if command.stdin.as_bytes().is_some() {
            args.push("-i".to_string());
        }
        args.push(opts.pod.clone());
        if let Some(container) = &opts.container {
            args.push("-c".to_string());
            args.push(container.clone());
        }
        args.push("--".to_string());
        args.push("/bin/sh".to_string());
        args.push("-c".to_string());
        args.push(Self::remote_script(&command));

        let mut result = subprocess::run(
            "k8s",
            &command,
            SpawnSpec {
                argv: args,
                apply_cwd: false,
                apply_env: false,
            },
        )
        .await?;
        result
            .metadata
            .insert("pod".to_string(), opts.pod.clone());
        if let Some(ns) = &opts.namespace {
            result.metadata.insert("namespace".to_string(), ns.clone());
        }

        // kubectl reports its own failures (pod missing, not ready) on
        // stderr with exit 1; surface those as domain errors.
        if !result.ok() && result.stderr.contains("Error from server") {
            if command.nothrow {
                return Ok(result);
            }
            return Err(Error::Kubernetes(result.stderr.trim().to_string()));
        }
        Ok(result)
    }

    async fn dispose(&self) -> Result<()> {
        self.dispose_token.cancel();
        let forwards: Vec<Arc<PortForwardHandle>> =
            std::mem::take(&mut *self.forwards.lock());
        for handle in forwards {
            handle.close().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward_port() {
        assert_eq!(
            parse_forward_port("Forwarding from 127.0.0.1:49213 -> 8080"),
            Some(49213)
        );
        assert_eq!(
            parse_forward_port("Forwarding from [::1]:49213 -> 8080"),
            Some(49213)
        );
        assert_eq!(parse_forward_port("Handling connection for 8080"), None);
    }

    #[test]
    fn test_remote_script_composition() {
        let cmd = Command::shell("make build")
            .cwd("/srv/app dir")
            .env_var("RUST_LOG", "debug");
        let script = KubernetesAdapter::remote_script(&cmd);
        assert_eq!(script, "cd '/srv/app dir' && RUST_LOG=debug make build");
    }

    #[test]
    fn test_base_args_include_context_and_namespace() {
        let adapter = KubernetesAdapter::new();
        let opts = K8sOptions::new("web-1")
            .namespace("staging")
            .context("minikube");
        let args = adapter.base_args(&opts);
        assert_eq!(
            args,
            vec![
                "kubectl".to_string(),
                "--context".to_string(),
                "minikube".to_string(),
                "-n".to_string(),
                "staging".to_string(),
            ]
        );
    }
}
