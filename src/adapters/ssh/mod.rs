//! SSH adapter
//!
//! Executes commands on remote hosts over pooled connections, transfers
//! files via SFTP, forwards local TCP ports through the same sessions,
//! and wraps commands for sudo with secure password delivery. One adapter
//! instance shares its pool across every caller.

mod client;
mod keys;
mod pool;
mod sftp;
mod sudo;
mod tunnel;

pub use keys::{validate_private_key, KeyFormat};
pub use sftp::{DirTransferStats, TransferTick};
pub use tunnel::{TunnelHandle, TunnelRequest};

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::pool::{ConnectionPool, LeaseOutcome};
pub use self::pool::PoolConfig;
use super::Adapter;
use crate::command::{Command, SshOptions, SudoOptions, Target};
use crate::error::{Error, Result};
use crate::escape::{self, Platform};
use crate::events::{EventBus, EventPayload, PoolMetrics};
use crate::result::{ExecutionResult, ResultBuilder};
use crate::secrets::SecurePasswordHandler;
use crate::stream::OutputCollector;

/// Adapter-wide configuration.
#[derive(Debug, Clone)]
pub struct SshAdapterConfig {
    /// Connection pool knobs.
    pub pool: PoolConfig,
    /// Allow SFTP operations.
    pub sftp_enabled: bool,
    /// Concurrent file transfers per directory operation.
    pub sftp_concurrency: usize,
    /// Sudo defaults applied when a command's target sets none.
    pub default_sudo: Option<SudoOptions>,
}

impl Default for SshAdapterConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            sftp_enabled: true,
            sftp_concurrency: 5,
            default_sudo: None,
        }
    }
}

/// Adapter for remote hosts over SSH.
pub struct SshAdapter {
    pool: Arc<ConnectionPool>,
    config: SshAdapterConfig,
    tunnels: Arc<DashMap<u64, TunnelHandle>>,
    next_tunnel_id: AtomicU64,
    secrets: SecurePasswordHandler,
    events: EventBus,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl SshAdapter {
    /// Adapter with default configuration.
    pub fn new(events: EventBus) -> Self {
        Self::with_config(SshAdapterConfig::default(), events)
    }

    /// Adapter with explicit configuration.
    pub fn with_config(config: SshAdapterConfig, events: EventBus) -> Self {
        Self {
            pool: ConnectionPool::new(config.pool.clone(), events.clone()),
            config,
            tunnels: Arc::new(DashMap::new()),
            next_tunnel_id: AtomicU64::new(1),
            secrets: SecurePasswordHandler::new(),
            events,
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::adapter("ssh", "adapter disposed"));
        }
        Ok(())
    }

    /// Current pool metrics.
    pub fn pool_metrics(&self) -> PoolMetrics {
        self.pool.metrics()
    }

    /// Whether a pooled connection exists for the target.
    pub fn is_pooled(&self, opts: &SshOptions) -> bool {
        self.pool.contains(&opts.pool_key())
    }

    /// Validate options, emitting `ssh:key-validated` for accepted keys.
    fn validate(&self, opts: &SshOptions) -> Result<()> {
        let format = keys::validate_options(opts).map_err(|e| match e {
            // Fill in the host the generic validator does not know.
            Error::Connection { reason, .. } => Error::Connection {
                host: opts.host.clone(),
                reason,
            },
            other => other,
        })?;
        if let Some(format) = format {
            self.events.publish_for(
                "ssh",
                EventPayload::SshKeyValidated {
                    key_format: format.label().to_string(),
                },
            );
        }
        Ok(())
    }

    /// Compose the remote command string: cwd, env, the command itself,
    /// then sudo wrapping.
    fn remote_command(&self, command: &Command, opts: &SshOptions) -> Result<String> {
        let mut script = String::new();
        if let Some(cwd) = &command.cwd {
            script.push_str(&format!(
                "cd {} && ",
                escape::quote_unix(&cwd.to_string_lossy())
            ));
        }
        if !command.env.is_empty() {
            let env: BTreeMap<String, String> = command
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            script.push_str(&escape::env_prefix(&env, Platform::Unix));
            script.push(' ');
        }
        script.push_str(&command.command_string(Platform::Unix));

        let sudo = match (&opts.sudo, &self.config.default_sudo) {
            (Some(sudo), _) => Some(sudo.clone()),
            (None, Some(default)) => Some(default.clone()),
            (None, None) => None,
        };
        match sudo {
            Some(sudo) if sudo.enabled => {
                if let Some(password) = &sudo.password {
                    // Retained encrypted so dispose zeroes every password
                    // the adapter has ever seen.
                    self.secrets.store_password(&opts.pool_key(), password)?;
                }
                sudo::apply_sudo(&script, &sudo)
            }
            _ => Ok(script),
        }
    }

    async fn run_on_pool(
        &self,
        command: &Command,
        opts: &SshOptions,
        remote: String,
    ) -> Result<ExecutionResult> {
        let display = command.display_string();
        let sudo_password = opts
            .sudo
            .as_ref()
            .and_then(|s| s.password.clone())
            .or_else(|| {
                self.config
                    .default_sudo
                    .as_ref()
                    .and_then(|s| s.password.clone())
            });
        let masked = match sudo_password.as_deref() {
            Some(pw) => SecurePasswordHandler::mask_password(&display, pw),
            None => display.clone(),
        };

        let (key, handle) = self.pool.acquire(opts).await?;
        self.events.publish_for(
            "ssh",
            EventPayload::SshExecute {
                host: opts.host.clone(),
                command: masked,
            },
        );

        let builder = ResultBuilder::start(display.clone(), "ssh")
            .cwd(command.cwd.clone())
            .meta("pool_key", key.clone());

        let exec = client::exec(
            &handle,
            &remote,
            command.stdin.as_bytes(),
            OutputCollector::new(),
            OutputCollector::new(),
        );

        let outcome = tokio::select! {
            biased;
            _ = command.cancel.cancelled() => {
                self.pool.release(&key, LeaseOutcome::Fault).await;
                return Err(Error::aborted("ssh"));
            }
            outcome = async {
                match command.timeout {
                    Some(deadline) => tokio::time::timeout(deadline, exec).await.ok(),
                    None => Some(exec.await),
                }
            } => outcome,
        };

        match outcome {
            None => {
                // Deadline elapsed: the remote command is left to finish
                // on its own and the connection is marked for eviction.
                self.pool.release(&key, LeaseOutcome::Timeout).await;
                if command.nothrow {
                    Ok(builder.finish_timed_out())
                } else {
                    Err(Error::Timeout {
                        command: display,
                        timeout: command.timeout.unwrap_or_default(),
                    })
                }
            }
            Some(Err(e)) => {
                self.pool.release(&key, LeaseOutcome::Fault).await;
                match e {
                    e @ Error::Connection { .. } | e @ Error::Timeout { .. } => Err(e),
                    e @ Error::Adapter { .. } => Err(e),
                    other => Err(Error::adapter("ssh", other.to_string())),
                }
            }
            Some(Ok(exit)) => {
                self.pool.release(&key, LeaseOutcome::Ok).await;
                Ok(builder.finish(exit.stdout, exit.stderr, exit.exit_code, exit.signal))
            }
        }
    }

    /// Upload one local file over SFTP.
    pub async fn upload_file(
        &self,
        opts: &SshOptions,
        local: &Path,
        remote: &str,
    ) -> Result<u64> {
        self.ensure_usable()?;
        self.ensure_sftp()?;
        self.validate(opts)?;
        let (key, handle) = self.pool.acquire(opts).await?;
        let outcome = async {
            let sftp = sftp::open_session(&handle).await?;
            sftp::upload_file(&sftp, local, remote).await
        }
        .await;
        self.release_transfer(&key, &outcome).await;
        outcome
    }

    /// Download one remote file over SFTP.
    pub async fn download_file(
        &self,
        opts: &SshOptions,
        remote: &str,
        local: &Path,
    ) -> Result<u64> {
        self.ensure_usable()?;
        self.ensure_sftp()?;
        self.validate(opts)?;
        let (key, handle) = self.pool.acquire(opts).await?;
        let outcome = async {
            let sftp = sftp::open_session(&handle).await?;
            sftp::download_file(&sftp, remote, local).await
        }
        .await;
        self.release_transfer(&key, &outcome).await;
        outcome
    }

    /// Upload a directory tree over SFTP with bounded concurrency.
    pub async fn upload_directory(
        &self,
        opts: &SshOptions,
        local: &Path,
        remote: &str,
        tick: Option<TransferTick>,
    ) -> Result<DirTransferStats> {
        self.ensure_usable()?;
        self.ensure_sftp()?;
        self.validate(opts)?;
        let (key, handle) = self.pool.acquire(opts).await?;
        let outcome = async {
            let sftp = Arc::new(sftp::open_session(&handle).await?);
            sftp::upload_directory(sftp, local, remote, self.config.sftp_concurrency, tick).await
        }
        .await;
        self.release_transfer(&key, &outcome).await;
        outcome
    }

    /// Download a directory tree over SFTP with bounded concurrency.
    pub async fn download_directory(
        &self,
        opts: &SshOptions,
        remote: &str,
        local: &Path,
        tick: Option<TransferTick>,
    ) -> Result<DirTransferStats> {
        self.ensure_usable()?;
        self.ensure_sftp()?;
        self.validate(opts)?;
        let (key, handle) = self.pool.acquire(opts).await?;
        let outcome = async {
            let sftp = Arc::new(sftp::open_session(&handle).await?);
            sftp::download_directory(sftp, remote, local, self.config.sftp_concurrency, tick)
                .await
        }
        .await;
        self.release_transfer(&key, &outcome).await;
        outcome
    }

    fn ensure_sftp(&self) -> Result<()> {
        if !self.config.sftp_enabled {
            return Err(Error::adapter("ssh", "sftp-disabled"));
        }
        Ok(())
    }

    async fn release_transfer<T>(&self, key: &str, outcome: &Result<T>) {
        let lease = if outcome.is_ok() {
            LeaseOutcome::Ok
        } else {
            LeaseOutcome::Fault
        };
        self.pool.release(key, lease).await;
    }

    /// Open a tracked tunnel. The handle is registered with the adapter
    /// and unregistered when closed; disposing the adapter closes it.
    pub async fn tunnel(
        &self,
        opts: &SshOptions,
        request: TunnelRequest,
    ) -> Result<TunnelHandle> {
        self.ensure_usable()?;
        self.validate(opts)?;
        let (key, handle) = self.pool.acquire(opts).await?;

        let id = self.next_tunnel_id.fetch_add(1, Ordering::SeqCst);
        let outcome = tunnel::open_tunnel(
            Arc::clone(&handle),
            request,
            id,
            &self.shutdown,
            self.events.clone(),
        )
        .await;
        self.pool
            .release(&key, if outcome.is_ok() { LeaseOutcome::Ok } else { LeaseOutcome::Fault })
            .await;
        let tunnel = outcome?;

        self.tunnels.insert(id, tunnel.clone());

        // Drop the registry entry once the tunnel shuts down, however
        // that happens.
        let registry = Arc::clone(&self.tunnels);
        let watch = tunnel.clone();
        tokio::spawn(async move {
            watch.wait_closed().await;
            registry.remove(&watch.id);
        });

        Ok(tunnel)
    }

    /// One-shot local→remote forward without a tracked handle; lives
    /// until the adapter is disposed. Returns the bound local port.
    pub async fn port_forward(
        &self,
        opts: &SshOptions,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Result<u16> {
        self.ensure_usable()?;
        self.validate(opts)?;
        let (key, handle) = self.pool.acquire(opts).await?;
        let request = TunnelRequest::to(remote_host, remote_port).local_port(local_port);
        let id = self.next_tunnel_id.fetch_add(1, Ordering::SeqCst);
        let outcome = tunnel::open_tunnel(
            Arc::clone(&handle),
            request,
            id,
            &self.shutdown,
            self.events.clone(),
        )
        .await;
        self.pool
            .release(&key, if outcome.is_ok() { LeaseOutcome::Ok } else { LeaseOutcome::Fault })
            .await;
        Ok(outcome?.local_port)
    }

    /// Number of tracked live tunnels.
    pub fn open_tunnel_count(&self) -> usize {
        self.tunnels.len()
    }
}

#[async_trait]
impl Adapter for SshAdapter {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn is_available(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    async fn execute(&self, command: Command) -> Result<ExecutionResult> {
        self.ensure_usable()?;
        if command.cancel.is_cancelled() {
            return Err(Error::aborted("ssh"));
        }
        let Target::Ssh(opts) = command.target.clone() else {
            return Err(Error::adapter("ssh", "command target is not ssh"));
        };
        self.validate(&opts)?;
        let remote = self.remote_command(&command, &opts)?;
        self.run_on_pool(&command, &opts, remote).await
    }

    /// Tear down in order: tunnels first, then pooled connections in
    /// parallel, then secret material.
    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("disposing ssh adapter");
        self.shutdown.cancel();

        let tunnels: Vec<TunnelHandle> = self
            .tunnels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.tunnels.clear();
        for tunnel in tunnels {
            tunnel.close().await;
        }

        self.pool.dispose().await;
        self.secrets.dispose();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SudoMethod;

    fn adapter() -> SshAdapter {
        SshAdapter::new(EventBus::new())
    }

    #[tokio::test]
    async fn test_remote_command_composition() {
        let a = adapter();
        let opts = SshOptions::new("h", "u").password("pw");
        let cmd = Command::shell("make test")
            .cwd("/srv/app")
            .env_var("CI", "1");
        let remote = a.remote_command(&cmd, &opts).unwrap();
        assert_eq!(remote, "cd /srv/app && CI=1 make test");
    }

    #[tokio::test]
    async fn test_remote_command_sudo_wrapping() {
        let a = adapter();
        let sudo = SudoOptions {
            enabled: true,
            password: Some("pw!".to_string()),
            prompt: None,
            method: SudoMethod::SecureAskpass,
            user: None,
            askpass_path: None,
        };
        let opts = SshOptions::new("h", "u").password("login").sudo(sudo);
        let remote = a
            .remote_command(&Command::shell("whoami"), &opts)
            .unwrap();
        assert!(remote.contains("sudo -A"));
        assert!(remote.contains("askpass-"));
    }

    #[tokio::test]
    async fn test_sftp_disabled() {
        let config = SshAdapterConfig {
            sftp_enabled: false,
            ..Default::default()
        };
        let a = SshAdapter::with_config(config, EventBus::new());
        let err = a.ensure_sftp().unwrap_err();
        assert!(err.to_string().contains("sftp-disabled"));
    }

    #[tokio::test]
    async fn test_execute_rejects_wrong_target() {
        let a = adapter();
        let err = a.execute(Command::shell("ls")).await.unwrap_err();
        assert!(err.to_string().contains("not ssh"));
    }

    #[tokio::test]
    async fn test_disposed_adapter_refuses_work() {
        let a = adapter();
        a.dispose().await.unwrap();
        let opts = SshOptions::new("h", "u").password("pw");
        let err = a
            .execute(Command::shell("ls").target(Target::Ssh(opts)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disposed"));
        // Dispose is idempotent.
        a.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_options_fail_before_io() {
        let a = adapter();
        let opts = SshOptions::new("", "u");
        let err = a
            .execute(Command::shell("ls").target(Target::Ssh(opts)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }
}
