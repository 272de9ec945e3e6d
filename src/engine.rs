//! Execution engine facade
//!
//! The [`Engine`] owns one instance of every adapter plus the shared
//! event bus and result cache. It is an immutable value: deriving a new
//! engine with [`Engine::with`] or a target subcontext clones the config
//! and shares the adapters by reference.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::adapters::ssh::SshAdapterConfig;
use crate::adapters::{
    finalize, Adapter, DockerAdapter, KubernetesAdapter, LocalAdapter, MockAdapter, SshAdapter,
};
use crate::cache::{ResultCache, DEFAULT_SWEEP_INTERVAL};
use crate::command::{Command, DockerOptions, K8sOptions, ShellMode, SshOptions, Target};
use crate::error::Result;
use crate::escape::Platform;
use crate::events::EventBus;
use crate::process::ProcessPromise;
use crate::result::ExecutionResult;
use crate::retry::{retry_execute, RetryPolicy};

/// Engine-level defaults layered under every command.
#[derive(Clone, Default)]
pub struct EngineConfig {
    /// Default working directory.
    pub cwd: Option<PathBuf>,
    /// Base environment merged under command overrides.
    pub env: HashMap<String, String>,
    /// Default deadline.
    pub timeout: Option<Duration>,
    /// Default shell mode for commands that keep [`ShellMode::Default`].
    pub shell: Option<ShellMode>,
    /// Default target for commands that keep [`Target::Local`].
    pub target: Option<Target>,
    /// Force `nothrow` on every command.
    pub nothrow: bool,
    /// Force `quiet` on every command.
    pub quiet: bool,
    /// Default retry policy for commands that set none.
    pub retry: Option<RetryPolicy>,
}

struct EngineShared {
    events: EventBus,
    cache: Arc<ResultCache>,
    local: Arc<LocalAdapter>,
    ssh: Arc<SshAdapter>,
    docker: Arc<DockerAdapter>,
    k8s: Arc<KubernetesAdapter>,
    mock: Arc<MockAdapter>,
}

/// The execution engine. Cheap to clone; clones share adapters, cache,
/// and event bus.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
    config: EngineConfig,
}

/// Construction-time knobs for the shared adapters.
pub struct EngineBuilder {
    ssh: SshAdapterConfig,
    kubectl: Option<String>,
    cache_sweep: Duration,
}

impl EngineBuilder {
    /// Builder with defaults.
    pub fn new() -> Self {
        Self {
            ssh: SshAdapterConfig::default(),
            kubectl: None,
            cache_sweep: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Configure the SSH adapter (pool limits, SFTP, sudo defaults).
    pub fn ssh(mut self, config: SshAdapterConfig) -> Self {
        self.ssh = config;
        self
    }

    /// Use an explicit kubectl binary.
    pub fn kubectl(mut self, path: impl Into<String>) -> Self {
        self.kubectl = Some(path.into());
        self
    }

    /// Cache sweeper cadence.
    pub fn cache_sweep_interval(mut self, interval: Duration) -> Self {
        self.cache_sweep = interval;
        self
    }

    /// Build the engine and start its background sweepers.
    pub fn build(self) -> Engine {
        let events = EventBus::new();
        let cache = Arc::new(ResultCache::new(events.clone()));
        cache.start_sweeper(self.cache_sweep);

        let k8s = match self.kubectl {
            Some(path) => KubernetesAdapter::with_kubectl(path),
            None => KubernetesAdapter::new(),
        };

        Engine {
            shared: Arc::new(EngineShared {
                cache,
                local: Arc::new(LocalAdapter::new()),
                ssh: Arc::new(SshAdapter::with_config(self.ssh, events.clone())),
                docker: Arc::new(DockerAdapter::new(events.clone())),
                k8s: Arc::new(k8s),
                mock: Arc::new(MockAdapter::new()),
                events,
            }),
            config: EngineConfig::default(),
        }
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Engine with default configuration.
    pub fn new() -> Self {
        EngineBuilder::new().build()
    }

    /// Start configuring an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Derive an engine with adjusted defaults; adapters stay shared.
    pub fn with(&self, adjust: impl FnOnce(&mut EngineConfig)) -> Engine {
        let mut config = self.config.clone();
        adjust(&mut config);
        Engine {
            shared: Arc::clone(&self.shared),
            config,
        }
    }

    /// Subcontext bound to an SSH target: commands run there unless they
    /// name another target explicitly.
    pub fn ssh(&self, opts: SshOptions) -> Engine {
        self.with(|c| c.target = Some(Target::Ssh(opts)))
    }

    /// Subcontext bound to a Docker container.
    pub fn docker(&self, opts: DockerOptions) -> Engine {
        self.with(|c| c.target = Some(Target::Docker(opts)))
    }

    /// Subcontext bound to a Kubernetes pod.
    pub fn k8s(&self, opts: K8sOptions) -> Engine {
        self.with(|c| c.target = Some(Target::K8s(opts)))
    }

    /// Subcontext bound to the mock adapter (tests).
    pub fn mock(&self) -> Engine {
        self.with(|c| c.target = Some(Target::Mock))
    }

    /// The shared event bus.
    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// The shared result cache.
    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.shared.cache
    }

    /// The shared SSH adapter (tunnels, SFTP, pool metrics).
    pub fn ssh_adapter(&self) -> &Arc<SshAdapter> {
        &self.shared.ssh
    }

    /// The shared Docker adapter (container copies).
    pub fn docker_adapter(&self) -> &Arc<DockerAdapter> {
        &self.shared.docker
    }

    /// The shared Kubernetes adapter (cp, logs, port-forward).
    pub fn k8s_adapter(&self) -> &Arc<KubernetesAdapter> {
        &self.shared.k8s
    }

    /// The shared mock adapter, for seeding responses in tests.
    pub fn mock_adapter(&self) -> &Arc<MockAdapter> {
        &self.shared.mock
    }

    /// Run a prepared command, returning a composable promise.
    pub fn run(&self, command: Command) -> ProcessPromise {
        ProcessPromise::new(self.clone(), command)
    }

    /// Run a raw shell string.
    pub fn sh(&self, script: impl Into<String>) -> ProcessPromise {
        self.run(Command::shell(script))
    }

    /// Run a program with arguments, each safely quoted.
    pub fn exec<I, S>(&self, program: impl Into<String>, args: I) -> ProcessPromise
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run(Command::new(program).args(args))
    }

    /// Layer the engine defaults under a command.
    pub(crate) fn merge_command(&self, mut command: Command) -> Command {
        let config = &self.config;
        if command.cwd.is_none() {
            command.cwd = config.cwd.clone();
        }
        for (k, v) in &config.env {
            command.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if command.timeout.is_none() {
            command.timeout = config.timeout;
        }
        if let Some(shell) = &config.shell {
            if command.shell == ShellMode::Default {
                command.shell = shell.clone();
            }
        }
        if matches!(command.target, Target::Local) {
            if let Some(target) = &config.target {
                command.target = target.clone();
            }
        }
        if config.nothrow {
            command.nothrow = true;
        }
        if config.quiet {
            command.quiet = true;
        }
        if command.retry.is_none() {
            command.retry = config.retry.clone();
        }
        command
    }

    pub(crate) fn adapter_for(&self, target: &Target) -> Arc<dyn Adapter> {
        match target {
            Target::Local => Arc::clone(&self.shared.local) as Arc<dyn Adapter>,
            Target::Ssh(_) => Arc::clone(&self.shared.ssh) as Arc<dyn Adapter>,
            Target::Docker(_) => Arc::clone(&self.shared.docker) as Arc<dyn Adapter>,
            Target::K8s(_) => Arc::clone(&self.shared.k8s) as Arc<dyn Adapter>,
            Target::Mock => Arc::clone(&self.shared.mock) as Arc<dyn Adapter>,
        }
    }

    /// The full execute pipeline: merge defaults, wrap with cache and
    /// retry when requested, dispatch to the adapter, apply `nothrow`.
    pub(crate) async fn execute_now(&self, command: Command) -> Result<ExecutionResult> {
        let command = self.merge_command(command);
        let adapter = self.adapter_for(&command.target);
        debug!(adapter = adapter.name(), command = %command.display_string(), "executing");

        let events = self.shared.events.clone();
        let outcome = if let Some(ttl) = command.cache_ttl {
            let key = ResultCache::cache_key(
                &command.command_string(Platform::Unix),
                command.cwd.as_deref(),
                &command.env,
            );
            let cache = Arc::clone(&self.shared.cache);
            let inner_cmd = command.clone();
            let inner_adapter = Arc::clone(&adapter);
            cache
                .get_or_execute(&key, ttl, move || async move {
                    Self::dispatch(inner_adapter, inner_cmd, &events).await
                })
                .await
        } else {
            Self::dispatch(adapter, command.clone(), &events).await
        };

        outcome.and_then(|result| finalize(&command, result))
    }

    async fn dispatch(
        adapter: Arc<dyn Adapter>,
        command: Command,
        events: &EventBus,
    ) -> Result<ExecutionResult> {
        match command.retry.clone() {
            Some(policy) => {
                retry_execute(&policy, events, |_| {
                    let adapter = Arc::clone(&adapter);
                    let command = command.clone();
                    async move { adapter.execute(command).await }
                })
                .await
            }
            None => adapter.execute(command).await,
        }
    }

    /// Dispose every adapter and stop background tasks. The engine (and
    /// its clones) must not be used afterwards.
    pub async fn dispose(&self) -> Result<()> {
        self.shared.cache.stop_sweeper();
        self.shared.ssh.dispose().await?;
        self.shared.docker.dispose().await?;
        self.shared.k8s.dispose().await?;
        self.shared.local.dispose().await?;
        self.shared.mock.dispose().await?;
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::MockResponse;

    #[tokio::test]
    async fn test_merge_layers_defaults() {
        let engine = Engine::new().with(|c| {
            c.cwd = Some(PathBuf::from("/srv"));
            c.env.insert("BASE".to_string(), "1".to_string());
            c.timeout = Some(Duration::from_secs(9));
            c.nothrow = true;
        });

        let merged = engine.merge_command(
            Command::shell("x").env_var("BASE", "override").env_var("EXTRA", "2"),
        );
        assert_eq!(merged.cwd.as_deref(), Some(std::path::Path::new("/srv")));
        // Command-level env wins.
        assert_eq!(merged.env.get("BASE").map(String::as_str), Some("override"));
        assert_eq!(merged.env.get("EXTRA").map(String::as_str), Some("2"));
        assert_eq!(merged.timeout, Some(Duration::from_secs(9)));
        assert!(merged.nothrow);
    }

    #[tokio::test]
    async fn test_subcontext_targets() {
        let engine = Engine::new();
        let sub = engine.mock();
        let merged = sub.merge_command(Command::shell("x"));
        assert!(matches!(merged.target, Target::Mock));

        // An explicit non-local target survives the subcontext.
        let explicit = sub.merge_command(
            Command::shell("x").target(Target::Docker(DockerOptions::new("c"))),
        );
        assert!(matches!(explicit.target, Target::Docker(_)));
    }

    #[tokio::test]
    async fn test_mock_execution_through_engine() {
        let engine = Engine::new().mock();
        engine
            .mock_adapter()
            .respond_to("hostname", MockResponse::ok("worker-1\n"));

        let result = engine.run(Command::shell("hostname")).await.unwrap();
        assert_eq!(result.text(), "worker-1");
    }

    #[tokio::test]
    async fn test_nonzero_exit_throws_without_nothrow() {
        let engine = Engine::new().mock();
        engine
            .mock_adapter()
            .respond_to("bad", MockResponse::fail(2, "boom"));

        let err = engine.run(Command::shell("bad")).await.unwrap_err();
        assert!(err.is_command_failure());

        let result = engine
            .run(Command::shell("bad").nothrow())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(2));
    }

    #[tokio::test]
    async fn test_cached_commands_coalesce() {
        let engine = Engine::new().mock();
        engine.mock_adapter().respond_to(
            "date",
            MockResponse::ok("now").after(Duration::from_millis(40)),
        );

        let mut handles = Vec::new();
        for _ in 0..5 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .run(Command::shell("date").cached(Duration::from_secs(30)))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().text(), "now");
        }
        assert_eq!(engine.mock_adapter().call_count("date"), 1);
    }

    #[tokio::test]
    async fn test_retry_through_engine() {
        let engine = Engine::new().mock();
        // Always fails; retry budget of 1 means two attempts.
        engine
            .mock_adapter()
            .respond_to("flaky", MockResponse::fail(1, ""));

        let policy = RetryPolicy::times(1)
            .initial_delay(Duration::from_millis(5))
            .jitter(false);
        let err = engine
            .run(Command::shell("flaky").retry(policy))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::RetryExhausted { attempts: 2, .. }
        ));
        assert_eq!(engine.mock_adapter().call_count("flaky"), 2);
    }
}
