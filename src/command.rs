//! Command description
//!
//! A [`Command`] is an immutable description of one execution: what to run,
//! where, with which streams, deadline, and target environment. Builders
//! return new values; adapters never mutate a command they receive.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::escape::{self, Platform};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// The text of a command: a pre-built shell string or an argv vector.
#[derive(Debug, Clone)]
pub enum CommandText {
    /// Single string, interpreted by a shell.
    Shell(String),
    /// Program plus arguments, executed directly unless a shell is forced.
    Argv(Vec<String>),
}

/// How (whether) the command goes through a shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ShellMode {
    /// No shell: argv is executed directly.
    Never,
    /// The platform default shell (`/bin/sh -c` on Unix).
    #[default]
    Default,
    /// A named shell binary.
    Named(String),
}

/// Inline stdin payload for the command.
#[derive(Debug, Clone, Default)]
pub enum StdinPayload {
    /// No stdin; the stream is closed immediately.
    #[default]
    None,
    /// Raw bytes written before EOF.
    Bytes(Bytes),
}

impl StdinPayload {
    /// Text payload helper.
    pub fn text(s: impl Into<String>) -> Self {
        StdinPayload::Bytes(Bytes::from(s.into().into_bytes()))
    }

    /// The payload bytes, if any.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            StdinPayload::None => None,
            StdinPayload::Bytes(b) => Some(b),
        }
    }
}

/// Disposition of an output stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Capture into the result (bounded).
    #[default]
    Pipe,
    /// Inherit the parent's stream (local adapter only; remote adapters
    /// treat this as `Pipe`).
    Inherit,
    /// Discard.
    Ignore,
}

/// Password-delivery method for sudo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SudoMethod {
    /// Pipe the password to `sudo -S`. The password transits a shell pipe
    /// and is visible in process listings on the remote host.
    #[default]
    Stdin,
    /// Point `SUDO_ASKPASS` at a pre-existing askpass executable.
    Askpass,
    /// Like `Stdin` but via `echo`; kept for compatibility, insecure.
    Echo,
    /// Write a one-shot askpass script on the remote host, run `sudo -A`,
    /// delete the script. Recommended.
    SecureAskpass,
}

/// Sudo configuration for SSH commands.
#[derive(Debug, Clone, Default)]
pub struct SudoOptions {
    /// Master switch; off by default.
    pub enabled: bool,
    /// Password delivered by the chosen method.
    pub password: Option<String>,
    /// Custom prompt override passed to `sudo -p`.
    pub prompt: Option<String>,
    /// Delivery method.
    pub method: SudoMethod,
    /// Target user (`sudo -u`); defaults to root.
    pub user: Option<String>,
    /// Path to an existing askpass program, required by
    /// [`SudoMethod::Askpass`].
    pub askpass_path: Option<String>,
}

/// SSH connection options.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Remote host (required).
    pub host: String,
    /// Remote username (required).
    pub username: String,
    /// Remote port, 1..=65535.
    pub port: u16,
    /// Private key material (PEM or OpenSSH). Mutually exclusive with
    /// `password`.
    pub private_key: Option<String>,
    /// Passphrase for an encrypted private key.
    pub passphrase: Option<String>,
    /// Password authentication. Mutually exclusive with `private_key`.
    pub password: Option<String>,
    /// Sudo defaults applied to every command on this target.
    pub sudo: Option<SudoOptions>,
}

impl SshOptions {
    /// Options for `username@host` on the default port.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            port: 22,
            private_key: None,
            passphrase: None,
            password: None,
            sudo: None,
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Authenticate with a password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Authenticate with private key material.
    pub fn private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Set the key passphrase.
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Enable sudo with the given options.
    pub fn sudo(mut self, sudo: SudoOptions) -> Self {
        self.sudo = Some(sudo);
        self
    }

    /// Pool key for this target: `username@host:port`.
    pub fn pool_key(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Docker exec options.
#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Container name or id (required).
    pub container: String,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// User to exec as.
    pub user: Option<String>,
    /// Allocate a TTY.
    pub tty: bool,
}

impl DockerOptions {
    /// Options for the named container.
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            workdir: None,
            user: None,
            tty: false,
        }
    }

    /// Set the working directory.
    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Set the exec user.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Kubernetes exec options.
#[derive(Debug, Clone)]
pub struct K8sOptions {
    /// Pod name (required).
    pub pod: String,
    /// Namespace; `default` when unset.
    pub namespace: Option<String>,
    /// Container within the pod.
    pub container: Option<String>,
    /// Kubeconfig context.
    pub context: Option<String>,
}

impl K8sOptions {
    /// Options for the named pod.
    pub fn new(pod: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            namespace: None,
            container: None,
            context: None,
        }
    }

    /// Set the namespace.
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.namespace = Some(ns.into());
        self
    }

    /// Set the container.
    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    /// Set the kubeconfig context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Target execution environment with per-adapter options.
#[derive(Debug, Clone, Default)]
pub enum Target {
    /// The local host.
    #[default]
    Local,
    /// A remote host over SSH.
    Ssh(SshOptions),
    /// A Docker container.
    Docker(DockerOptions),
    /// A Kubernetes pod.
    K8s(K8sOptions),
    /// The deterministic mock adapter (tests).
    Mock,
}

impl Target {
    /// Adapter name this target dispatches to.
    pub fn adapter_name(&self) -> &'static str {
        match self {
            Target::Local => "local",
            Target::Ssh(_) => "ssh",
            Target::Docker(_) => "docker",
            Target::K8s(_) => "k8s",
            Target::Mock => "mock",
        }
    }
}

/// Immutable description of one execution.
#[derive(Debug, Clone)]
pub struct Command {
    /// What to run.
    pub text: CommandText,
    /// Shell interpretation mode.
    pub shell: ShellMode,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Environment overrides layered on top of the target's environment.
    pub env: HashMap<String, String>,
    /// Inline stdin payload.
    pub stdin: StdinPayload,
    /// Stdout disposition.
    pub stdout: OutputMode,
    /// Stderr disposition.
    pub stderr: OutputMode,
    /// Deadline for the whole execution.
    pub timeout: Option<Duration>,
    /// Cancellation token; firing aborts the execution.
    pub cancel: CancellationToken,
    /// Target environment.
    pub target: Target,
    /// Return failures as results instead of errors.
    pub nothrow: bool,
    /// Suppress per-line output tracing.
    pub quiet: bool,
    /// Hide arguments when the command appears in error messages.
    pub sanitize: bool,
    /// Retry policy applied around the adapter call.
    pub retry: Option<RetryPolicy>,
    /// Cache TTL; when set, results are memoized and concurrent identical
    /// requests coalesce.
    pub cache_ttl: Option<Duration>,
}

impl Command {
    /// Safe builder entry: a program with arguments, each quoted when the
    /// command line is rendered.
    pub fn new(program: impl Into<String>) -> Self {
        Self::from_text(CommandText::Argv(vec![program.into()]))
    }

    /// Raw entry: a pre-built shell string.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::from_text(CommandText::Shell(script.into()))
    }

    fn from_text(text: CommandText) -> Self {
        Self {
            text,
            shell: ShellMode::Default,
            cwd: None,
            env: HashMap::new(),
            stdin: StdinPayload::None,
            stdout: OutputMode::Pipe,
            stderr: OutputMode::Pipe,
            timeout: None,
            cancel: CancellationToken::new(),
            target: Target::Local,
            nothrow: false,
            quiet: false,
            sanitize: false,
            retry: None,
            cache_ttl: None,
        }
    }

    /// Append one argument (argv form only; ignored for shell strings).
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        if let CommandText::Argv(ref mut argv) = self.text {
            argv.push(arg.into());
        }
        self
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let CommandText::Argv(ref mut argv) = self.text {
            argv.extend(args.into_iter().map(Into::into));
        }
        self
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set one environment variable.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge environment variables.
    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Set the stdin payload.
    pub fn stdin(mut self, payload: StdinPayload) -> Self {
        self.stdin = payload;
        self
    }

    /// Set the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use the given cancellation token instead of a fresh one.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Set the target environment.
    pub fn target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    /// Disable shell interpretation (argv is executed directly).
    pub fn no_shell(mut self) -> Self {
        self.shell = ShellMode::Never;
        self
    }

    /// Use a named shell.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = ShellMode::Named(shell.into());
        self
    }

    /// Return failures as results instead of errors.
    pub fn nothrow(mut self) -> Self {
        self.nothrow = true;
        self
    }

    /// Suppress per-line output tracing.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    /// Hide arguments in error messages.
    pub fn sanitize(mut self) -> Self {
        self.sanitize = true;
        self
    }

    /// Retry with the given policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Memoize the result for `ttl`, coalescing concurrent identical runs.
    pub fn cached(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Render the single command-line string for shell execution, quoting
    /// argv elements with the platform rules.
    pub fn command_string(&self, platform: Platform) -> String {
        match &self.text {
            CommandText::Shell(s) => s.clone(),
            CommandText::Argv(argv) => {
                escape::join_argv(argv.iter().map(String::as_str), platform)
            }
        }
    }

    /// The argv to execute directly (no shell). Shell strings are split
    /// with POSIX tokenization.
    pub fn argv(&self) -> Result<Vec<String>> {
        match &self.text {
            CommandText::Argv(argv) => Ok(argv.clone()),
            CommandText::Shell(s) => shell_words::split(s).map_err(|e| {
                Error::adapter("command", format!("cannot split shell string into argv: {}", e))
            }),
        }
    }

    /// The command as shown in errors and events, honoring `sanitize`.
    pub fn display_string(&self) -> String {
        let full = self.command_string(Platform::Unix);
        if !self.sanitize {
            return full;
        }
        match &self.text {
            CommandText::Argv(argv) if !argv.is_empty() => {
                format!("{} [arguments hidden]", argv[0])
            }
            _ => {
                let program = full.split_whitespace().next().unwrap_or("");
                format!("{} [arguments hidden]", program)
            }
        }
    }

    /// Shell binary to use for [`ShellMode::Default`]/`Named`.
    pub fn shell_program(&self) -> Option<String> {
        match &self.shell {
            ShellMode::Never => None,
            ShellMode::Default => Some("/bin/sh".to_string()),
            ShellMode::Named(name) => Some(name.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argv_quoting() {
        let cmd = Command::new("echo").arg("hello world").arg("plain");
        assert_eq!(
            cmd.command_string(Platform::Unix),
            "echo 'hello world' plain"
        );
    }

    #[test]
    fn test_shell_string_passthrough() {
        let cmd = Command::shell("echo $HOME | wc -c");
        assert_eq!(cmd.command_string(Platform::Unix), "echo $HOME | wc -c");
    }

    #[test]
    fn test_argv_from_shell_string() {
        let cmd = Command::shell("echo 'a b' c");
        assert_eq!(
            cmd.argv().unwrap(),
            vec!["echo".to_string(), "a b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_sanitized_display() {
        let cmd = Command::new("curl")
            .arg("-H")
            .arg("Authorization: Bearer tok")
            .sanitize();
        assert_eq!(cmd.display_string(), "curl [arguments hidden]");
        assert!(!cmd.display_string().contains("Bearer"));
    }

    #[test]
    fn test_pool_key_format() {
        let opts = SshOptions::new("example.com", "deploy").port(2222);
        assert_eq!(opts.pool_key(), "deploy@example.com:2222");
    }

    #[test]
    fn test_builder_layers() {
        let cmd = Command::new("ls")
            .cwd("/tmp")
            .env_var("A", "1")
            .timeout(Duration::from_secs(5))
            .nothrow();
        assert_eq!(cmd.cwd.as_deref(), Some(std::path::Path::new("/tmp")));
        assert_eq!(cmd.env.get("A").map(String::as_str), Some("1"));
        assert!(cmd.nothrow);
    }
}
