//! Execution adapters
//!
//! Each adapter implements the uniform [`Adapter`] contract against one
//! execution environment. The engine merges commands with its defaults,
//! dispatches to the adapter named by the command's target, and finalizes
//! the outcome (`nothrow` handling) in [`finalize`].

pub mod docker;
pub mod kubernetes;
pub mod local;
pub mod mock;
pub mod ssh;
pub(crate) mod subprocess;

use async_trait::async_trait;

use crate::command::Command;
use crate::error::Result;
use crate::result::ExecutionResult;

pub use docker::DockerAdapter;
pub use kubernetes::{KubernetesAdapter, PortForwardHandle};
pub use local::LocalAdapter;
pub use mock::{MockAdapter, MockResponse};
pub use ssh::SshAdapter;

/// Uniform execution contract implemented by every environment.
///
/// `execute` resolves to a result for any command that ran to completion,
/// regardless of exit code; transport faults and (when `nothrow` is off)
/// timeouts surface as errors. Non-zero exits become errors only in
/// [`finalize`], so adapters stay usable as raw transports.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter name (`local`, `ssh`, `docker`, `k8s`, `mock`).
    fn name(&self) -> &'static str;

    /// Whether the environment is reachable (daemon up, binary present).
    async fn is_available(&self) -> bool;

    /// Run one command to completion.
    async fn execute(&self, command: Command) -> Result<ExecutionResult>;

    /// Release every held resource (connections, tunnels, secrets).
    async fn dispose(&self) -> Result<()>;
}

/// Apply the `nothrow` contract to an adapter outcome: with `nothrow` off,
/// a completed-but-failed result becomes [`crate::Error::Command`];
/// with it on, the result passes through. Transport errors propagate
/// either way.
pub(crate) fn finalize(command: &Command, result: ExecutionResult) -> Result<ExecutionResult> {
    if !command.nothrow && !result.ok() {
        return Err(result.into_command_error());
    }
    Ok(result)
}

/// Map a Unix signal number to its conventional name.
pub(crate) fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        14 => "SIGALRM".to_string(),
        15 => "SIGTERM".to_string(),
        _ => format!("SIG{}", signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultBuilder;

    fn completed(code: i32) -> ExecutionResult {
        ResultBuilder::start("cmd", "mock").finish(Vec::new(), Vec::new(), Some(code), None)
    }

    #[test]
    fn test_finalize_throws_on_failure() {
        let cmd = Command::shell("false");
        let err = finalize(&cmd, completed(3)).unwrap_err();
        assert!(err.is_command_failure());
    }

    #[test]
    fn test_finalize_nothrow_passes_failure_through() {
        let cmd = Command::shell("false").nothrow();
        let result = finalize(&cmd, completed(3)).unwrap();
        assert_eq!(result.exit_code, Some(3));
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(64), "SIG64");
    }
}
