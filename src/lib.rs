//! uex — universal command execution engine
//!
//! Runs shell commands uniformly across four environments — the local
//! host, remote hosts over SSH, Docker containers, and Kubernetes pods —
//! behind one adapter interface. On top of that substrate: safe argument
//! quoting, file transfer between any two environments, SSH tunnels and
//! port-forwards, piping, parallel and pipeline composition, retry with
//! backoff, result caching with request coalescing, secure sudo password
//! handling, and a filtered/wildcard event bus.
//!
//! ```no_run
//! use uex::{Command, Engine};
//!
//! # async fn example() -> uex::Result<()> {
//! let engine = Engine::new();
//! let result = engine.sh("uname -r").await?;
//! println!("kernel: {}", result.text());
//!
//! let remote = engine.ssh(uex::SshOptions::new("web-1", "deploy").password("…"));
//! let uptime = remote.run(Command::new("uptime")).await?;
//! println!("{}", uptime);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod cache;
pub mod command;
pub mod engine;
pub mod error;
pub mod escape;
pub mod events;
pub mod parallel;
pub mod pipeline;
pub mod process;
pub mod result;
pub mod retry;
pub mod secrets;
pub mod stream;
pub mod sync;
pub mod temp;
pub mod transfer;

// Re-export the everyday surface.
pub use adapters::ssh::{PoolConfig, SshAdapterConfig, TunnelHandle, TunnelRequest};
pub use adapters::{Adapter, DockerAdapter, KubernetesAdapter, LocalAdapter, MockAdapter, SshAdapter};
pub use command::{
    Command, DockerOptions, K8sOptions, OutputMode, ShellMode, SshOptions, StdinPayload,
    SudoMethod, SudoOptions, Target,
};
pub use engine::{Engine, EngineBuilder, EngineConfig};
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, EventBus, EventFilter, EventPayload, PoolMetrics};
pub use process::ProcessPromise;
pub use result::ExecutionResult;
pub use retry::RetryPolicy;
pub use secrets::SecurePasswordHandler;
pub use transfer::{TransferEngine, TransferOptions, TransferOutcome, TransferProgress};
