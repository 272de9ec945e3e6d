//! Event records

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Connection-pool snapshot attached to `ssh:pool-metrics`.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    /// Entries currently pooled.
    pub total_connections: usize,
    /// Entries with at least one in-flight operation.
    pub active_connections: usize,
    /// Lifetime count of acquisitions served from an existing entry.
    pub reuse_count: u64,
    /// Lifetime count of physical connections opened.
    pub connect_count: u64,
}

/// Typed event payloads. [`EventPayload::name`] yields the wire name
/// that glob subscriptions match against.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A physical SSH connection was established.
    SshConnect {
        host: String,
        port: u16,
        username: String,
    },

    /// A pooled SSH connection was closed.
    SshDisconnect { host: String },

    /// A command was dispatched over SSH.
    SshExecute { host: String, command: String },

    /// A private key passed structural validation.
    SshKeyValidated { key_format: String },

    /// Pool snapshot after a change.
    SshPoolMetrics(PoolMetrics),

    /// The background sweeper finished a pass.
    SshPoolCleanup { evicted: usize },

    /// A dead pooled connection was re-established.
    SshReconnect { host: String, attempt: u32 },

    /// A tunnel listener is accepting connections.
    SshTunnelCreated {
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    },

    /// A tunnel was shut down.
    SshTunnelClosed { local_port: u16 },

    /// A transport connection opened (any adapter).
    ConnectionOpen { host: String },

    /// A transport connection closed.
    ConnectionClose { host: String },

    /// A file transfer started.
    TransferStart {
        source: String,
        destination: String,
    },

    /// A file transfer finished successfully.
    TransferComplete {
        source: String,
        destination: String,
        bytes: u64,
        duration: Duration,
    },

    /// A file transfer failed.
    TransferError {
        source: String,
        destination: String,
        message: String,
    },

    /// Result served from cache.
    CacheHit { key: String },

    /// No live cache entry for the key.
    CacheMiss { key: String },

    /// A result was stored.
    CacheSet { key: String },

    /// An entry expired or was invalidated.
    CacheEvict { key: String },

    /// A retry attempt is about to run after a delay.
    RetryAttempt { attempt: u32, delay: Duration },

    /// Retrying eventually succeeded.
    RetrySuccess { attempts: u32, elapsed: Duration },

    /// The retry budget was exhausted.
    RetryFailed { attempts: u32, elapsed: Duration },

    /// A temp artifact was created.
    TempCreate { path: PathBuf },

    /// A temp artifact was removed.
    TempCleanup { path: PathBuf },
}

impl EventPayload {
    /// Wire name, `category:action`.
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::SshConnect { .. } => "ssh:connect",
            EventPayload::SshDisconnect { .. } => "ssh:disconnect",
            EventPayload::SshExecute { .. } => "ssh:execute",
            EventPayload::SshKeyValidated { .. } => "ssh:key-validated",
            EventPayload::SshPoolMetrics(_) => "ssh:pool-metrics",
            EventPayload::SshPoolCleanup { .. } => "ssh:pool-cleanup",
            EventPayload::SshReconnect { .. } => "ssh:reconnect",
            EventPayload::SshTunnelCreated { .. } => "ssh:tunnel-created",
            EventPayload::SshTunnelClosed { .. } => "ssh:tunnel-closed",
            EventPayload::ConnectionOpen { .. } => "connection:open",
            EventPayload::ConnectionClose { .. } => "connection:close",
            EventPayload::TransferStart { .. } => "transfer:start",
            EventPayload::TransferComplete { .. } => "transfer:complete",
            EventPayload::TransferError { .. } => "transfer:error",
            EventPayload::CacheHit { .. } => "cache:hit",
            EventPayload::CacheMiss { .. } => "cache:miss",
            EventPayload::CacheSet { .. } => "cache:set",
            EventPayload::CacheEvict { .. } => "cache:evict",
            EventPayload::RetryAttempt { .. } => "retry:attempt",
            EventPayload::RetrySuccess { .. } => "retry:success",
            EventPayload::RetryFailed { .. } => "retry:failed",
            EventPayload::TempCreate { .. } => "temp:create",
            EventPayload::TempCleanup { .. } => "temp:cleanup",
        }
    }

    /// Host attribute, for events that carry one.
    pub fn host(&self) -> Option<&str> {
        match self {
            EventPayload::SshConnect { host, .. }
            | EventPayload::SshDisconnect { host }
            | EventPayload::SshExecute { host, .. }
            | EventPayload::SshReconnect { host, .. }
            | EventPayload::ConnectionOpen { host }
            | EventPayload::ConnectionClose { host } => Some(host),
            _ => None,
        }
    }
}

/// One emitted event: payload plus auto-stamped envelope fields.
#[derive(Debug, Clone)]
pub struct Event {
    /// The typed payload.
    pub payload: EventPayload,

    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,

    /// Emitting adapter, when adapter-sourced.
    pub adapter: Option<String>,
}

impl Event {
    /// Wire name of the payload.
    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    /// Host attribute of the payload, if any.
    pub fn host(&self) -> Option<&str> {
        self.payload.host()
    }
}
