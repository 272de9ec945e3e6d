//! SSH connection pool
//!
//! One pooled entry per `username@host:port`. A keyed mutex serializes
//! pool access per key, so concurrent first-uses of one target open
//! exactly one physical connection. Entries are bounded by lifetime,
//! idleness, and an error budget; a background sweeper and per-entry
//! keep-alive tasks evict the dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::client::Handle;
use russh::Disconnect;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{self, ClientHandler};
use crate::command::SshOptions;
use crate::error::Result;
use crate::events::{EventBus, EventPayload, PoolMetrics};
use crate::sync::KeyedMutex;

/// Errors tolerated on one entry before it is evicted.
const ERROR_BUDGET: u32 = 3;

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneous pooled connections.
    pub max_connections: usize,
    /// Idle entries older than this are swept.
    pub idle_timeout: Duration,
    /// Entries older than this are never reused.
    pub max_lifetime: Duration,
    /// Run per-entry keep-alive probes.
    pub keep_alive: bool,
    /// Probe cadence.
    pub keep_alive_interval: Duration,
    /// Reconnect dead entries instead of dropping them.
    pub auto_reconnect: bool,
    /// Reconnection attempt budget.
    pub max_reconnect_attempts: u32,
    /// Base reconnection delay; attempt `n` waits `delay × n`.
    pub reconnect_delay: Duration,
    /// Sweeper cadence.
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            keep_alive: true,
            keep_alive_interval: Duration::from_secs(30),
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct Entry {
    handle: Arc<Handle<ClientHandler>>,
    opts: SshOptions,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    error_count: u32,
    reconnect_attempts: u32,
    in_use: u32,
    /// Bumped on every insert/replace; keep-alive tasks self-cancel when
    /// their generation no longer matches the pooled one.
    generation: u64,
}

/// How an execution against a leased connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaseOutcome {
    /// Transport behaved (regardless of exit code).
    Ok,
    /// Transport fault; counts against the error budget.
    Fault,
    /// Deadline fired; the entry is evicted immediately.
    Timeout,
}

/// The pooled connection cache.
pub(crate) struct ConnectionPool {
    entries: parking_lot::Mutex<HashMap<String, Entry>>,
    locks: KeyedMutex<String>,
    config: PoolConfig,
    events: EventBus,
    reuse_count: AtomicU64,
    connect_count: AtomicU64,
    generation: AtomicU64,
    /// Cancels keep-alive tasks and the sweeper on dispose.
    shutdown: CancellationToken,
}

impl ConnectionPool {
    pub(crate) fn new(config: PoolConfig, events: EventBus) -> Arc<Self> {
        let pool = Arc::new(Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
            locks: KeyedMutex::new(),
            config,
            events,
            reuse_count: AtomicU64::new(0),
            connect_count: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        pool.spawn_sweeper();
        pool
    }

    /// Acquire the pooled connection for `opts`, creating or reviving it
    /// as needed. Holds the per-key lock for the whole decision, so two
    /// callers never race to create for the same key.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        opts: &SshOptions,
    ) -> Result<(String, Arc<Handle<ClientHandler>>)> {
        let key = opts.pool_key();
        let _guard = self.locks.acquire(&key).await;

        // Fast path: a live, young-enough entry.
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                let alive = !entry.handle.is_closed();
                let fresh = entry.created_at.elapsed() < self.config.max_lifetime;
                if alive && fresh {
                    entry.use_count += 1;
                    entry.in_use += 1;
                    entry.last_used = Instant::now();
                    let handle = Arc::clone(&entry.handle);
                    drop(entries);
                    self.reuse_count.fetch_add(1, Ordering::Relaxed);
                    self.publish_metrics();
                    return Ok((key, handle));
                }
            }
        }

        // Dead or expired entry: reconnect when allowed, else discard.
        let stale = self.entries.lock().remove(&key);
        if let Some(stale) = stale {
            let dead = stale.handle.is_closed();
            if dead && self.config.auto_reconnect {
                if let Some(handle) = self.try_reconnect(&key, &stale.opts).await {
                    if let Some(entry) = self.entries.lock().get_mut(&key) {
                        entry.use_count += 1;
                        entry.in_use += 1;
                        entry.last_used = Instant::now();
                    }
                    return Ok((key, handle));
                }
            }
            self.events.publish_for(
                "ssh",
                EventPayload::SshDisconnect {
                    host: stale.opts.host.clone(),
                },
            );
        }

        // Room check, then a fresh physical connection.
        self.evict_oldest_idle_if_full();
        let handle = Arc::new(client::connect(opts).await?);
        self.connect_count.fetch_add(1, Ordering::Relaxed);
        self.events.publish_for(
            "ssh",
            EventPayload::SshConnect {
                host: opts.host.clone(),
                port: opts.port,
                username: opts.username.clone(),
            },
        );
        self.events.publish_for(
            "ssh",
            EventPayload::ConnectionOpen {
                host: opts.host.clone(),
            },
        );

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries.lock().insert(
            key.clone(),
            Entry {
                handle: Arc::clone(&handle),
                opts: opts.clone(),
                created_at: Instant::now(),
                last_used: Instant::now(),
                use_count: 1,
                error_count: 0,
                reconnect_attempts: 0,
                in_use: 1,
                generation,
            },
        );
        if self.config.keep_alive {
            self.spawn_keepalive(key.clone(), generation);
        }
        self.publish_metrics();
        Ok((key, handle))
    }

    /// Reconnection loop for a dead entry; runs under the caller's key
    /// lock. Attempt `n` waits `reconnect_delay × n` first.
    async fn try_reconnect(
        self: &Arc<Self>,
        key: &str,
        opts: &SshOptions,
    ) -> Option<Arc<Handle<ClientHandler>>> {
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_delay * attempt).await;
            self.events.publish_for(
                "ssh",
                EventPayload::SshReconnect {
                    host: opts.host.clone(),
                    attempt,
                },
            );
            match client::connect(opts).await {
                Ok(handle) => {
                    info!(key, attempt, "reconnected pooled ssh connection");
                    let handle = Arc::new(handle);
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    self.connect_count.fetch_add(1, Ordering::Relaxed);
                    self.entries.lock().insert(
                        key.to_string(),
                        Entry {
                            handle: Arc::clone(&handle),
                            opts: opts.clone(),
                            created_at: Instant::now(),
                            last_used: Instant::now(),
                            use_count: 0,
                            error_count: 0,
                            reconnect_attempts: attempt,
                            in_use: 0,
                            generation,
                        },
                    );
                    if self.config.keep_alive {
                        self.spawn_keepalive(key.to_string(), generation);
                    }
                    self.publish_metrics();
                    return Some(handle);
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        None
    }

    /// Report how a leased connection behaved. Faults count against the
    /// error budget; a timeout evicts immediately.
    pub(crate) async fn release(&self, key: &str, outcome: LeaseOutcome) {
        let evict = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(key) else {
                return;
            };
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.last_used = Instant::now();
            match outcome {
                LeaseOutcome::Ok => None,
                LeaseOutcome::Fault => {
                    entry.error_count += 1;
                    if entry.error_count > ERROR_BUDGET {
                        entries.remove(key)
                    } else {
                        None
                    }
                }
                LeaseOutcome::Timeout => entries.remove(key),
            }
        };

        if let Some(entry) = evict {
            debug!(key, ?outcome, "evicting pooled connection");
            self.close_entry(entry).await;
            self.publish_metrics();
        }
    }

    /// Evict the oldest-idle entry when the pool is at capacity. Called
    /// with no entry lock held beyond this function.
    fn evict_oldest_idle_if_full(self: &Arc<Self>) {
        let evicted = {
            let mut entries = self.entries.lock();
            if entries.len() < self.config.max_connections {
                return;
            }
            let oldest = entries
                .iter()
                .filter(|(_, e)| e.in_use == 0)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
                // Everything busy: evict the coldest anyway to make room.
                .or_else(|| {
                    entries
                        .iter()
                        .min_by_key(|(_, e)| e.last_used)
                        .map(|(k, _)| k.clone())
                });
            oldest.and_then(|k| entries.remove(&k))
        };
        if let Some(entry) = evicted {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.close_entry(entry).await;
            });
        }
    }

    async fn close_entry(&self, entry: Entry) {
        let _ = entry
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
        self.events.publish_for(
            "ssh",
            EventPayload::SshDisconnect {
                host: entry.opts.host.clone(),
            },
        );
        self.events.publish_for(
            "ssh",
            EventPayload::ConnectionClose {
                host: entry.opts.host.clone(),
            },
        );
    }

    /// Per-entry keep-alive: a cooperative task that probes the
    /// connection and exits as soon as its entry leaves the pool.
    fn spawn_keepalive(self: &Arc<Self>, key: String, generation: u64) {
        let pool = Arc::downgrade(self);
        let interval = self.config.keep_alive_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(pool) = pool.upgrade() else { return };

                // Still-in-pool guard: another generation under this key
                // means the entry was replaced and this task must die.
                let handle = {
                    let entries = pool.entries.lock();
                    match entries.get(&key) {
                        Some(entry) if entry.generation == generation => {
                            Arc::clone(&entry.handle)
                        }
                        _ => return,
                    }
                };

                if client::keepalive_probe(&handle).await.is_ok() {
                    continue;
                }
                debug!(key, "keepalive probe failed");

                // Revive or drop, under the key lock like any other
                // mutation.
                let _guard = pool.locks.acquire(&key).await;
                let current = {
                    let mut entries = pool.entries.lock();
                    match entries.get(&key) {
                        Some(entry) if entry.generation == generation => entries.remove(&key),
                        _ => return,
                    }
                };
                let Some(entry) = current else { return };

                if pool.config.auto_reconnect {
                    if pool.try_reconnect(&key, &entry.opts).await.is_some() {
                        pool.close_entry(entry).await;
                        // A new keep-alive task owns the new generation.
                        return;
                    }
                }
                pool.close_entry(entry).await;
                pool.publish_metrics();
                return;
            }
        });
    }

    /// Background sweeper: evicts idle, expired, and dead entries. Never
    /// propagates failures.
    fn spawn_sweeper(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(pool) = pool.upgrade() else { return };

                let doomed: Vec<Entry> = {
                    let mut entries = pool.entries.lock();
                    let keys: Vec<String> = entries
                        .iter()
                        .filter(|(_, e)| {
                            e.handle.is_closed()
                                || e.created_at.elapsed() >= pool.config.max_lifetime
                                || (e.in_use == 0
                                    && e.last_used.elapsed() >= pool.config.idle_timeout)
                        })
                        .map(|(k, _)| k.clone())
                        .collect();
                    keys.iter().filter_map(|k| entries.remove(k)).collect()
                };

                let evicted = doomed.len();
                for entry in doomed {
                    pool.close_entry(entry).await;
                }
                if evicted > 0 {
                    debug!(evicted, "pool sweep evicted entries");
                }
                pool.events
                    .publish_for("ssh", EventPayload::SshPoolCleanup { evicted });
                pool.publish_metrics();
            }
        });
    }

    fn publish_metrics(&self) {
        self.events
            .publish_for("ssh", EventPayload::SshPoolMetrics(self.metrics()));
    }

    /// Current pool metrics.
    pub(crate) fn metrics(&self) -> PoolMetrics {
        let entries = self.entries.lock();
        PoolMetrics {
            total_connections: entries.len(),
            active_connections: entries.values().filter(|e| e.in_use > 0).count(),
            reuse_count: self.reuse_count.load(Ordering::Relaxed),
            connect_count: self.connect_count.load(Ordering::Relaxed),
        }
    }

    /// Number of pooled entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the pool holds an entry for `key`.
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Close every connection in parallel and stop the background tasks.
    pub(crate) async fn dispose(&self) {
        self.shutdown.cancel();
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, e)| e).collect()
        };
        let closers = drained.into_iter().map(|entry| async move {
            let _ = entry
                .handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            entry.opts.host.clone()
        });
        let hosts = futures::future::join_all(closers).await;
        for host in hosts {
            self.events
                .publish_for("ssh", EventPayload::SshDisconnect { host: host.clone() });
            self.events
                .publish_for("ssh", EventPayload::ConnectionClose { host });
        }
    }
}
