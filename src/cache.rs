//! Result cache with inflight request coalescing
//!
//! Keys are SHA-256 digests over a canonical JSON of the command string,
//! working directory, and environment. Concurrent callers computing the
//! same key share one underlying execution: the first becomes the leader,
//! the rest await the leader's broadcast.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::events::{EventBus, EventPayload};
use crate::result::ExecutionResult;

/// Default sweep interval for expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct CacheEntry {
    result: ExecutionResult,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.stored_at.elapsed() >= self.ttl
    }
}

/// Size and hit-rate statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Live entries.
    pub size: usize,
    /// Lifetime hits.
    pub hits: u64,
    /// Lifetime misses.
    pub misses: u64,
}

impl CacheStats {
    /// Hits over total lookups, 0.0 when none.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type InflightSender = broadcast::Sender<std::result::Result<ExecutionResult, crate::error::Error>>;

/// Keyed, TTL-bounded result memoization with coalescing.
pub struct ResultCache {
    entries: parking_lot::Mutex<HashMap<String, CacheEntry>>,
    inflight: parking_lot::Mutex<HashMap<String, InflightSender>>,
    hits: AtomicU64,
    misses: AtomicU64,
    events: EventBus,
    sweeper: parking_lot::Mutex<Option<CancellationToken>>,
}

impl ResultCache {
    /// New cache publishing `cache:*` events on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: parking_lot::Mutex::new(HashMap::new()),
            inflight: parking_lot::Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            events,
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    /// Cache key for `(command, cwd, env)`: SHA-256 over a canonical JSON
    /// rendering (sorted env keys).
    pub fn cache_key(
        command: &str,
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> String {
        let sorted: BTreeMap<&str, &str> =
            env.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let canonical = serde_json::json!({
            "command": command,
            "cwd": cwd.map(|p| p.to_string_lossy().into_owned()),
            "env": sorted,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex::encode(digest)
    }

    /// Look up a live entry; expired entries are evicted on the way.
    pub fn get(&self, key: &str) -> Option<ExecutionResult> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if !entry.expired() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.events.publish(EventPayload::CacheHit {
                    key: key.to_string(),
                });
                Some(entry.result.clone())
            }
            Some(_) => {
                entries.remove(key);
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.events.publish(EventPayload::CacheEvict {
                    key: key.to_string(),
                });
                self.events.publish(EventPayload::CacheMiss {
                    key: key.to_string(),
                });
                None
            }
            None => {
                drop(entries);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.events.publish(EventPayload::CacheMiss {
                    key: key.to_string(),
                });
                None
            }
        }
    }

    /// Store a result under `key` for `ttl`.
    pub fn set(&self, key: &str, result: ExecutionResult, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                result,
                stored_at: Instant::now(),
                ttl,
            },
        );
        self.events.publish(EventPayload::CacheSet {
            key: key.to_string(),
        });
    }

    /// Serve from cache, or run `exec` once and share its outcome with
    /// every concurrent caller of the same key.
    pub async fn get_or_execute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        exec: F,
    ) -> Result<ExecutionResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionResult>>,
    {
        if let Some(result) = self.get(key) {
            return Ok(result);
        }

        // Either become the leader for this key or subscribe to the one
        // already running.
        enum Role {
            Follower(broadcast::Receiver<Result<ExecutionResult>>),
            Leader(broadcast::Sender<Result<ExecutionResult>>),
        }

        let role = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(tx) => Role::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.to_string(), tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        let leader_tx = match role {
            Role::Follower(mut rx) => {
                debug!(key, "coalescing onto inflight execution");
                return match rx.recv().await {
                    Ok(outcome) => outcome,
                    // Leader dropped without broadcasting; treat as a
                    // miss and rerun.
                    Err(_) => Box::pin(self.get_or_execute(key, ttl, exec)).await,
                };
            }
            Role::Leader(tx) => tx,
        };

        let outcome = exec().await;

        if let Ok(result) = &outcome {
            self.set(key, result.clone(), ttl);
        }
        self.inflight.lock().remove(key);
        let _ = leader_tx.send(outcome.clone());
        outcome
    }

    /// Remove entries whose key matches any of the glob patterns.
    /// Returns the number evicted.
    pub fn invalidate(&self, patterns: &[&str]) -> usize {
        let compiled: Vec<glob::Pattern> = patterns
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .collect();
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .keys()
            .filter(|key| compiled.iter().any(|p| p.matches(key)))
            .cloned()
            .collect();
        for key in &doomed {
            entries.remove(key);
            self.events
                .publish(EventPayload::CacheEvict { key: key.clone() });
        }
        doomed.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Start the background sweeper; replaces any previous sweeper.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.sweeper.lock().replace(token.clone()) {
            previous.cancel();
        }

        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(cache) = cache.upgrade() else { break };
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!(evicted, "cache sweep evicted expired entries");
                }
            }
        });
    }

    /// Stop the background sweeper, if running.
    pub fn stop_sweeper(&self) {
        if let Some(token) = self.sweeper.lock().take() {
            token.cancel();
        }
    }

    /// One sweep pass; failures never escape.
    fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
            self.events
                .publish(EventPayload::CacheEvict { key: key.clone() });
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ResultBuilder;
    use std::sync::atomic::AtomicU32;

    fn outcome(stdout: &str) -> ExecutionResult {
        ResultBuilder::start("cmd", "mock").finish(
            stdout.as_bytes().to_vec(),
            Vec::new(),
            Some(0),
            None,
        )
    }

    #[test]
    fn test_key_is_stable_under_env_order() {
        let mut env1 = HashMap::new();
        env1.insert("A".to_string(), "1".to_string());
        env1.insert("B".to_string(), "2".to_string());
        let mut env2 = HashMap::new();
        env2.insert("B".to_string(), "2".to_string());
        env2.insert("A".to_string(), "1".to_string());

        assert_eq!(
            ResultCache::cache_key("ls", None, &env1),
            ResultCache::cache_key("ls", None, &env2)
        );
        assert_ne!(
            ResultCache::cache_key("ls", None, &env1),
            ResultCache::cache_key("ls -l", None, &env1)
        );
    }

    #[tokio::test]
    async fn test_hit_after_set() {
        let cache = ResultCache::new(EventBus::new());
        let key = "k1";
        assert!(cache.get(key).is_none());
        cache.set(key, outcome("v"), Duration::from_secs(60));
        assert_eq!(cache.get(key).unwrap().stdout, "v");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_expiry_evicts() {
        let cache = ResultCache::new(EventBus::new());
        cache.set("k", outcome("v"), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn test_coalescing_runs_once() {
        let cache = Arc::new(ResultCache::new(EventBus::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_execute("same-key", Duration::from_secs(60), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(outcome("shared"))
                    })
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().stdout, "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_glob() {
        let cache = ResultCache::new(EventBus::new());
        cache.set("abc-1", outcome("1"), Duration::from_secs(60));
        cache.set("abc-2", outcome("2"), Duration::from_secs(60));
        cache.set("zzz", outcome("3"), Duration::from_secs(60));

        assert_eq!(cache.invalidate(&["abc-*"]), 2);
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn test_sweeper_emits_evictions() {
        let events = EventBus::new();
        let mut rx = events.subscribe_matching("cache:evict");
        let cache = Arc::new(ResultCache::new(events));
        cache.set("doomed", outcome("x"), Duration::from_millis(5));
        cache.start_sweeper(Duration::from_millis(20));

        let evicted = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("sweeper should evict within the window")
            .unwrap();
        assert_eq!(evicted.name(), "cache:evict");
        cache.stop_sweeper();
    }
}
