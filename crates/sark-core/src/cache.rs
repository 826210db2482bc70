//! Policy-decision cache.
//!
//! Concurrent LRU+TTL map from decision fingerprint to an immutable
//! `PolicyDecision`. Expiry is enforced lazily at read time, independent of
//! the background sweeper, so a stale decision is never served. At capacity,
//! an already-expired entry is evicted before any live LRU entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::model::{PolicyDecision, Sensitivity};

/// Cache tuning. TTL defaults follow resource sensitivity; an explicit
/// per-call TTL always wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Default TTLs (seconds) by sensitivity. Illustrative defaults; callers
    /// override via configuration.
    #[serde(default = "default_sensitivity_ttls")]
    pub sensitivity_ttl_secs: HashMap<Sensitivity, u64>,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_max_size() -> usize {
    10_000
}

fn default_sensitivity_ttls() -> HashMap<Sensitivity, u64> {
    HashMap::from([
        (Sensitivity::Critical, 60),
        (Sensitivity::High, 120),
        (Sensitivity::Medium, 180),
        (Sensitivity::Low, 300),
    ])
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            sensitivity_ttl_secs: default_sensitivity_ttls(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, sensitivity: Sensitivity) -> Duration {
        let secs = self
            .sensitivity_ttl_secs
            .get(&sensitivity)
            .copied()
            .unwrap_or(180);
        Duration::from_secs(secs)
    }
}

struct CacheEntry {
    decision: Arc<PolicyDecision>,
    expires_at: Instant,
    created_at: Instant,
    last_access: AtomicU64,
}

/// Cache counters, exposed through the metrics surface.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_evictions: u64,
}

#[derive(Default)]
struct StatCells {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_evictions: AtomicU64,
}

pub struct PolicyCache {
    config: CacheConfig,
    entries: DashMap<String, CacheEntry>,
    // Monotonic access sequence; per-entry last_access holds its latest tick.
    access_clock: AtomicU64,
    // Serializes the evict-then-insert sequence on the miss path so capacity
    // is a hard bound. Reads never touch it.
    insert_lock: Mutex<()>,
    stats: StatCells,
}

impl PolicyCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            access_clock: AtomicU64::new(0),
            insert_lock: Mutex::new(()),
            stats: StatCells::default(),
        }
    }

    /// Look up a cached decision. An entry past `expires_at` is removed and
    /// reported as a miss even if no sweep has run yet.
    pub fn get(&self, key: &str) -> Option<Arc<PolicyDecision>> {
        let now = Instant::now();
        let decision = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                let tick = self.access_clock.fetch_add(1, Ordering::Relaxed) + 1;
                entry.last_access.store(tick, Ordering::Relaxed);
                Some(entry.decision.clone())
            }
            Some(_) => None,
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match decision {
            Some(d) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(d)
            }
            None => {
                // Lazy expiry: drop the stale entry now.
                self.entries.remove_if(key, |_, e| e.expires_at <= now);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                self.stats.expired_evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a decision under `key`. `ttl` overrides the sensitivity
    /// default. Concurrent writers for the same key race last-write-wins,
    /// which is sound because evaluation is deterministic.
    pub fn set(
        &self,
        key: impl Into<String>,
        decision: PolicyDecision,
        sensitivity: Sensitivity,
        ttl: Option<Duration>,
    ) {
        let key = key.into();
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(sensitivity));
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let tick = self.access_clock.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = CacheEntry {
            decision: Arc::new(decision),
            expires_at: now + ttl,
            created_at: now,
            last_access: AtomicU64::new(tick),
        };

        // A poisoned lock only means a panicked writer; the map itself is
        // still coherent, so keep serving.
        let _guard = match self.insert_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.config.max_size {
                if !self.evict_one(now) {
                    break;
                }
            }
        }
        self.entries.insert(key, entry);
    }

    /// Remove a single entry. Returns whether anything was removed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every expired entry. Runs on the background tick; correctness
    /// never depends on it because `get` checks expiry itself.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.stats
                .expired_evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "cache sweep removed expired entries");
        }
        removed
    }

    /// Spawn the periodic sweeper. The returned handle owns the task; abort
    /// it on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                cache.cleanup_expired();
            }
        })
    }

    /// Default TTL this cache applies for a sensitivity level.
    pub fn ttl_for(&self, sensitivity: Sensitivity) -> Duration {
        self.config.ttl_for(sensitivity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expired_evictions: self.stats.expired_evictions.load(Ordering::Relaxed),
        }
    }

    /// Age of the entry under `key`, for diagnostics.
    pub fn entry_age(&self, key: &str) -> Option<Duration> {
        self.entries.get(key).map(|e| e.created_at.elapsed())
    }

    // Evict exactly one entry: any expired entry first, otherwise the
    // least-recently-accessed live one.
    fn evict_one(&self, now: Instant) -> bool {
        let mut expired: Option<String> = None;
        let mut lru: Option<(String, u64)> = None;

        for entry in self.entries.iter() {
            if entry.expires_at <= now {
                expired = Some(entry.key().clone());
                break;
            }
            let tick = entry.last_access.load(Ordering::Relaxed);
            match &lru {
                Some((_, best)) if *best <= tick => {}
                _ => lru = Some((entry.key().clone(), tick)),
            }
        }

        let victim = expired.clone().or_else(|| lru.map(|(k, _)| k));
        match victim {
            Some(key) => {
                if self.entries.remove(&key).is_some() {
                    if expired.is_some() {
                        self.stats.expired_evictions.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }
}
