//! Reputation Cache
//!
//! Short-lived memoization of lookups keyed by the normalized identity triple.
//!
//! - Entries expire a fixed TTL after insertion, whether or not they are read
//! - Capacity-bounded; the least recently used entry goes first, ties by insertion order
//! - Concurrent misses for the same key share one fetch
//! - Failed fetches are never cached
//! - A fetch abandoned by every caller releases its in-flight slot
//!
//! The lock only guards bookkeeping; fetches run outside it.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::debug;

use crate::identity::IdentityTriple;
use crate::reputation::{LookupError, ReputationReport};

type FetchCell = Arc<OnceCell<Result<ReputationReport, LookupError>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Lifetime of an entry, measured from insertion
    pub ttl: Duration,
    /// Maximum number of entries, 0 disables storage (in-flight coalescing still applies)
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug)]
struct CacheEntry {
    report: ReputationReport,
    expires_at: Instant,
    last_used: u64,
    inserted: u64,
}

impl CacheEntry {
    fn order_key(&self) -> (u64, u64) {
        (self.last_used, self.inserted)
    }
}

#[derive(Debug)]
struct CacheState {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    /// (last_used, inserted) -> key; first entry is the eviction candidate
    recency: BTreeMap<(u64, u64), String>,
    in_flight: HashMap<String, FetchCell>,
    clock: u64,
    stats: CacheStats,
}

impl CacheState {
    fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            in_flight: HashMap::new(),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.order_key());
        Some(entry)
    }

    /// Fresh entry for `key`, marked as most recently used
    fn touch(&mut self, key: &str, now: Instant) -> Option<ReputationReport> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at <= now,
            None => return None,
        };
        if expired {
            self.remove(key);
            self.stats.expirations += 1;
            return None;
        }

        let tick = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.order_key());
        entry.last_used = tick;
        self.recency.insert(entry.order_key(), key.to_string());
        Some(entry.report.clone())
    }

    fn insert(&mut self, key: String, report: ReputationReport, now: Instant) {
        if self.config.capacity == 0 {
            return;
        }
        self.remove(&key);
        self.evict_down_to(self.config.capacity - 1);

        let tick = self.tick();
        let entry = CacheEntry {
            report,
            expires_at: now + self.config.ttl,
            last_used: tick,
            inserted: tick,
        };
        self.recency.insert(entry.order_key(), key.clone());
        self.entries.insert(key, entry);
    }

    fn evict_down_to(&mut self, limit: usize) {
        while self.entries.len() > limit {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&victim);
            self.stats.evictions += 1;
        }
    }

    /// Drop the slot for `key` if it is `cell` and `holders` is the only outside reference
    fn release_in_flight(&mut self, key: &str, cell: &FetchCell, holders: usize) -> bool {
        let abandoned = self
            .in_flight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell) && Arc::strong_count(cell) <= holders + 1);
        if abandoned {
            self.in_flight.remove(key);
        }
        abandoned
    }

    /// Remove slots no caller holds any more; returns how many were dropped
    fn sweep_in_flight(&mut self) -> usize {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, cell| Arc::strong_count(cell) > 1);
        before - self.in_flight.len()
    }
}

/// Held by a caller while it waits on an in-flight cell. Dropping it without
/// `finish` (the caller was cancelled) frees the slot when nobody else waits on it.
struct InFlightGuard<'a> {
    state: &'a Mutex<CacheState>,
    key: String,
    cell: FetchCell,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn finish(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await; a contended lock leaves the slot to `purge_expired`
        if let Ok(mut state) = self.state.try_lock()
            && state.release_in_flight(&self.key, &self.cell, 1)
        {
            debug!(key = %self.key, "Released abandoned reputation fetch");
        }
    }
}

/// Shared, concurrency-safe reputation cache
#[derive(Debug)]
pub struct ReputationCache {
    state: Mutex<CacheState>,
}

impl ReputationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: Mutex::new(CacheState::new(config)),
        }
    }

    pub async fn config(&self) -> CacheConfig {
        self.state.lock().await.config.clone()
    }

    /// Apply a new TTL and capacity. The TTL applies to entries stored from now on;
    /// a smaller capacity evicts least recently used entries immediately.
    pub async fn reconfigure(&self, config: CacheConfig) {
        let mut state = self.state.lock().await;
        if state.config == config {
            return;
        }
        state.evict_down_to(config.capacity);
        debug!(
            ttl_secs = config.ttl.as_secs(),
            capacity = config.capacity,
            "Reputation cache reconfigured"
        );
        state.config = config;
    }

    /// Cached report for the triple, or the result of `fetch`.
    ///
    /// Only one `fetch` runs per key at a time; callers arriving while it is in flight
    /// wait for and share its result. If the fetching caller is cancelled, a waiting
    /// caller takes over with its own `fetch`.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        identity: &IdentityTriple,
        fetch: F,
    ) -> Result<ReputationReport, LookupError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ReputationReport, LookupError>>,
    {
        let key = identity.cache_key();

        let cell = {
            let mut state = self.state.lock().await;
            if let Some(report) = state.touch(&key, Instant::now()) {
                state.stats.hits += 1;
                return Ok(report);
            }
            state.stats.misses += 1;
            state
                .in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let guard = InFlightGuard {
            state: &self.state,
            key,
            cell,
            armed: true,
        };
        let result = guard.cell.get_or_init(fetch).await.clone();

        let mut state = self.state.lock().await;
        let owns_slot = state
            .in_flight
            .get(&guard.key)
            .is_some_and(|current| Arc::ptr_eq(current, &guard.cell));
        if owns_slot {
            state.in_flight.remove(&guard.key);
            if let Ok(report) = &result {
                state.insert(guard.key.clone(), report.clone(), Instant::now());
            } else {
                debug!(identity = %identity, "Reputation fetch failed, not caching");
            }
        }
        drop(state);
        guard.finish();

        result
    }

    /// Drop every expired entry and every abandoned in-flight slot; returns how many
    /// entries expired
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        state.stats.expirations += expired.len() as u64;

        let abandoned = state.sweep_in_flight();
        if abandoned > 0 {
            debug!(abandoned, "Swept abandoned reputation fetches");
        }
        expired.len()
    }

    pub async fn invalidate(&self, identity: &IdentityTriple) -> bool {
        let mut state = self.state.lock().await;
        state.remove(&identity.cache_key()).is_some()
    }

    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.recency.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fetches currently registered for coalescing
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn stats(&self) -> CacheStats {
        self.state.lock().await.stats
    }
}

impl Default for ReputationCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
