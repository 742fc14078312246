// DotStore
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Write-back cache manager
//!
//! Key->value store with pluggable eviction, per-entry expiry, hit/miss
//! statistics, dirty tracking for the write-behind path, and the three
//! stampede protections: penetration (cached sentinel for absent keys),
//! breakdown (single-flight fetches), and avalanche (jittered TTLs).
//!
//! Dirty entries hold data that is not yet durable. They are skipped when
//! selecting eviction victims; when nothing but dirty entries remain, the
//! evicted pair is diverted to a pending-sync overflow that the auto-sync
//! service drains together with `dirty_data()`, so dirty data is never
//! silently dropped.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use dotstore_common::{Record, StoreResult};

use crate::cache::eviction::{AccessStamp, select_victim};
use crate::config::CacheConfig;

/// Cached value: a shared record set. Empty sets are valid values (and
/// what the penetration sentinel usually is).
pub type CachedValue = Arc<Vec<Record>>;

/// One cache entry with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub expires_at: Option<Instant>,
    pub dirty: bool,
    pub stamp: AccessStamp,
    pub created_at: Instant,
    /// Monotonic stamp assigned on insert; a replaced value gets a new
    /// one, so a flush can tell whether the value it wrote still stands.
    pub generation: u64,
}

impl CacheEntry {
    fn new(value: CachedValue, expires_at: Option<Instant>, generation: u64) -> Self {
        Self {
            value,
            expires_at,
            dirty: false,
            stamp: AccessStamp::new(),
            created_at: Instant::now(),
            generation,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Cache performance counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    insertions: u64,
    expirations: u64,
}

pub struct CacheManager {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Per-key fetch gates for breakdown protection; a key present here
    /// has a fetch in flight and is exempt from eviction.
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Dirty pairs forced out by eviction pressure, drained by
    /// `dirty_data()`.
    pending_sync: Mutex<Vec<(String, CachedValue, u64)>>,
    generations: AtomicU64,
    counters: Mutex<Counters>,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            pending_sync: Mutex::new(Vec::new()),
            generations: AtomicU64::new(0),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Absolute expiry deadline for an entry, with avalanche jitter so
    /// co-inserted entries never expire in the same instant.
    fn deadline(&self, ttl: Option<Duration>) -> Option<Instant> {
        let ttl = ttl.or(self.config.default_ttl)?;
        let ttl = if self.config.enable_jitter && self.config.ttl_jitter > 0.0 {
            let spread = self.config.ttl_jitter * (2.0 * rand::random::<f64>() - 1.0);
            ttl.mul_f64((1.0 + spread).max(0.0))
        } else {
            ttl
        };
        Some(Instant::now() + ttl)
    }

    pub fn get(&self, key: &str) -> Option<CachedValue> {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                let mut counters = self.counters.lock();
                counters.expirations += 1;
                counters.misses += 1;
                None
            }
            Some(entry) => {
                entry.stamp.touch();
                self.counters.lock().hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.counters.lock().misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &str, value: CachedValue) {
        self.put_with_ttl(key, value, None);
    }

    /// Insert with an explicit TTL (None falls back to the default TTL).
    pub fn put_with_ttl(&self, key: &str, value: CachedValue, ttl: Option<Duration>) {
        let deadline = self.deadline(ttl);
        let mut entries = self.entries.lock();

        if !entries.contains_key(key) && entries.len() >= self.config.max_entries {
            self.evict_one(&mut entries);
        }

        // A dirty entry being overwritten keeps its dirty flag: the newer
        // value still needs to reach disk.
        let dirty = entries.get(key).map(|e| e.dirty).unwrap_or(false);
        let mut entry = CacheEntry::new(value, deadline, self.generations.fetch_add(1, Ordering::Relaxed));
        entry.dirty = dirty;
        entries.insert(key.to_string(), entry);
        self.counters.lock().insertions += 1;
    }

    fn evict_one(&self, entries: &mut HashMap<String, CacheEntry>) {
        let protected: HashSet<String> = self.in_flight.lock().keys().cloned().collect();
        let now = Instant::now();

        // Expired entries go first, they cost nothing.
        if let Some(key) = entries.iter().find(|(k, e)| e.is_expired(now) && !protected.contains(*k)).map(|(k, _)| k.clone()) {
            entries.remove(&key);
            let mut counters = self.counters.lock();
            counters.expirations += 1;
            counters.evictions += 1;
            return;
        }

        let clean_victim = select_victim(
            self.config.policy,
            entries.iter().filter(|(k, e)| !e.dirty && !protected.contains(*k)).map(|(k, e)| (k.clone(), e.stamp)),
        );
        if let Some(key) = clean_victim {
            entries.remove(&key);
            self.counters.lock().evictions += 1;
            return;
        }

        // Only dirty entries left: divert the victim to the pending-sync
        // overflow instead of dropping undurable data.
        let dirty_victim = select_victim(self.config.policy, entries.iter().filter(|(k, _)| !protected.contains(*k)).map(|(k, e)| (k.clone(), e.stamp)));
        if let Some(key) = dirty_victim {
            if let Some(entry) = entries.remove(&key) {
                self.pending_sync.lock().push((key, entry.value, entry.generation));
                self.counters.lock().evictions += 1;
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<CachedValue> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries.get(key).is_some_and(|e| !e.is_expired(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Flag the entry as holding data not yet durable. Returns false when
    /// the key is not cached.
    pub fn mark_dirty(&self, key: &str) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) => {
                entry.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_clean(&self, key: &str) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.dirty = false;
        }
    }

    /// Clear the dirty flag only when the entry still holds the value
    /// stamped with `generation`. A deferred write that replaced the
    /// value after the flush snapshot keeps its flag, so the newer value
    /// goes out on a later cycle instead of being silently lost.
    pub fn mark_clean_if(&self, key: &str, generation: u64) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.dirty = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.entries.lock().get(key).is_some_and(|e| e.dirty)
    }

    /// Every dirty key->value pair with its generation stamp, including
    /// pairs forced out by eviction pressure since the last call.
    pub fn dirty_data(&self) -> Vec<(String, CachedValue, u64)> {
        let mut dirty: Vec<(String, CachedValue, u64)> = self.pending_sync.lock().drain(..).collect();
        let entries = self.entries.lock();
        for (key, entry) in entries.iter() {
            if entry.dirty {
                dirty.push((key.clone(), entry.value.clone(), entry.generation));
            }
        }
        dirty
    }

    /// Put a drained pair back on the pending-sync overflow, used when a
    /// flush for an already-evicted entry fails and must be retried on a
    /// later cycle.
    pub fn requeue_sync(&self, key: String, value: CachedValue, generation: u64) {
        self.pending_sync.lock().push((key, value, generation));
    }

    pub fn dirty_count(&self) -> usize {
        self.pending_sync.lock().len() + self.entries.lock().values().filter(|e| e.dirty).count()
    }

    pub fn stats(&self) -> CacheStats {
        let counters = self.counters.lock();
        CacheStats {
            entries: self.entries.lock().len(),
            max_entries: self.config.max_entries,
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            insertions: counters.insertions,
            expirations: counters.expirations,
        }
    }

    /// Breakdown protection: concurrent callers for the same missing key
    /// share exactly one in-flight fetch and all receive its value.
    pub async fn get_safe<F, Fut>(&self, key: &str, fetch: F) -> StoreResult<CachedValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Vec<Record>>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        self.fill_shared(key, fetch, None).await
    }

    /// Penetration protection: when `fetch` resolves to an empty set, the
    /// `fallback` sentinel is cached under a short TTL so repeated misses
    /// for a nonexistent key stop hitting the backing store.
    pub async fn get_with_penetration_protection<F, Fut>(&self, key: &str, fetch: F, fallback: Vec<Record>) -> StoreResult<CachedValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Vec<Record>>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        self.fill_shared(key, fetch, Some(fallback)).await
    }

    /// Single-flight fill for a key the caller has already looked up and
    /// missed. The miss was counted by that lookup; nothing here touches
    /// the counters again.
    pub async fn fill_shared<F, Fut>(&self, key: &str, fetch: F, empty_fallback: Option<Vec<Record>>) -> StoreResult<CachedValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Vec<Record>>>,
    {
        let gate = self.in_flight.lock().entry(key.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone();
        let guard = gate.lock().await;

        // A racer holding the gate first may have filled the entry.
        if let Some(value) = self.peek(key) {
            drop(guard);
            self.release_gate(key);
            return Ok(value);
        }

        let result = fetch().await;
        let outcome = match result {
            Ok(records) => {
                if records.is_empty() && empty_fallback.is_some() {
                    let value: CachedValue = Arc::new(empty_fallback.unwrap_or_default());
                    self.put_with_ttl(key, value.clone(), Some(self.config.penetration_ttl));
                    Ok(value)
                } else {
                    let value: CachedValue = Arc::new(records);
                    self.put(key, value.clone());
                    Ok(value)
                }
            }
            Err(e) => Err(e),
        };

        drop(guard);
        self.release_gate(key);
        outcome
    }

    /// Lookup that leaves the hit/miss counters untouched.
    fn peek(&self, key: &str) -> Option<CachedValue> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(key);
                self.counters.lock().expirations += 1;
                None
            }
            Some(entry) => {
                entry.stamp.touch();
                Some(entry.value.clone())
            }
            None => None,
        }
    }

    fn release_gate(&self, key: &str) {
        self.in_flight.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::eviction::EvictionPolicy;
    use dotstore_common::record_from_value;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(policy: EvictionPolicy, max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            policy,
            default_ttl: None,
            penetration_ttl: Duration::from_secs(30),
            ttl_jitter: 0.10,
            enable_jitter: false,
        }
    }

    fn value(id: u64) -> CachedValue {
        Arc::new(vec![record_from_value(json!({"id": id})).unwrap()])
    }

    #[test]
    fn test_get_put_and_stats() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 16));

        assert!(cache.get("a").is_none());
        cache.put("a", value(1));
        assert_eq!(cache.get("a").unwrap(), value(1));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_lru_evicts_first_inserted() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 3));
        cache.put("k0", value(0));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("k1", value(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("k2", value(2));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("k3", value(3));

        assert!(!cache.contains("k0"));
        assert!(cache.contains("k1") && cache.contains("k2") && cache.contains("k3"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_evicts_cold_entry() {
        let cache = CacheManager::new(config(EvictionPolicy::Lfu, 2));
        cache.put("hot", value(1));
        cache.put("cold", value(2));
        for _ in 0..10 {
            cache.get("hot");
        }

        cache.put("new", value(3));
        assert!(cache.contains("hot"));
        assert!(!cache.contains("cold"));
        assert!(cache.contains("new"));
    }

    #[test]
    fn test_expiry_is_lazy_miss() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 16));
        cache.put_with_ttl("a", value(1), Some(Duration::from_millis(5)));
        assert!(cache.contains("a"));

        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.get("a").is_none());

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.entries, 0);
    }

    #[test]
    fn test_jitter_spreads_deadlines() {
        let mut cfg = config(EvictionPolicy::Lru, 64);
        cfg.enable_jitter = true;
        let cache = CacheManager::new(cfg);

        let ttl = Some(Duration::from_secs(60));
        let deadlines: Vec<Instant> = (0..16)
            .map(|i| {
                let key = format!("k{i}");
                cache.put_with_ttl(&key, value(i), ttl);
                cache.entries.lock().get(&key).unwrap().expires_at.unwrap()
            })
            .collect();

        let min = deadlines.iter().min().unwrap();
        let max = deadlines.iter().max().unwrap();
        assert!(*max - *min > Duration::from_millis(100), "expected jitter to spread deadlines");
    }

    #[test]
    fn test_dirty_tracking_and_overflow() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 2));
        cache.put("table:a:data", value(1));
        cache.put("table:b:data", value(2));
        assert!(cache.mark_dirty("table:a:data"));
        assert!(cache.mark_dirty("table:b:data"));
        assert!(!cache.mark_dirty("missing"));
        assert_eq!(cache.dirty_count(), 2);

        // Everything is dirty, so overflow must divert, not drop.
        cache.put("table:c:data", value(3));
        assert_eq!(cache.dirty_count(), 2);
        let dirty = cache.dirty_data();
        assert_eq!(dirty.len(), 2);

        // Draining moved the overflow pair out; in-cache dirty entries remain.
        assert_eq!(cache.dirty_count(), 1);
        cache.mark_clean("table:b:data");
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn test_eviction_prefers_clean_over_dirty() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 2));
        cache.put("dirty", value(1));
        std::thread::sleep(Duration::from_millis(2));
        cache.put("clean", value(2));
        cache.mark_dirty("dirty");

        // LRU alone would pick "dirty" (older), but dirty entries are
        // protected while a clean victim exists.
        cache.put("new", value(3));
        assert!(cache.contains("dirty"));
        assert!(!cache.contains("clean"));
    }

    #[test]
    fn test_overwrite_keeps_dirty_flag() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 16));
        cache.put("a", value(1));
        cache.mark_dirty("a");
        cache.put("a", value(2));
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(cache.dirty_data()[0].1, value(2));
    }

    #[test]
    fn test_mark_clean_if_honors_generation() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 16));
        cache.put("a", value(1));
        cache.mark_dirty("a");
        let (_, _, generation) = cache.dirty_data().pop().unwrap();

        // Same value still cached: the stamp matches and the flag clears.
        assert!(cache.mark_clean_if("a", generation));
        assert_eq!(cache.dirty_count(), 0);

        // A replacement between snapshot and clean keeps its flag.
        cache.mark_dirty("a");
        let (_, _, generation) = cache.dirty_data().pop().unwrap();
        cache.put("a", value(2));
        assert!(!cache.mark_clean_if("a", generation));
        assert_eq!(cache.dirty_count(), 1);
    }

    #[tokio::test]
    async fn test_single_flight_miss_counted_once() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 16));
        cache.get_safe("k", || async { Ok(vec![record_from_value(json!({"id": 1})).unwrap()]) }).await.unwrap();

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);

        cache.get("k").unwrap();
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_breakdown_single_flight() {
        let cache = Arc::new(CacheManager::new(config(EvictionPolicy::Lru, 16)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_safe("shared", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(vec![record_from_value(json!({"id": 7})).unwrap()])
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_penetration_sentinel() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 16));
        let calls = AtomicUsize::new(0);

        let first = cache
            .get_with_penetration_protection("absent", || async { calls.fetch_add(1, Ordering::SeqCst); Ok(vec![]) }, vec![])
            .await
            .unwrap();
        assert!(first.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The sentinel answers the second lookup; the store is not hit again.
        let second = cache
            .get_with_penetration_protection("absent", || async { calls.fetch_add(1, Ordering::SeqCst); Ok(vec![]) }, vec![])
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_safe_propagates_fetch_error() {
        let cache = CacheManager::new(config(EvictionPolicy::Lru, 16));
        let result = cache.get_safe("bad", || async { Err(dotstore_common::StoreError::ReadFailed("boom".into())) }).await;
        assert!(result.is_err());
        // The failed fetch cached nothing and released the gate.
        assert!(!cache.contains("bad"));
        assert!(cache.in_flight.lock().is_empty());
    }
}
