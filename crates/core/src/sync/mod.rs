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

//! Auto-sync service
//!
//! Background flush for the write-behind path. A cycle fires when the
//! interval has elapsed since the last one or when enough cache entries
//! are dirty, whichever comes first. Each cycle snapshots the dirty data,
//! groups it by table, pushes it through the flush sink with bounded
//! retries, and marks clean only what was actually written. `stop()`
//! cancels the timer and lets an in-flight cycle finish before returning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use dotstore_common::{Record, StoreEvent, StoreResult, epoch_millis};

use crate::cache::manager::{CacheManager, CachedValue};
use crate::cache::{CacheController, keys};
use crate::config::SyncConfig;

/// Where flushed table data lands: the store adapter, which routes it
/// through the table's persistence handler under the per-table write lock.
#[async_trait]
pub trait FlushSink: Send + Sync {
    async fn flush_table(&self, table: &str, records: &[Record]) -> StoreResult<()>;
}

/// Statistics mutated only by the auto-sync service
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub sync_count: u64,
    pub total_items_synced: u64,
    /// Epoch millis of the most recent completed cycle
    pub last_sync_time: Option<u64>,
    /// Rolling average duration of a cycle
    pub avg_sync_duration: Duration,
}

pub struct AutoSyncService {
    config: SyncConfig,
    cache: Arc<CacheManager>,
    sink: Arc<dyn FlushSink>,
    controller: Arc<CacheController>,
    stats: Arc<RwLock<SyncStats>>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl AutoSyncService {
    pub fn new(config: SyncConfig, cache: Arc<CacheManager>, sink: Arc<dyn FlushSink>, controller: Arc<CacheController>) -> Self {
        Self {
            config,
            cache,
            sink,
            controller,
            stats: Arc::new(RwLock::new(SyncStats::default())),
            shutdown: None,
            handle: None,
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the polling loop. Starting twice is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        let config = self.config.clone();
        let cache = self.cache.clone();
        let sink = self.sink.clone();
        let controller = self.controller.clone();
        let stats = self.stats.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.poll_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_sync = Instant::now();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dirty = cache.dirty_count();
                        if dirty == 0 {
                            continue;
                        }
                        if last_sync.elapsed() >= config.interval || dirty >= config.min_dirty_items {
                            Self::run_cycle(&config, &cache, &sink, &controller, &stats).await;
                            last_sync = Instant::now();
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.shutdown = Some(tx);
        self.handle = Some(handle);
    }

    /// Signal shutdown, let any in-flight cycle finish, and join the task.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Run one flush cycle immediately, regardless of triggers. Used by
    /// `close()` to drain remaining dirty entries.
    pub async fn flush_now(&self) -> usize {
        Self::run_cycle(&self.config, &self.cache, &self.sink, &self.controller, &self.stats).await
    }

    async fn run_cycle(config: &SyncConfig, cache: &CacheManager, sink: &Arc<dyn FlushSink>, controller: &CacheController, stats: &RwLock<SyncStats>) -> usize {
        let started = Instant::now();
        let dirty = cache.dirty_data();
        if dirty.is_empty() {
            return 0;
        }

        let mut groups: HashMap<String, Vec<(String, CachedValue, u64)>> = HashMap::new();
        for (key, value, generation) in dirty {
            // Only full-data keys carry a table's record set; anything else
            // marked dirty cannot be routed to a handler.
            if !keys::is_data_key(&key) {
                warn!(key = %key, "dirty entry with unroutable key, dropping");
                continue;
            }
            let Some(table) = keys::parse_table(&key) else { continue };
            groups.entry(table.to_string()).or_default().push((key, value, generation));
        }

        let mut synced = 0usize;
        for (table, pairs) in groups {
            for (key, value, generation) in pairs {
                if Self::flush_with_retry(config, sink, &table, &value).await {
                    // Clean only the value that was actually written. A
                    // deferred write that replaced it while the flush was
                    // in flight stays dirty for the next cycle.
                    cache.mark_clean_if(&key, generation);
                    synced += 1;
                } else if !cache.contains(&key) {
                    // Evicted-while-dirty pairs exist nowhere else; keep
                    // them queued for the next cycle.
                    cache.requeue_sync(key, value, generation);
                }
            }
        }

        let duration = started.elapsed();
        {
            let mut stats = stats.write();
            stats.sync_count += 1;
            stats.total_items_synced += synced as u64;
            stats.last_sync_time = Some(epoch_millis());
            let n = stats.sync_count;
            stats.avg_sync_duration = (stats.avg_sync_duration * (n - 1) as u32 + duration) / n as u32;
        }

        debug!(items = synced, duration_ms = duration.as_millis() as u64, "sync cycle completed");
        controller.publish(StoreEvent::SyncCompleted {
            items_synced: synced,
            duration_ms: duration.as_millis() as u64,
        });
        synced
    }

    async fn flush_with_retry(config: &SyncConfig, sink: &Arc<dyn FlushSink>, table: &str, records: &[Record]) -> bool {
        let attempts = config.retry_attempts + 1;
        for attempt in 1..=attempts {
            match sink.flush_table(table, records).await {
                Ok(()) => return true,
                Err(e) if e.is_fatal() => {
                    warn!(table, error = %e, "fatal error during sync flush, giving up");
                    return false;
                }
                Err(e) => {
                    warn!(table, attempt, error = %e, "sync flush batch failed");
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use dotstore_common::record_from_value;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct MockSink {
        flushed: Mutex<Vec<(String, usize)>>,
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl FlushSink for MockSink {
        async fn flush_table(&self, table: &str, records: &[Record]) -> StoreResult<()> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(dotstore_common::StoreError::WriteFailed("injected".into()));
            }
            self.flushed.lock().push((table.to_string(), records.len()));
            Ok(())
        }
    }

    /// Sink that parks inside `flush_table` until released, holding a
    /// flush in flight while the cache changes underneath it.
    struct GatedSink {
        entered: tokio::sync::Semaphore,
        release: tokio::sync::Semaphore,
        flushed: Mutex<Vec<Vec<u64>>>,
    }

    impl GatedSink {
        fn new() -> Self {
            Self {
                entered: tokio::sync::Semaphore::new(0),
                release: tokio::sync::Semaphore::new(0),
                flushed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FlushSink for GatedSink {
        async fn flush_table(&self, _table: &str, records: &[Record]) -> StoreResult<()> {
            self.entered.add_permits(1);
            self.release.acquire().await.expect("release gate closed").forget();
            let ids = records.iter().filter_map(|r| r.get("id").and_then(|v| v.as_u64())).collect();
            self.flushed.lock().push(ids);
            Ok(())
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            interval: Duration::from_millis(50),
            min_dirty_items: 100,
            batch_size: 100,
            poll_period: Duration::from_millis(5),
            retry_attempts: 2,
        }
    }

    fn setup(config: SyncConfig) -> (Arc<CacheManager>, Arc<MockSink>, Arc<CacheController>, AutoSyncService) {
        let cache = Arc::new(CacheManager::new(CacheConfig::default()));
        let sink = Arc::new(MockSink::default());
        let controller = Arc::new(CacheController::new(cache.clone()));
        let service = AutoSyncService::new(config, cache.clone(), sink.clone(), controller.clone());
        (cache, sink, controller, service)
    }

    fn dirty_entry(cache: &CacheManager, table: &str, ids: &[u64]) {
        let records: Vec<Record> = ids.iter().map(|id| record_from_value(json!({"id": id})).unwrap()).collect();
        let key = keys::table_data_key(table);
        cache.put(&key, Arc::new(records));
        cache.mark_dirty(&key);
    }

    #[tokio::test]
    async fn test_interval_trigger_converges() {
        let (cache, sink, _, mut service) = setup(fast_config());
        dirty_entry(&cache, "users", &[1, 2]);
        dirty_entry(&cache, "orders", &[3]);
        assert_eq!(cache.dirty_count(), 2);

        service.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        service.stop().await;

        assert_eq!(cache.dirty_count(), 0);
        let stats = service.stats();
        assert!(stats.sync_count >= 1);
        assert_eq!(stats.total_items_synced, 2);
        assert!(stats.last_sync_time.is_some());

        let mut flushed: Vec<String> = sink.flushed.lock().iter().map(|(t, _)| t.clone()).collect();
        flushed.sort();
        assert_eq!(flushed, vec!["orders", "users"]);
    }

    #[tokio::test]
    async fn test_dirty_threshold_trigger() {
        let mut config = fast_config();
        config.interval = Duration::from_secs(3600); // never by time
        config.min_dirty_items = 3;
        let (cache, _, _, mut service) = setup(config);

        service.start();
        dirty_entry(&cache, "a", &[1]);
        dirty_entry(&cache, "b", &[2]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Below the threshold: nothing flushed yet.
        assert_eq!(cache.dirty_count(), 2);

        dirty_entry(&cache, "c", &[3]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop().await;

        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(service.stats().total_items_synced, 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let (cache, sink, _, mut service) = setup(fast_config());
        sink.failures_remaining.store(2, Ordering::SeqCst);
        dirty_entry(&cache, "users", &[1]);

        service.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        service.stop().await;

        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(sink.flushed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_entries_stay_dirty() {
        let mut config = fast_config();
        config.retry_attempts = 0;
        let (cache, sink, _, service) = setup(config);
        sink.failures_remaining.store(10, Ordering::SeqCst);
        dirty_entry(&cache, "users", &[1]);

        let synced = service.flush_now().await;
        assert_eq!(synced, 0);
        assert_eq!(cache.dirty_count(), 1);
        assert_eq!(service.stats().total_items_synced, 0);
        assert_eq!(service.stats().sync_count, 1);
    }

    #[tokio::test]
    async fn test_value_replaced_mid_flush_stays_dirty() {
        let cache = Arc::new(CacheManager::new(CacheConfig::default()));
        let sink = Arc::new(GatedSink::new());
        let controller = Arc::new(CacheController::new(cache.clone()));
        let service = Arc::new(AutoSyncService::new(fast_config(), cache.clone(), sink.clone(), controller));

        dirty_entry(&cache, "users", &[1]);
        let flush = tokio::spawn({
            let service = service.clone();
            async move { service.flush_now().await }
        });

        // With the flush parked inside the sink, replace the entry.
        sink.entered.acquire().await.unwrap().forget();
        dirty_entry(&cache, "users", &[2]);
        sink.release.add_permits(1);
        flush.await.unwrap();

        // The replacement was never written and must still be dirty.
        assert_eq!(cache.dirty_count(), 1);

        sink.release.add_permits(1);
        service.flush_now().await;
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(*sink.flushed.lock(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_completion_event_published() {
        let (cache, _, controller, service) = setup(fast_config());
        let mut rx = controller.subscribe();
        dirty_entry(&cache, "users", &[1, 2, 3]);

        service.flush_now().await;

        match rx.recv().await.unwrap() {
            StoreEvent::SyncCompleted { items_synced, .. } => assert_eq!(items_synced, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_joins() {
        let (_, _, _, mut service) = setup(fast_config());
        service.start();
        assert!(service.is_running());
        service.stop().await;
        assert!(!service.is_running());
        service.stop().await;
    }
}
