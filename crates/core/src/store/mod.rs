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

//! Storage adapter facade
//!
//! [`DocumentStore`] composes the catalog, persistence handlers, cache,
//! auto-sync service, and transaction service into the public API:
//! create/drop/read/write/update/delete/count plus transactions,
//! verification, and migration. Writes to the same table are serialized
//! through a per-table async lock shared with the background flush, so a
//! foreground write and an auto-sync flush cannot interleave.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, broadcast};
use tracing::{debug, info};

use dotstore_common::{Record, StoreError, StoreEvent, StoreResult, WriteKind};

use crate::cache::manager::CacheManager;
use crate::cache::{CacheController, CacheStats, keys};
use crate::catalog::{Catalog, DriftReport, StorageMode, TableMeta};
use crate::config::StoreConfig;
use crate::crypto::{CryptoProvider, StdCrypto};
use crate::fs::{FileAccess, StdFileAccess};
use crate::query::{Filter, SortSpec, matches, sort_records};
use crate::storage::{ChunkedFileHandler, PersistenceHandler, ReadOutcome, SingleFileHandler, select_mode};
use crate::sync::{AutoSyncService, FlushSink, SyncStats};
use crate::transaction::TransactionService;

/// A verified read with its data-loss accounting surfaced.
pub type ReadReport = ReadOutcome;

/// Whether a write replaces or extends the table's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    #[default]
    Replace,
    Append,
}

/// When the write must be durable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Through the persistence handler before the call returns
    #[default]
    Immediate,
    /// Into the cache now, to disk on the next auto-sync cycle
    Deferred,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub mode: WriteMode,
    pub durability: Durability,
}

impl WriteOptions {
    pub fn append() -> Self {
        Self {
            mode: WriteMode::Append,
            ..Self::default()
        }
    }

    pub fn deferred(mut self) -> Self {
        self.durability = Durability::Deferred;
        self
    }
}

/// Combined cache and sync statistics snapshot
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub cache: CacheStats,
    pub sync: SyncStats,
}

/// Everything shared between the facade and the background flush.
pub(crate) struct StoreInner {
    config: StoreConfig,
    fs: Arc<dyn FileAccess>,
    crypto: Arc<dyn CryptoProvider>,
    catalog: Catalog,
    cache: Arc<CacheManager>,
    controller: Arc<CacheController>,
    tx: TransactionService,
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl StoreInner {
    fn table_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(name.to_string()).or_default().clone()
    }

    fn handler(&self, meta: &TableMeta) -> Box<dyn PersistenceHandler> {
        match meta.mode {
            StorageMode::Single => Box::new(SingleFileHandler::new(meta.path.clone(), self.fs.clone(), self.crypto.clone())),
            StorageMode::Chunked => Box::new(
                ChunkedFileHandler::new(meta.path.clone(), &meta.name, self.config.chunk.clone(), self.fs.clone(), self.crypto.clone()).with_chunk_hint(meta.chunk_count),
            ),
        }
    }

    fn meta(&self, name: &str) -> StoreResult<TableMeta> {
        self.catalog.get(name).ok_or_else(|| StoreError::TableNotFound(name.to_string()))
    }

    fn table_path(&self, name: &str, mode: StorageMode) -> std::path::PathBuf {
        match mode {
            StorageMode::Single => self.config.root.join(format!("{name}.db")),
            StorageMode::Chunked => self.config.root.join(name),
        }
    }

    /// The record set a reader would currently observe: a pending
    /// deferred write in the cache wins over disk.
    async fn current_records(&self, meta: &TableMeta) -> StoreResult<Vec<Record>> {
        if let Some(value) = self.cache.get(&keys::table_data_key(&meta.name)) {
            return Ok((*value).clone());
        }
        Ok(self.handler(meta).read_all().await?.records)
    }

    /// Capture the pre-transaction state of the table on first touch.
    async fn snapshot_if_needed(&self, meta: &TableMeta) -> StoreResult<()> {
        if self.tx.needs_snapshot(&meta.name) {
            let current = self.current_records(meta).await?;
            self.tx.record_snapshot(&meta.name, current);
        }
        Ok(())
    }

    /// Write the table's full record set durably and bring the catalog in
    /// line. Caller holds the table lock.
    async fn persist_full(&self, name: &str, meta: &TableMeta, records: &[Record]) -> StoreResult<()> {
        let handler = self.handler(meta);
        let batch = self.config.sync.batch_size.max(1);

        if records.is_empty() {
            handler.rewrite(&[]).await?;
        } else {
            let mut first = true;
            for chunk in records.chunks(batch) {
                if first {
                    handler.rewrite(chunk).await?;
                    first = false;
                } else {
                    handler.append(chunk).await?;
                }
            }
        }

        let chunks = handler.chunk_count().await?;
        self.catalog
            .update(name, |m| {
                m.record_count = records.len();
                m.chunk_count = chunks;
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlushSink for StoreInner {
    async fn flush_table(&self, table: &str, records: &[Record]) -> StoreResult<()> {
        let lock = self.table_lock(table);
        let _guard = lock.lock().await;

        // The table may have been dropped while its entry sat dirty.
        let Some(meta) = self.catalog.get(table) else {
            debug!(table, "skipping flush for dropped table");
            return Ok(());
        };
        self.persist_full(table, &meta, records).await
    }
}

/// The embedded document store
pub struct DocumentStore {
    inner: Arc<StoreInner>,
    sync: AsyncMutex<AutoSyncService>,
}

fn validate_name(name: &str) -> StoreResult<()> {
    let ok = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StoreError::Unknown(format!("invalid table name: '{name}'")))
    }
}

impl DocumentStore {
    /// Open a store on the real filesystem with the default crypto
    /// provider.
    pub async fn open(config: StoreConfig) -> StoreResult<Self> {
        let fs: Arc<dyn FileAccess> = Arc::new(StdFileAccess::new(config.fs_timeout));
        Self::open_with(config, fs, Arc::new(StdCrypto::new())).await
    }

    /// Open with explicit file access and crypto collaborators (tests use
    /// the in-memory file access here).
    pub async fn open_with(config: StoreConfig, fs: Arc<dyn FileAccess>, crypto: Arc<dyn CryptoProvider>) -> StoreResult<Self> {
        fs.create_dir_all(&config.root).await?;
        let catalog = Catalog::open(&config.root, fs.clone(), crypto.clone()).await?;
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let controller = Arc::new(CacheController::new(cache.clone()));

        let inner = Arc::new(StoreInner {
            config: config.clone(),
            fs,
            crypto,
            catalog,
            cache: cache.clone(),
            controller: controller.clone(),
            tx: TransactionService::new(),
            locks: parking_lot::Mutex::new(HashMap::new()),
        });

        let mut sync = AutoSyncService::new(config.sync.clone(), cache, inner.clone(), controller);
        sync.start();

        info!(root = %config.root.display(), "store opened");
        Ok(Self {
            inner,
            sync: AsyncMutex::new(sync),
        })
    }

    /// Create an empty table in single-file mode.
    pub async fn create_table(&self, name: &str) -> StoreResult<()> {
        self.create_table_with(name, &[]).await
    }

    /// Create a table, choosing its storage mode from the initial
    /// payload, and write the payload if any.
    pub async fn create_table_with(&self, name: &str, records: &[Record]) -> StoreResult<()> {
        validate_name(name)?;
        let mode = select_mode(records, self.inner.config.single_file_threshold, self.inner.config.chunk.record_overhead);
        let meta = TableMeta::new(name, mode, self.inner.table_path(name, mode));
        self.inner.catalog.create(meta).await?;
        self.inner.controller.publish(StoreEvent::TableCreated { table: name.to_string() });

        if !records.is_empty() {
            self.write(name, records, WriteOptions::default()).await?;
        }
        Ok(())
    }

    /// Drop a table: its files, catalog entry, and cached results.
    pub async fn drop_table(&self, name: &str) -> StoreResult<()> {
        let lock = self.inner.table_lock(name);
        let _guard = lock.lock().await;

        let meta = self.inner.meta(name)?;
        self.inner.handler(&meta).clear().await?;
        self.inner.catalog.remove(name).await?;
        self.inner.controller.purge_table(name);
        self.inner.controller.publish(StoreEvent::TableDropped { table: name.to_string() });
        Ok(())
    }

    /// Write records. Mode picks replace/append; durability picks
    /// write-through or write-behind.
    pub async fn write(&self, name: &str, records: &[Record], options: WriteOptions) -> StoreResult<()> {
        let lock = self.inner.table_lock(name);
        let _guard = lock.lock().await;

        let inner = &self.inner;
        let meta = inner.meta(name)?;
        inner.snapshot_if_needed(&meta).await?;

        match options.durability {
            Durability::Immediate => {
                // An unflushed deferred write lives only in the cache; going
                // straight to the handler would orphan those records when the
                // entry is invalidated below. Merge through the cached view
                // so both land on disk together.
                if inner.cache.is_dirty(&keys::table_data_key(name)) {
                    let merged = match options.mode {
                        WriteMode::Replace => records.to_vec(),
                        WriteMode::Append => {
                            let mut current = inner.current_records(&meta).await?;
                            current.extend_from_slice(records);
                            current
                        }
                    };
                    inner.persist_full(name, &meta, &merged).await?;
                } else {
                    let handler = inner.handler(&meta);
                    match options.mode {
                        WriteMode::Replace => handler.rewrite(records).await?,
                        WriteMode::Append => handler.append(records).await?,
                    }
                    let chunks = handler.chunk_count().await?;
                    inner
                        .catalog
                        .update(name, |m| {
                            match options.mode {
                                WriteMode::Replace => m.record_count = records.len(),
                                WriteMode::Append => m.record_count += records.len(),
                            }
                            m.chunk_count = chunks;
                        })
                        .await?;
                }
                inner.controller.invalidate_table(name);
            }
            Durability::Deferred => {
                let merged = match options.mode {
                    WriteMode::Replace => records.to_vec(),
                    WriteMode::Append => {
                        let mut current = inner.current_records(&meta).await?;
                        current.extend_from_slice(records);
                        current
                    }
                };
                let key = keys::table_data_key(name);
                inner.cache.put(&key, Arc::new(merged));
                inner.cache.mark_dirty(&key);
                inner.controller.register(name, &key);
                inner.controller.invalidate_queries(name);
            }
        }

        let kind = match options.mode {
            WriteMode::Replace => WriteKind::Replace,
            WriteMode::Append => WriteKind::Append,
        };
        inner.controller.publish(StoreEvent::Write {
            table: name.to_string(),
            kind,
            records_affected: records.len(),
        });
        Ok(())
    }

    /// Read the table's full record set, cache-first with a single-flight
    /// fetch on miss.
    pub async fn read(&self, name: &str) -> StoreResult<Vec<Record>> {
        let inner = &self.inner;
        let meta = inner.meta(name)?;
        let key = keys::table_data_key(name);

        if let Some(value) = inner.cache.get(&key) {
            inner.controller.register(name, &key);
            return Ok((*value).clone());
        }

        // Fill under the table lock: a concurrent write's invalidation
        // must not land between the disk read and the cache insert, or
        // the pre-write record set would stay cached until it expires.
        let lock = inner.table_lock(name);
        let _guard = lock.lock().await;
        let value = inner.cache.fill_shared(&key, || async { Ok(inner.handler(&meta).read_all().await?.records) }, None).await?;
        inner.controller.register(name, &key);
        Ok((*value).clone())
    }

    /// Read with the count of chunks skipped for failed verification
    /// surfaced, bypassing the cache.
    pub async fn read_report(&self, name: &str) -> StoreResult<ReadReport> {
        let meta = self.inner.meta(name)?;
        self.inner.handler(&meta).read_all().await
    }

    /// Filtered (and optionally sorted) read. Serializable filters cache
    /// their result sets under derived query keys with penetration
    /// protection; custom predicates are evaluated fresh every call.
    pub async fn find(&self, name: &str, filter: Option<&Filter>, sort: Option<&SortSpec>) -> StoreResult<Vec<Record>> {
        let cacheable = filter.map(Filter::is_cacheable).unwrap_or(true);
        if !cacheable {
            let mut records = self.read(name).await?;
            if let Some(filter) = filter {
                records.retain(|r| matches(r, filter));
            }
            if let Some(spec) = sort {
                sort_records(&mut records, spec);
            }
            return Ok(records);
        }

        let descriptor = format!(
            "filter={};sort={}",
            filter.map(Filter::serialized).transpose()?.unwrap_or_default(),
            sort.map(serde_json::to_string).transpose().map_err(|e| StoreError::Unknown(e.to_string()))?.unwrap_or_default(),
        );
        let key = keys::query_key(name, &descriptor, self.inner.crypto.as_ref());

        let value = self
            .inner
            .cache
            .get_with_penetration_protection(
                &key,
                || async {
                    let mut records = self.read(name).await?;
                    if let Some(filter) = filter {
                        records.retain(|r| matches(r, filter));
                    }
                    if let Some(spec) = sort {
                        sort_records(&mut records, spec);
                    }
                    Ok(records)
                },
                Vec::new(),
            )
            .await?;
        self.inner.controller.register(name, &key);
        Ok((*value).clone())
    }

    /// First record matching the filter, if any.
    pub async fn find_one(&self, name: &str, filter: &Filter) -> StoreResult<Option<Record>> {
        Ok(self.find(name, Some(filter), None).await?.into_iter().next())
    }

    /// Merge the patch's fields into every matching record. Returns the
    /// number of records affected.
    pub async fn update(&self, name: &str, patch: &Record, filter: Option<&Filter>) -> StoreResult<usize> {
        let lock = self.inner.table_lock(name);
        let _guard = lock.lock().await;

        let inner = &self.inner;
        let meta = inner.meta(name)?;
        inner.snapshot_if_needed(&meta).await?;

        let mut records = inner.current_records(&meta).await?;
        let mut affected = 0;
        for record in records.iter_mut() {
            if filter.map(|f| matches(record, f)).unwrap_or(true) {
                for (field, value) in patch {
                    record.insert(field.clone(), value.clone());
                }
                affected += 1;
            }
        }

        if affected > 0 {
            inner.persist_full(name, &meta, &records).await?;
            inner.controller.invalidate_table(name);
            inner.controller.publish(StoreEvent::Write {
                table: name.to_string(),
                kind: WriteKind::Update,
                records_affected: affected,
            });
        }
        Ok(affected)
    }

    /// Remove every matching record (all records when no filter).
    /// Returns the number removed.
    pub async fn delete(&self, name: &str, filter: Option<&Filter>) -> StoreResult<usize> {
        let lock = self.inner.table_lock(name);
        let _guard = lock.lock().await;

        let inner = &self.inner;
        let meta = inner.meta(name)?;
        inner.snapshot_if_needed(&meta).await?;

        let mut records = inner.current_records(&meta).await?;
        let before = records.len();
        match filter {
            Some(filter) => records.retain(|r| !matches(r, filter)),
            None => records.clear(),
        }
        let removed = before - records.len();

        if removed > 0 {
            inner.persist_full(name, &meta, &records).await?;
            inner.controller.invalidate_table(name);
            inner.controller.publish(StoreEvent::Write {
                table: name.to_string(),
                kind: WriteKind::Delete,
                records_affected: removed,
            });
        }
        Ok(removed)
    }

    /// Record count as the catalog knows it. Deferred writes land here
    /// once their flush completes.
    pub async fn count(&self, name: &str) -> StoreResult<usize> {
        Ok(self.inner.meta(name)?.record_count)
    }

    pub fn begin_transaction(&self) -> StoreResult<()> {
        self.inner.tx.begin()
    }

    /// Discard the transaction's snapshots; its operations already
    /// happened.
    pub fn commit(&self) -> StoreResult<()> {
        let touched = self.inner.tx.commit()?;
        debug!(tables = touched.len(), "transaction committed");
        Ok(())
    }

    /// Restore every table the transaction touched to its
    /// pre-transaction record set by full overwrite.
    pub async fn rollback(&self) -> StoreResult<()> {
        let snapshots = self.inner.tx.take_for_rollback()?;
        let mut tables = Vec::with_capacity(snapshots.len());

        for (table, records) in snapshots {
            let lock = self.inner.table_lock(&table);
            let _guard = lock.lock().await;

            let Some(meta) = self.inner.catalog.get(&table) else {
                debug!(table = %table, "skipping rollback for dropped table");
                continue;
            };
            self.inner.persist_full(&table, &meta, &records).await?;
            self.inner.controller.invalidate_table(&table);
            tables.push(table);
        }

        self.inner.controller.publish(StoreEvent::RolledBack { tables });
        Ok(())
    }

    /// Compare the catalog's record count against a fresh full scan.
    pub async fn verify(&self, name: &str) -> StoreResult<DriftReport> {
        let meta = self.inner.meta(name)?;
        let actual = self.inner.handler(&meta).read_all().await?.records.len();
        self.inner.catalog.verify(name, actual)
    }

    pub async fn verify_all(&self) -> StoreResult<Vec<DriftReport>> {
        let mut reports = Vec::new();
        for meta in self.inner.catalog.list() {
            reports.push(self.verify(&meta.name).await?);
        }
        Ok(reports)
    }

    /// Explicitly re-select the storage mode: rewrite the table's records
    /// through the target handler and update the catalog.
    pub async fn migrate(&self, name: &str, mode: StorageMode) -> StoreResult<()> {
        let lock = self.inner.table_lock(name);
        let _guard = lock.lock().await;

        let inner = &self.inner;
        let meta = inner.meta(name)?;
        if meta.mode == mode {
            return Ok(());
        }

        let records = inner.handler(&meta).read_all().await?.records;
        inner.handler(&meta).clear().await?;

        let path = inner.table_path(name, mode);
        let mut target_meta = meta.clone();
        target_meta.mode = mode;
        target_meta.path = path.clone();
        let target = inner.handler(&target_meta);
        target.rewrite(&records).await?;
        let chunks = target.chunk_count().await?;

        inner
            .catalog
            .update(name, |m| {
                m.mode = mode;
                m.path = path;
                m.record_count = records.len();
                m.chunk_count = chunks;
            })
            .await?;
        inner.controller.invalidate_table(name);
        info!(table = name, ?mode, "table migrated");
        Ok(())
    }

    pub fn tables(&self) -> Vec<TableMeta> {
        self.inner.catalog.list()
    }

    pub async fn stats(&self) -> StoreStats {
        StoreStats {
            cache: self.inner.cache.stats(),
            sync: self.sync.lock().await.stats(),
        }
    }

    pub fn events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.controller.subscribe()
    }

    /// Stop the auto-sync service and flush any remaining dirty entries.
    pub async fn close(&self) -> StoreResult<()> {
        let mut sync = self.sync.lock().await;
        sync.stop().await;
        sync.flush_now().await;
        info!("store closed");
        Ok(())
    }
}
