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

//! Chunked persistence handler
//!
//! A table is a directory of zero-padded chunk files plus a local
//! `meta.db`. Chunks are append-only: incoming records are packed greedily
//! into new chunks bounded by a byte budget, each written atomically with
//! a bounded retry for transient failures. Reads verify every chunk
//! independently and skip the ones that fail verification, so corruption
//! is contained to the failing chunk.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::warn;

use dotstore_common::{Record, StoreError, StoreResult, epoch_millis};

use crate::catalog::{StorageMode, TABLE_META_FILE, TableMeta};
use crate::config::ChunkConfig;
use crate::crypto::CryptoProvider;
use crate::fs::FileAccess;
use crate::storage::envelope;
use crate::storage::strategy::estimated_record_size;
use crate::storage::{PersistenceHandler, ReadOutcome};

enum ChunkRead {
    Records(Vec<Record>),
    Skipped,
}

pub struct ChunkedFileHandler {
    dir: PathBuf,
    table: String,
    config: ChunkConfig,
    fs: Arc<dyn FileAccess>,
    crypto: Arc<dyn CryptoProvider>,
    /// Chunk count as the catalog knows it; local meta and a bounded
    /// directory scan are the fallbacks when absent.
    chunk_hint: Option<u32>,
}

impl ChunkedFileHandler {
    pub fn new(dir: PathBuf, table: &str, config: ChunkConfig, fs: Arc<dyn FileAccess>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            dir,
            table: table.to_string(),
            config,
            fs,
            crypto,
            chunk_hint: None,
        }
    }

    /// Prefer the catalog's chunk count over local metadata when reading.
    pub fn with_chunk_hint(mut self, chunks: u32) -> Self {
        self.chunk_hint = Some(chunks);
        self
    }

    fn chunk_path(&self, idx: u32) -> PathBuf {
        self.dir.join(format!("{idx:06}.db"))
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(TABLE_META_FILE)
    }

    async fn load_meta(&self) -> StoreResult<Option<TableMeta>> {
        match self.fs.read(&self.meta_path()).await? {
            None => Ok(None),
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(meta) => Ok(Some(meta)),
                Err(e) => {
                    warn!(table = %self.table, error = %e, "unreadable local meta, falling back to directory scan");
                    Ok(None)
                }
            },
        }
    }

    async fn store_meta(&self, meta: &TableMeta) -> StoreResult<()> {
        let bytes = serde_json::to_vec(meta).map_err(|e| StoreError::WriteFailed(format!("meta serialization failed: {e}")))?;
        self.fs.write_atomic(&self.meta_path(), &bytes).await
    }

    /// Chunk indices present on disk, bounded by the configured scan limit.
    async fn scan_indices(&self) -> StoreResult<Vec<u32>> {
        let mut indices: Vec<u32> = self
            .fs
            .list(&self.dir)
            .await?
            .iter()
            .filter_map(|name| name.strip_suffix(".db")?.parse::<u32>().ok())
            .filter(|idx| *idx < self.config.scan_limit)
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    async fn chunk_indices(&self) -> StoreResult<Vec<u32>> {
        let local = self.load_meta().await?.map(|m| m.chunk_count);
        let count = match (self.chunk_hint, local) {
            // A stale catalog hint must not hide chunks the local meta
            // knows about.
            (Some(hint), Some(meta)) => hint.max(meta),
            (Some(hint), None) => hint,
            (None, Some(meta)) => meta,
            (None, None) => return self.scan_indices().await,
        };
        Ok((0..count).collect())
    }

    /// Local metadata, reconstructed from the chunk files when the meta
    /// file is absent or unreadable.
    async fn current_meta(&self) -> StoreResult<TableMeta> {
        if let Some(meta) = self.load_meta().await? {
            return Ok(meta);
        }

        let indices = self.scan_indices().await?;
        let mut meta = TableMeta::new(&self.table, StorageMode::Chunked, self.dir.clone());
        if let Some(max) = indices.last() {
            meta.chunk_count = max + 1;
            meta.record_count = self.read_indices(indices.clone()).await?.records.len();
        }
        Ok(meta)
    }

    /// Pack records greedily into chunks bounded by the byte budget. A
    /// record whose estimate alone exceeds the budget becomes its own
    /// chunk rather than being rejected.
    fn pack(&self, records: &[Record]) -> Vec<Vec<Record>> {
        let budget = self.config.max_chunk_bytes.max(1);
        let mut chunks: Vec<Vec<Record>> = Vec::new();
        let mut current: Vec<Record> = Vec::new();
        let mut current_size = 0usize;

        for record in records {
            let estimate = estimated_record_size(record, self.config.record_overhead);
            if estimate >= budget {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                    current_size = 0;
                }
                chunks.push(vec![record.clone()]);
                continue;
            }
            if current_size + estimate > budget && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current.push(record.clone());
            current_size += estimate;
        }
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }

    /// Write one chunk atomically, retrying transient failures with a
    /// fixed backoff. Fatal errors surface immediately.
    async fn write_chunk(&self, idx: u32, records: &[Record]) -> StoreResult<()> {
        let bytes = envelope::seal(&records, self.crypto.as_ref())?;
        let path = self.chunk_path(idx);
        let attempts = self.config.write_retries.max(1);

        let mut attempt = 1;
        loop {
            match self.fs.write_atomic(&path, &bytes).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(table = %self.table, chunk = idx, attempt, error = %e, "chunk write failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_chunk(&self, idx: u32) -> StoreResult<ChunkRead> {
        let Some(bytes) = self.fs.read(&self.chunk_path(idx)).await? else {
            warn!(table = %self.table, chunk = idx, "chunk file missing, skipping");
            return Ok(ChunkRead::Skipped);
        };
        match envelope::open(&bytes, self.crypto.as_ref()) {
            Ok(records) => Ok(ChunkRead::Records(records)),
            Err(StoreError::CorruptedData(reason)) => {
                warn!(table = %self.table, chunk = idx, %reason, "chunk failed verification, skipping");
                Ok(ChunkRead::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Read and verify the given chunks, a bounded number in flight at a
    /// time, preserving index order in the result.
    async fn read_indices(&self, indices: Vec<u32>) -> StoreResult<ReadOutcome> {
        let reads: Vec<StoreResult<ChunkRead>> = stream::iter(indices)
            .map(|idx| self.read_chunk(idx))
            .buffered(self.config.read_concurrency.max(1))
            .collect()
            .await;

        let mut outcome = ReadOutcome::default();
        for read in reads {
            match read? {
                ChunkRead::Records(records) => outcome.records.extend(records),
                ChunkRead::Skipped => outcome.skipped_chunks += 1,
            }
        }
        Ok(outcome)
    }

    /// Restrict a verified read to a contiguous chunk-index window
    /// (inclusive bounds).
    pub async fn read_range(&self, lo: u32, hi: u32) -> StoreResult<ReadOutcome> {
        let indices: Vec<u32> = self.chunk_indices().await?.into_iter().filter(|idx| *idx >= lo && *idx <= hi).collect();
        self.read_indices(indices).await
    }
}

#[async_trait]
impl PersistenceHandler for ChunkedFileHandler {
    async fn read_all(&self) -> StoreResult<ReadOutcome> {
        let indices = self.chunk_indices().await?;
        self.read_indices(indices).await
    }

    async fn append(&self, records: &[Record]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        self.fs.create_dir_all(&self.dir).await?;
        let mut meta = self.current_meta().await?;
        let chunks = self.pack(records);

        let start = meta.chunk_count;
        for (offset, chunk) in chunks.iter().enumerate() {
            self.write_chunk(start + offset as u32, chunk).await?;
        }

        meta.chunk_count += chunks.len() as u32;
        meta.record_count += records.len();
        meta.updated_at = epoch_millis();
        self.store_meta(&meta).await
    }

    async fn rewrite(&self, records: &[Record]) -> StoreResult<()> {
        self.clear().await?;
        self.append(records).await
    }

    async fn clear(&self) -> StoreResult<()> {
        for name in self.fs.list(&self.dir).await? {
            self.fs.remove(&self.dir.join(name)).await?;
        }
        self.fs.remove(&self.meta_path()).await?;
        self.fs.remove_dir(&self.dir).await
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.current_meta().await?.record_count)
    }

    async fn chunk_count(&self) -> StoreResult<u32> {
        Ok(self.current_meta().await?.chunk_count)
    }
}
