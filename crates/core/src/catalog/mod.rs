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

//! Metadata catalog
//!
//! One record per table: storage mode, logical path, record count, chunk
//! count, timestamps. The catalog is the source of truth for how many
//! records a table holds and whether it is stored as a single file or in
//! chunks. It is persisted to `<root>/catalog.db` after every mutation; on
//! open, a missing file means a fresh store and a corrupted file triggers
//! a rebuild from a directory scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use dotstore_common::{Record, StoreError, StoreResult, epoch_millis};

use crate::crypto::CryptoProvider;
use crate::fs::FileAccess;
use crate::storage::envelope;

/// File name of the persisted catalog under the storage root.
pub const CATALOG_FILE: &str = "catalog.db";

/// File name of a chunked table's local metadata copy.
pub const TABLE_META_FILE: &str = "meta.db";

/// How a table's records are laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// The whole table lives in one atomically replaced file
    Single,
    /// The table is split across independently hashed chunk files
    Chunked,
}

/// Catalog record for one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMeta {
    pub name: String,
    pub mode: StorageMode,
    pub path: PathBuf,
    #[serde(rename = "count")]
    pub record_count: usize,
    #[serde(rename = "chunks")]
    pub chunk_count: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TableMeta {
    pub fn new(name: &str, mode: StorageMode, path: PathBuf) -> Self {
        let now = epoch_millis();
        Self {
            name: name.to_string(),
            mode,
            path,
            record_count: 0,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of comparing a table's recorded count against a fresh scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    pub table: String,
    pub recorded: usize,
    pub actual: usize,
}

impl DriftReport {
    pub fn consistent(&self) -> bool {
        self.recorded == self.actual
    }
}

/// Metadata manager, one per store instance
pub struct Catalog {
    root: PathBuf,
    fs: Arc<dyn FileAccess>,
    crypto: Arc<dyn CryptoProvider>,
    tables: RwLock<HashMap<String, TableMeta>>,
}

impl Catalog {
    /// Load the catalog from the storage root. A missing catalog file is a
    /// fresh store; a corrupted one is rebuilt from a directory scan.
    pub async fn open(root: &Path, fs: Arc<dyn FileAccess>, crypto: Arc<dyn CryptoProvider>) -> StoreResult<Self> {
        let catalog = Self {
            root: root.to_path_buf(),
            fs,
            crypto,
            tables: RwLock::new(HashMap::new()),
        };

        let path = catalog.root.join(CATALOG_FILE);
        match catalog.fs.read(&path).await? {
            None => {}
            Some(bytes) => match envelope::open::<Vec<TableMeta>>(&bytes, catalog.crypto.as_ref()) {
                Ok(list) => {
                    let mut tables = catalog.tables.write();
                    for meta in list {
                        tables.insert(meta.name.clone(), meta);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "catalog file corrupted, rebuilding from directory scan");
                    let rebuilt = catalog.rebuild_from_scan().await?;
                    *catalog.tables.write() = rebuilt;
                    catalog.persist().await?;
                }
            },
        }

        Ok(catalog)
    }

    /// Reconstruct table metadata from what is actually on disk: `.db`
    /// files at the root are single-file tables, subdirectories are
    /// chunked tables (their local `meta.db` is preferred, with a chunk
    /// listing as fallback).
    async fn rebuild_from_scan(&self) -> StoreResult<HashMap<String, TableMeta>> {
        let mut tables = HashMap::new();

        for file in self.fs.list(&self.root).await? {
            if file == CATALOG_FILE {
                continue;
            }
            let Some(name) = file.strip_suffix(".db") else { continue };
            let path = self.root.join(&file);
            let mut meta = TableMeta::new(name, StorageMode::Single, path.clone());
            if let Some(bytes) = self.fs.read(&path).await? {
                match envelope::open::<Vec<Record>>(&bytes, self.crypto.as_ref()) {
                    Ok(records) => meta.record_count = records.len(),
                    Err(e) => warn!(table = name, error = %e, "unreadable single-file table during rebuild"),
                }
            }
            tables.insert(name.to_string(), meta);
        }

        for dir in self.fs.list_dirs(&self.root).await? {
            let dir_path = self.root.join(&dir);
            let meta_path = dir_path.join(TABLE_META_FILE);
            let meta = match self.fs.read(&meta_path).await? {
                Some(bytes) => match serde_json::from_slice::<TableMeta>(&bytes) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(table = %dir, error = %e, "unreadable table meta during rebuild, counting chunks");
                        self.meta_from_chunk_listing(&dir, &dir_path).await?
                    }
                },
                None => self.meta_from_chunk_listing(&dir, &dir_path).await?,
            };
            tables.insert(meta.name.clone(), meta);
        }

        Ok(tables)
    }

    async fn meta_from_chunk_listing(&self, name: &str, dir_path: &Path) -> StoreResult<TableMeta> {
        let mut meta = TableMeta::new(name, StorageMode::Chunked, dir_path.to_path_buf());
        for file in self.fs.list(dir_path).await? {
            if file == TABLE_META_FILE || !file.ends_with(".db") {
                continue;
            }
            meta.chunk_count += 1;
            if let Some(bytes) = self.fs.read(&dir_path.join(&file)).await? {
                if let Ok(records) = envelope::open::<Vec<Record>>(&bytes, self.crypto.as_ref()) {
                    meta.record_count += records.len();
                }
            }
        }
        Ok(meta)
    }

    async fn persist(&self) -> StoreResult<()> {
        let mut list: Vec<TableMeta> = self.tables.read().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));

        let bytes = envelope::seal(&list, self.crypto.as_ref())?;
        self.fs.write_atomic(&self.root.join(CATALOG_FILE), &bytes).await
    }

    /// Register a new table. Fails with `TableAlreadyExists` on a name
    /// collision.
    pub async fn create(&self, meta: TableMeta) -> StoreResult<()> {
        {
            let mut tables = self.tables.write();
            if tables.contains_key(&meta.name) {
                return Err(StoreError::TableAlreadyExists(meta.name));
            }
            tables.insert(meta.name.clone(), meta);
        }
        self.persist().await
    }

    pub fn get(&self, name: &str) -> Option<TableMeta> {
        self.tables.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<TableMeta> {
        let mut list: Vec<TableMeta> = self.tables.read().values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Apply a mutation to a table's metadata, bump `updated_at`, and
    /// persist. Returns the updated record.
    pub async fn update<F>(&self, name: &str, mutate: F) -> StoreResult<TableMeta>
    where
        F: FnOnce(&mut TableMeta),
    {
        let updated = {
            let mut tables = self.tables.write();
            let meta = tables.get_mut(name).ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
            mutate(meta);
            meta.updated_at = epoch_millis();
            meta.clone()
        };
        self.persist().await?;
        Ok(updated)
    }

    /// Remove a table's record (explicit drop only).
    pub async fn remove(&self, name: &str) -> StoreResult<()> {
        {
            let mut tables = self.tables.write();
            if tables.remove(name).is_none() {
                return Err(StoreError::TableNotFound(name.to_string()));
            }
        }
        self.persist().await
    }

    /// Compare the recorded count against a freshly scanned one.
    pub fn verify(&self, name: &str, actual: usize) -> StoreResult<DriftReport> {
        let recorded = self.get(name).ok_or_else(|| StoreError::TableNotFound(name.to_string()))?.record_count;
        Ok(DriftReport {
            table: name.to_string(),
            recorded,
            actual,
        })
    }
}
