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

//! DotStore core engine
//!
//! An embedded document store for sandboxed, size-limited filesystems:
//! JSON records persisted through content-hash-verified single-file or
//! chunked handlers, fronted by a write-back cache with stampede
//! protections, flushed by a background auto-sync service, with
//! snapshot-revert transactions on top.
//!
//! The entry point is [`store::DocumentStore`].

pub mod cache;
pub mod catalog;
pub mod config;
pub mod crypto;
pub mod fs;
pub mod query;
pub mod storage;
pub mod store;
pub mod sync;
pub mod transaction;

pub use cache::{CacheManager, CacheStats, EvictionPolicy};
pub use catalog::{Catalog, DriftReport, StorageMode, TableMeta};
pub use config::{CacheConfig, ChunkConfig, StoreConfig, SyncConfig};
pub use crypto::{CachingSecretStore, CryptoProvider, MemorySecretStore, SecretStore, StdCrypto};
pub use fs::{FileAccess, MemoryFileAccess, StdFileAccess};
pub use query::{AlgorithmHint, CmpOp, CustomPredicate, Direction, Filter, SortSpec};
pub use storage::{ChunkedFileHandler, PersistenceHandler, ReadOutcome, SingleFileHandler};
pub use store::{DocumentStore, Durability, ReadReport, StoreStats, WriteMode, WriteOptions};
pub use sync::{FlushSink, SyncStats};

pub use dotstore_common::{Record, StoreError, StoreEvent, StoreResult, WriteKind};
