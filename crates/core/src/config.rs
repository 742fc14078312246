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

// Engine configuration. Every knob the subsystems consult lives here so a
// store can be tuned once at construction and the pieces stay consistent.

use std::path::PathBuf;
use std::time::Duration;

use crate::cache::EvictionPolicy;

/// Chunked-storage tuning
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Maximum serialized bytes packed into one chunk file
    pub max_chunk_bytes: usize,
    /// Fixed per-record overhead added to size estimates, covering the
    /// envelope cost around each serialized record
    pub record_overhead: usize,
    /// Attempts for a single chunk write before surfacing WriteFailed
    pub write_retries: u32,
    /// Fixed backoff between chunk write attempts
    pub retry_backoff: Duration,
    /// Maximum chunk reads in flight during a full-table read
    pub read_concurrency: usize,
    /// Upper bound on directory-scan indices when catalog metadata is
    /// stale or absent
    pub scan_limit: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 256 * 1024, // 256 KiB per chunk file
            record_overhead: 200,
            write_retries: 3,
            retry_backoff: Duration::from_millis(100),
            read_concurrency: 4,
            scan_limit: 1000,
        }
    }
}

/// Cache tuning
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries before eviction kicks in
    pub max_entries: usize,
    /// Which eviction policy selects victims
    pub policy: EvictionPolicy,
    /// Default time-to-live for entries inserted without an explicit one
    pub default_ttl: Option<Duration>,
    /// Short TTL applied to the sentinel cached for absent keys
    /// (penetration protection)
    pub penetration_ttl: Duration,
    /// Fractional jitter applied to every TTL so co-inserted entries do
    /// not expire in the same instant (avalanche protection)
    pub ttl_jitter: f64,
    /// Disable jitter entirely (deterministic tests)
    pub enable_jitter: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            policy: EvictionPolicy::Lru,
            default_ttl: Some(Duration::from_secs(300)), // 5 minutes
            penetration_ttl: Duration::from_secs(30),
            ttl_jitter: 0.10, // +/- 10%
            enable_jitter: true,
        }
    }
}

/// Auto-sync service tuning
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// A sync cycle fires once this much time has elapsed since the last one
    pub interval: Duration,
    /// A sync cycle also fires once this many cache entries are dirty
    pub min_dirty_items: usize,
    /// Records written through a handler per batch
    pub batch_size: usize,
    /// How often the service re-checks its trigger conditions
    pub poll_period: Duration,
    /// Additional attempts for a failed batch before it is left dirty
    pub retry_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_dirty_items: 16,
            batch_size: 100,
            poll_period: Duration::from_millis(100),
            retry_attempts: 2,
        }
    }
}

/// Top-level store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding every table's files and the catalog
    pub root: PathBuf,
    /// Estimated payload size at or above which a table is created in
    /// chunked mode rather than single-file mode
    pub single_file_threshold: usize,
    /// Timeout applied to every filesystem operation
    pub fs_timeout: Duration,
    /// Chunked-storage tuning
    pub chunk: ChunkConfig,
    /// Cache tuning
    pub cache: CacheConfig,
    /// Auto-sync tuning
    pub sync: SyncConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./dotstore"),
            single_file_threshold: 1024 * 1024, // 1 MiB
            fs_timeout: Duration::from_secs(10),
            chunk: ChunkConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Configuration rooted at the given directory, defaults elsewhere.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), ..Default::default() }
    }
}
