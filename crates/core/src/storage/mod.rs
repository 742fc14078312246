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

//! Durable persistence handlers
//!
//! Two handlers implement byte-level durability behind one trait:
//! single-file (whole-payload atomic replace, corruption is fatal) and
//! chunked (independently hashed chunk files, corruption is contained to
//! the failing chunk).

pub mod chunked;
pub mod envelope;
pub mod single_file;
pub mod strategy;

pub use chunked::ChunkedFileHandler;
pub use single_file::SingleFileHandler;
pub use strategy::{estimated_payload_size, estimated_record_size, select_mode};

use async_trait::async_trait;

use dotstore_common::{Record, StoreResult};

/// Result of a verified read
#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    /// Records recovered from all verifiably intact storage units
    pub records: Vec<Record>,
    /// Chunks excluded because their digest did not verify (always 0 for
    /// single-file tables, where corruption fails the read instead)
    pub skipped_chunks: u32,
}

/// Durable read/append/clear operations over one table's files
#[async_trait]
pub trait PersistenceHandler: Send + Sync {
    /// Read and verify everything the table holds.
    async fn read_all(&self) -> StoreResult<ReadOutcome>;

    /// Append records to the existing contents.
    async fn append(&self, records: &[Record]) -> StoreResult<()>;

    /// Replace the table's contents wholesale.
    async fn rewrite(&self, records: &[Record]) -> StoreResult<()>;

    /// Remove every file belonging to the table.
    async fn clear(&self) -> StoreResult<()>;

    /// Number of records currently recoverable without a full scan when
    /// local metadata allows it.
    async fn count(&self) -> StoreResult<usize>;

    /// Number of chunk files backing the table (0 in single-file mode).
    async fn chunk_count(&self) -> StoreResult<u32>;
}
