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

//! Storage strategy selection
//!
//! Chooses between single-file and chunked mode from an estimated payload
//! size. The selection happens once, at table creation or first large
//! write, and is recorded in the catalog; it is only re-evaluated through
//! an explicit migration.

use dotstore_common::Record;

use crate::catalog::StorageMode;

/// Estimated serialized size of one record, including the fixed envelope
/// overhead each record carries inside a stored payload.
pub fn estimated_record_size(record: &Record, overhead: usize) -> usize {
    serde_json::to_vec(record).map(|b| b.len()).unwrap_or(0) + overhead
}

/// Estimated serialized size of a full record set.
pub fn estimated_payload_size(records: &[Record], overhead: usize) -> usize {
    records.iter().map(|r| estimated_record_size(r, overhead)).sum()
}

/// Pick the storage mode for a table holding `records`: below the
/// threshold the table fits one atomic file, at or above it the table is
/// chunked.
pub fn select_mode(records: &[Record], single_file_threshold: usize, record_overhead: usize) -> StorageMode {
    if estimated_payload_size(records, record_overhead) < single_file_threshold {
        StorageMode::Single
    } else {
        StorageMode::Chunked
    }
}
