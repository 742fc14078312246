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

// Error taxonomy for the whole engine. Fatal conditions (Timeout, DiskFull,
// PermissionDenied) always propagate to the caller; transient conditions may
// be retried locally by the storage handlers before surfacing.

use std::io;
use std::time::Duration;

/// Error types surfaced by store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Chunk {chunk} of table '{table}' failed integrity verification")]
    ChunkIntegrityFailed { table: String, chunk: u32 },

    #[error("Disk full")]
    DiskFull,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transaction already in progress")]
    TransactionAlreadyActive,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Classify an I/O failure that happened on a write path.
    pub fn from_io_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => StoreError::DiskFull,
            io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => StoreError::PermissionDenied(err.to_string()),
            _ => StoreError::WriteFailed(err.to_string()),
        }
    }

    /// Classify an I/O failure that happened on a read path.
    pub fn from_io_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => StoreError::PermissionDenied(err.to_string()),
            _ => StoreError::ReadFailed(err.to_string()),
        }
    }

    /// Fatal errors abort the surrounding operation and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::DiskFull | StoreError::PermissionDenied(_))
    }

    /// Transient errors (lock/busy style conditions) are eligible for the
    /// bounded retry loop in the chunked writer.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::WriteFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_write_classification() {
        let disk_full = io::Error::new(io::ErrorKind::StorageFull, "no space left on device");
        assert!(matches!(StoreError::from_io_write(disk_full), StoreError::DiskFull));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "read-only");
        assert!(matches!(StoreError::from_io_write(denied), StoreError::PermissionDenied(_)));

        let busy = io::Error::new(io::ErrorKind::ResourceBusy, "file is locked");
        let mapped = StoreError::from_io_write(busy);
        assert!(matches!(mapped, StoreError::WriteFailed(_)));
        assert!(mapped.is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StoreError::DiskFull.is_fatal());
        assert!(StoreError::Timeout(Duration::from_secs(10)).is_fatal());
        assert!(StoreError::PermissionDenied("denied".into()).is_fatal());
        assert!(!StoreError::TableNotFound("users".into()).is_fatal());
        assert!(!StoreError::WriteFailed("busy".into()).is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = StoreError::ChunkIntegrityFailed { table: "users".into(), chunk: 3 };
        assert_eq!(err.to_string(), "Chunk 3 of table 'users' failed integrity verification");

        let err = StoreError::TransactionAlreadyActive;
        assert_eq!(err.to_string(), "Transaction already in progress");
    }
}
