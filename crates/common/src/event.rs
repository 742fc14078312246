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

//! Store events
//!
//! Events published on the store's broadcast bus after the corresponding
//! operation has completed. Cache invalidation does not depend on this bus
//! (it runs synchronously inside the write path); the bus exists for
//! observers such as tests, metrics collectors, or the sync service's
//! completion notifications.

/// The kind of mutation a write event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Records appended to the existing table contents
    Append,
    /// Table contents replaced wholesale
    Replace,
    /// Records modified in place
    Update,
    /// Records removed
    Delete,
    /// All table contents removed
    Clear,
}

/// Events emitted by the store after successful operations
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A table was created in the catalog
    TableCreated { table: String },
    /// A table and its data were dropped
    TableDropped { table: String },
    /// A mutation completed against a table
    Write { table: String, kind: WriteKind, records_affected: usize },
    /// A background sync cycle finished
    SyncCompleted { items_synced: usize, duration_ms: u64 },
    /// A transaction rolled back and restored the named tables
    RolledBack { tables: Vec<String> },
}

impl StoreEvent {
    /// The table this event concerns, if it concerns exactly one.
    pub fn table(&self) -> Option<&str> {
        match self {
            StoreEvent::TableCreated { table } | StoreEvent::TableDropped { table } | StoreEvent::Write { table, .. } => Some(table),
            StoreEvent::SyncCompleted { .. } | StoreEvent::RolledBack { .. } => None,
        }
    }
}
