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

//! Transaction service
//!
//! Immediate-apply, snapshot-revert transactions: at most one active per
//! store instance. Writes inside an active transaction hit the
//! persistence layer right away; the pre-transaction full record set of
//! each table is captured once, on first touch. Commit discards the
//! snapshots (the operations already happened); rollback hands them back
//! so the store can restore each touched table by full overwrite.
//!
//! This service owns the state machine only -- snapshot capture reads and
//! rollback writes go through the store, which holds the per-table locks.

use std::collections::HashMap;

use parking_lot::Mutex;

use dotstore_common::{Record, StoreError, StoreResult};

/// Captured pre-transaction record sets, keyed by table name.
pub type SnapshotMap = HashMap<String, Vec<Record>>;

#[derive(Default)]
pub struct TransactionService {
    /// None when idle; the snapshot map while a transaction is active.
    snapshots: Mutex<Option<SnapshotMap>>,
}

impl TransactionService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move Idle -> Active. A nested begin is a hard error, never queued.
    pub fn begin(&self) -> StoreResult<()> {
        let mut snapshots = self.snapshots.lock();
        if snapshots.is_some() {
            return Err(StoreError::TransactionAlreadyActive);
        }
        *snapshots = Some(SnapshotMap::new());
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.snapshots.lock().is_some()
    }

    /// Whether the table still needs its first-touch snapshot captured.
    pub fn needs_snapshot(&self, table: &str) -> bool {
        self.snapshots.lock().as_ref().is_some_and(|map| !map.contains_key(table))
    }

    /// Store the table's pre-transaction record set. A second capture for
    /// the same table is ignored; only the first touch counts.
    pub fn record_snapshot(&self, table: &str, records: Vec<Record>) {
        if let Some(map) = self.snapshots.lock().as_mut() {
            map.entry(table.to_string()).or_insert(records);
        }
    }

    /// Move Active -> Idle, discarding the snapshots. Returns the names
    /// of the tables the transaction touched.
    pub fn commit(&self) -> StoreResult<Vec<String>> {
        let map = self.snapshots.lock().take().ok_or_else(|| StoreError::Unknown("no transaction in progress".into()))?;
        Ok(map.into_keys().collect())
    }

    /// Move Active -> Idle, handing the snapshots back for restoration.
    pub fn take_for_rollback(&self) -> StoreResult<SnapshotMap> {
        self.snapshots.lock().take().ok_or_else(|| StoreError::Unknown("no transaction in progress".into()))
    }
}
