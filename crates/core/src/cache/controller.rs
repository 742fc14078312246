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

//! Cache controller
//!
//! Tracks which cache keys exist per table so a write invalidates exactly
//! the cached results it could have made stale, instead of flushing the
//! whole cache. Invalidation runs synchronously inside the write path;
//! the broadcast bus carries after-the-fact events for observers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use dotstore_common::StoreEvent;

use crate::cache::keys;
use crate::cache::manager::CacheManager;

const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct CacheController {
    cache: Arc<CacheManager>,
    index: RwLock<HashMap<String, HashSet<String>>>,
    events: broadcast::Sender<StoreEvent>,
}

impl CacheController {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cache,
            index: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Record that `key` holds cached data derived from `table`.
    pub fn register(&self, table: &str, key: &str) {
        self.index.write().entry(table.to_string()).or_default().insert(key.to_string());
    }

    /// Invalidate every cached result recorded against the table,
    /// including its full-data entry. The index entry survives so future
    /// registrations stay cheap.
    pub fn invalidate_table(&self, table: &str) {
        let keys: Vec<String> = match self.index.write().get_mut(table) {
            Some(set) => set.drain().collect(),
            None => Vec::new(),
        };
        for key in &keys {
            self.cache.remove(key);
        }
        // The data key may exist without having been registered (deferred
        // writes insert it directly).
        self.cache.remove(&keys::table_data_key(table));
    }

    /// Invalidate cached query results only, leaving the table's
    /// full-data entry in place. Used by deferred writes, which update
    /// the data entry themselves.
    pub fn invalidate_queries(&self, table: &str) {
        let data_key = keys::table_data_key(table);
        let stale: Vec<String> = match self.index.write().get_mut(table) {
            Some(set) => {
                let stale: Vec<String> = set.iter().filter(|k| **k != data_key).cloned().collect();
                for key in &stale {
                    set.remove(key);
                }
                stale
            }
            None => Vec::new(),
        };
        for key in &stale {
            self.cache.remove(key);
        }
    }

    /// Drop the table's entire cache-key index along with its cached
    /// entries (table clear/drop).
    pub fn purge_table(&self, table: &str) {
        let keys: Vec<String> = self.index.write().remove(table).map(|set| set.into_iter().collect()).unwrap_or_default();
        for key in &keys {
            self.cache.remove(key);
        }
        self.cache.remove(&keys::table_data_key(table));
    }

    /// Number of outstanding cache keys recorded for the table.
    pub fn outstanding(&self, table: &str) -> usize {
        self.index.read().get(table).map(|set| set.len()).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Publish an event to observers. Lagging or absent receivers are not
    /// an error.
    pub fn publish(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }
}
