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

//! Eviction victim selection
//!
//! Shared by the data cache and the credential cache so both rank entries
//! with the same scoring rules.

use std::time::Instant;

/// Eviction policy for bounded caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least Recently Used: the victim is the entry with the oldest access
    Lru,
    /// Least Frequently Used with decay: the victim is the entry with the
    /// lowest `access_count / (seconds idle + 1)` score, so entries that
    /// were hot once but have gone cold are not pinned forever
    Lfu,
}

/// Access bookkeeping carried by every cache entry
#[derive(Debug, Clone, Copy)]
pub struct AccessStamp {
    pub access_count: u64,
    pub last_access: Instant,
}

impl AccessStamp {
    pub fn new() -> Self {
        Self { access_count: 1, last_access: Instant::now() }
    }

    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_access = Instant::now();
    }
}

impl Default for AccessStamp {
    fn default() -> Self {
        Self::new()
    }
}

/// Decaying-frequency score used by the LFU policy. Higher means more
/// worth keeping.
pub fn lfu_score(stamp: &AccessStamp, now: Instant) -> f64 {
    let idle = now.saturating_duration_since(stamp.last_access).as_secs_f64();
    stamp.access_count as f64 / (idle + 1.0)
}

/// Select the eviction victim among the candidates, or None when the
/// iterator is empty.
pub fn select_victim<K, I>(policy: EvictionPolicy, candidates: I) -> Option<K>
where
    I: IntoIterator<Item = (K, AccessStamp)>,
{
    let now = Instant::now();
    let mut victim: Option<(K, AccessStamp)> = None;

    for (key, stamp) in candidates {
        let replace = match &victim {
            None => true,
            Some((_, best)) => match policy {
                EvictionPolicy::Lru => stamp.last_access < best.last_access,
                EvictionPolicy::Lfu => lfu_score(&stamp, now) < lfu_score(best, now),
            },
        };
        if replace {
            victim = Some((key, stamp));
        }
    }

    victim.map(|(key, _)| key)
}
