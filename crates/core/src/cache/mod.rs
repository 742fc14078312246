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

//! In-memory caching layer: the write-back cache manager, eviction
//! scoring shared with the credential cache, deterministic key
//! derivation, and the per-table invalidation controller.

pub mod controller;
pub mod eviction;
pub mod keys;
pub mod manager;

pub use controller::CacheController;
pub use eviction::{AccessStamp, EvictionPolicy};
pub use manager::{CacheEntry, CacheManager, CacheStats, CachedValue};
