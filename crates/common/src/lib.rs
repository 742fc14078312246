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

//! Shared types for the DotStore engine
//!
//! This crate holds the pieces every other crate agrees on: the error
//! taxonomy, the record representation, store events, and timestamp
//! helpers. It deliberately has no I/O of its own.

pub mod error;
pub mod event;
pub mod record;
pub mod time;

pub use error::{StoreError, StoreResult};
pub use event::{StoreEvent, WriteKind};
pub use record::{Record, record_from_value, records_to_value};
pub use time::epoch_millis;
