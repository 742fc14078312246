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

//! Record representation
//!
//! A record is an open mapping of field name to JSON value. The engine
//! enforces no schema and no primary key; any `id`-like field is a caller
//! convention, not a constraint.

use serde_json::{Map, Value};

/// A single stored record: field name -> scalar/array/nested value.
pub type Record = Map<String, Value>;

/// Convert a JSON value into a record, if it is an object.
pub fn record_from_value(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Wrap a record slice back into a JSON array value.
pub fn records_to_value(records: &[Record]) -> Value {
    Value::Array(records.iter().cloned().map(Value::Object).collect())
}
