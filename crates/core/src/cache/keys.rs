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

//! Deterministic cache key derivation
//!
//! Every key carries the owning table name so dirty entries can be routed
//! back to the right persistence handler and invalidation can stay
//! per-table. Table names containing `:` are rejected at table creation,
//! which keeps parsing unambiguous.

use crate::crypto::CryptoProvider;

const DATA_SUFFIX: &str = "data";
const QUERY_MARK: &str = "query";
const RECORD_MARK: &str = "record";

/// Key holding a table's full record set.
pub fn table_data_key(table: &str) -> String {
    format!("table:{table}:{DATA_SUFFIX}")
}

/// Key holding a single record looked up by a caller-supplied reference.
pub fn record_key(table: &str, reference: &str) -> String {
    format!("table:{table}:{RECORD_MARK}:{reference}")
}

/// Key holding one query's result set. The serialized filter is digested
/// so arbitrarily large filter trees still derive bounded keys.
pub fn query_key(table: &str, serialized_filter: &str, crypto: &dyn CryptoProvider) -> String {
    let digest = crypto.digest(serialized_filter.as_bytes());
    format!("table:{table}:{QUERY_MARK}:{}", &digest[..16])
}

/// The table a key belongs to, if it follows the table key scheme.
pub fn parse_table(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("table:")?;
    let end = rest.find(':')?;
    Some(&rest[..end])
}

/// Whether the key is a table's full-data key (the only kind the auto-sync
/// service flushes).
pub fn is_data_key(key: &str) -> bool {
    parse_table(key).is_some_and(|table| key == table_data_key(table))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StdCrypto;

    #[test]
    fn test_key_shapes() {
        assert_eq!(table_data_key("users"), "table:users:data");
        assert_eq!(record_key("users", "42"), "table:users:record:42");
    }

    #[test]
    fn test_query_key_is_deterministic_and_bounded() {
        let crypto = StdCrypto::new();
        let a = query_key("users", r#"{"op":"eq","field":"name"}"#, &crypto);
        let b = query_key("users", r#"{"op":"eq","field":"name"}"#, &crypto);
        let c = query_key("users", r#"{"op":"eq","field":"age"}"#, &crypto);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.len() < 64);
    }

    #[test]
    fn test_parse_table() {
        let crypto = StdCrypto::new();
        assert_eq!(parse_table(&table_data_key("orders")), Some("orders"));
        assert_eq!(parse_table(&query_key("orders", "{}", &crypto)), Some("orders"));
        assert_eq!(parse_table("unrelated"), None);
    }

    #[test]
    fn test_is_data_key() {
        assert!(is_data_key("table:users:data"));
        assert!(!is_data_key("table:users:record:1"));
        assert!(!is_data_key("table:users:query:abcd"));
    }
}
