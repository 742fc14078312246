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

//! Predicate and sort evaluator
//!
//! Filters are a tagged-union AST evaluated by a small recursive
//! interpreter over record field paths (dotted nesting). Values of
//! different JSON types are incomparable and never match a comparison.
//! Data filters serialize, which is what query cache keys are derived
//! from; `Custom` filters carry an opaque predicate and are excluded from
//! serialization and caching.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use dotstore_common::{Record, StoreError, StoreResult};

/// Comparison operators for [`Filter::Cmp`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Ne,
}

/// Caller-supplied predicate for filters the AST cannot express
#[derive(Clone)]
pub struct CustomPredicate(pub Arc<dyn Fn(&Record) -> bool + Send + Sync>);

impl CustomPredicate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomPredicate(..)")
    }
}

impl Default for CustomPredicate {
    fn default() -> Self {
        Self::new(|_| false)
    }
}

/// Filter expression tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Filter {
    /// Field equals value exactly
    Eq { field: String, value: Value },
    /// Field compares against value with the given operator
    Cmp { field: String, op: CmpOp, value: Value },
    /// Field's value is one of the listed values
    In { field: String, values: Vec<Value> },
    /// All sub-filters match
    And(Vec<Filter>),
    /// At least one sub-filter matches
    Or(Vec<Filter>),
    /// Opaque caller predicate; not serializable, not cacheable
    #[serde(skip)]
    Custom(CustomPredicate),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn cmp(field: &str, op: CmpOp, value: impl Into<Value>) -> Self {
        Filter::Cmp {
            field: field.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn is_in(field: &str, values: Vec<Value>) -> Self {
        Filter::In {
            field: field.to_string(),
            values,
        }
    }

    /// Whether this filter tree can serialize, and therefore derive a
    /// stable query cache key.
    pub fn is_cacheable(&self) -> bool {
        match self {
            Filter::Custom(_) => false,
            Filter::And(filters) | Filter::Or(filters) => filters.iter().all(Filter::is_cacheable),
            _ => true,
        }
    }

    /// Canonical serialized form used for cache key derivation.
    pub fn serialized(&self) -> StoreResult<String> {
        if !self.is_cacheable() {
            return Err(StoreError::Unknown("custom filters have no serialized form".into()));
        }
        serde_json::to_string(self).map_err(|e| StoreError::Unknown(format!("filter serialization failed: {e}")))
    }
}

/// Look up a dotted field path inside a record.
fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Order two JSON values: numbers by magnitude, strings and booleans by
/// their natural order. Values of different types are incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Evaluate a filter against one record.
pub fn matches(record: &Record, filter: &Filter) -> bool {
    match filter {
        Filter::Eq { field, value } => lookup(record, field) == Some(value),
        Filter::Cmp { field, op, value } => {
            let Some(actual) = lookup(record, field) else { return false };
            let Some(ordering) = compare_values(actual, value) else { return false };
            match op {
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Gte => ordering != Ordering::Less,
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Lte => ordering != Ordering::Greater,
                CmpOp::Ne => ordering != Ordering::Equal,
            }
        }
        Filter::In { field, values } => lookup(record, field).is_some_and(|actual| values.contains(actual)),
        Filter::And(filters) => filters.iter().all(|f| matches(record, f)),
        Filter::Or(filters) => filters.iter().any(|f| matches(record, f)),
        Filter::Custom(predicate) => (predicate.0)(record),
    }
}

/// Sort direction for one field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Whether equal-keyed records must keep their relative order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmHint {
    Stable,
    Unstable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub direction: Direction,
}

/// Multi-field sort specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub fields: Vec<SortField>,
    pub algorithm_hint: AlgorithmHint,
}

impl SortSpec {
    pub fn by(field: &str, direction: Direction) -> Self {
        Self {
            fields: vec![SortField {
                field: field.to_string(),
                direction,
            }],
            algorithm_hint: AlgorithmHint::Stable,
        }
    }

    pub fn then_by(mut self, field: &str, direction: Direction) -> Self {
        self.fields.push(SortField {
            field: field.to_string(),
            direction,
        });
        self
    }
}

fn compare_records(a: &Record, b: &Record, spec: &SortSpec) -> Ordering {
    for sort_field in &spec.fields {
        let left = lookup(a, &sort_field.field);
        let right = lookup(b, &sort_field.field);
        // Missing or incomparable values sort after present ones, in
        // either direction; only present pairs follow the direction.
        let ordering = match (left, right) {
            (Some(l), Some(r)) => {
                let ordering = compare_values(l, r).unwrap_or(Ordering::Equal);
                match sort_field.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            }
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Sort records in place according to the spec.
pub fn sort_records(records: &mut [Record], spec: &SortSpec) {
    match spec.algorithm_hint {
        AlgorithmHint::Stable => records.sort_by(|a, b| compare_records(a, b, spec)),
        AlgorithmHint::Unstable => records.sort_unstable_by(|a, b| compare_records(a, b, spec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotstore_common::record_from_value;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        record_from_value(value).unwrap()
    }

    #[test]
    fn test_eq_and_nested_paths() {
        let r = record(json!({"name": "Ada", "address": {"city": "London"}}));

        assert!(matches(&r, &Filter::eq("name", "Ada")));
        assert!(!matches(&r, &Filter::eq("name", "Eve")));
        assert!(matches(&r, &Filter::eq("address.city", "London")));
        assert!(!matches(&r, &Filter::eq("address.country", "UK")));
    }

    #[test]
    fn test_comparisons() {
        let r = record(json!({"age": 30}));

        assert!(matches(&r, &Filter::cmp("age", CmpOp::Gt, 20)));
        assert!(matches(&r, &Filter::cmp("age", CmpOp::Gte, 30)));
        assert!(!matches(&r, &Filter::cmp("age", CmpOp::Lt, 30)));
        assert!(matches(&r, &Filter::cmp("age", CmpOp::Lte, 30)));
        assert!(matches(&r, &Filter::cmp("age", CmpOp::Ne, 31)));
    }

    #[test]
    fn test_cross_type_comparison_never_matches() {
        let r = record(json!({"age": 30}));
        assert!(!matches(&r, &Filter::cmp("age", CmpOp::Gt, "20")));
        assert!(!matches(&r, &Filter::eq("age", "30")));
    }

    #[test]
    fn test_in_and_combinators() {
        let r = record(json!({"status": "active", "age": 30}));

        assert!(matches(&r, &Filter::is_in("status", vec![json!("active"), json!("pending")])));
        assert!(!matches(&r, &Filter::is_in("status", vec![json!("closed")])));

        let both = Filter::And(vec![Filter::eq("status", "active"), Filter::cmp("age", CmpOp::Gte, 18)]);
        assert!(matches(&r, &both));

        let either = Filter::Or(vec![Filter::eq("status", "closed"), Filter::cmp("age", CmpOp::Gt, 25)]);
        assert!(matches(&r, &either));

        let neither = Filter::Or(vec![Filter::eq("status", "closed"), Filter::cmp("age", CmpOp::Gt, 50)]);
        assert!(!matches(&r, &neither));
    }

    #[test]
    fn test_custom_predicate() {
        let r = record(json!({"tags": ["a", "b"]}));
        let has_tags = Filter::Custom(CustomPredicate::new(|record| {
            record.get("tags").and_then(Value::as_array).is_some_and(|tags| !tags.is_empty())
        }));
        assert!(matches(&r, &has_tags));
        assert!(!has_tags.is_cacheable());
        assert!(has_tags.serialized().is_err());
    }

    #[test]
    fn test_serialized_form_is_stable() {
        let filter = Filter::And(vec![Filter::eq("status", "active"), Filter::cmp("age", CmpOp::Gt, 21)]);
        assert!(filter.is_cacheable());
        let a = filter.serialized().unwrap();
        let b = filter.serialized().unwrap();
        assert_eq!(a, b);

        let round_tripped: Filter = serde_json::from_str(&a).unwrap();
        assert_eq!(round_tripped.serialized().unwrap(), a);
    }

    #[test]
    fn test_sort_multi_field() {
        let mut records = vec![
            record(json!({"dept": "eng", "age": 40})),
            record(json!({"dept": "ops", "age": 25})),
            record(json!({"dept": "eng", "age": 30})),
        ];

        let spec = SortSpec::by("dept", Direction::Asc).then_by("age", Direction::Desc);
        sort_records(&mut records, &spec);

        assert_eq!(records[0].get("age"), Some(&json!(40)));
        assert_eq!(records[1].get("age"), Some(&json!(30)));
        assert_eq!(records[2].get("dept"), Some(&json!("ops")));
    }

    #[test]
    fn test_sort_missing_fields_last() {
        let mut records = vec![record(json!({"id": 1})), record(json!({"id": 2, "rank": 5})), record(json!({"id": 3, "rank": 1}))];

        sort_records(&mut records, &SortSpec::by("rank", Direction::Asc));

        assert_eq!(records[0].get("id"), Some(&json!(3)));
        assert_eq!(records[1].get("id"), Some(&json!(2)));
        assert_eq!(records[2].get("id"), Some(&json!(1)));
    }

    #[test]
    fn test_sort_missing_fields_last_descending() {
        let mut records = vec![record(json!({"id": 1})), record(json!({"id": 2, "rank": 5})), record(json!({"id": 3, "rank": 1}))];

        sort_records(&mut records, &SortSpec::by("rank", Direction::Desc));

        assert_eq!(records[0].get("id"), Some(&json!(2)));
        assert_eq!(records[1].get("id"), Some(&json!(3)));
        assert_eq!(records[2].get("id"), Some(&json!(1)));
    }
}
