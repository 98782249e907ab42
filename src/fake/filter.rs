//! Condition evaluation over JSON values.
//!
//! Numbers compare numerically regardless of representation, RFC 3339 strings compare by the
//! instant they denote, other strings compare lexicographically. Values of different kinds are
//! never ordered against each other, so range conditions across kinds are false.

use crate::traits::{Condition, Filter, SortOrder};
use chrono::DateTime;
use ordered_float::OrderedFloat;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Comparable<'a> {
    Bool(bool),
    Number(OrderedFloat<f64>),
    Instant(i64, u32),
    Text(&'a str),
}

impl Comparable<'_> {
    const fn rank(&self) -> u8 {
        match self {
            Self::Bool(_) => 1,
            Self::Number(_) => 2,
            Self::Instant(..) => 3,
            Self::Text(_) => 4,
        }
    }
}

fn comparable(value: &Value) -> Option<Comparable<'_>> {
    match value {
        Value::Bool(b) => Some(Comparable::Bool(*b)),
        Value::Number(n) => n.as_f64().map(|f| Comparable::Number(OrderedFloat(f))),
        Value::String(s) => Some(match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => Comparable::Instant(ts.timestamp(), ts.timestamp_subsec_nanos()),
            Err(_) => Comparable::Text(s),
        }),
        _ => None,
    }
}

/// Order two scalars of the same kind. `None` when they cannot be compared.
pub(crate) fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    let (a, b) = (comparable(a)?, comparable(b)?);
    (a.rank() == b.rank()).then(|| a.cmp(&b))
}

pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    compare(a, b).map_or_else(|| a == b, Ordering::is_eq)
}

/// Resolve a dotted path. Numeric segments index into arrays.
pub(crate) fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub(crate) fn condition_holds(field: Option<&Value>, condition: &Condition) -> bool {
    let Some(field) = field else {
        return matches!(condition, Condition::Exists(false));
    };
    match condition {
        Condition::Exists(expected) => *expected,
        Condition::Eq(v) => values_equal(field, v),
        Condition::Ne(v) => !values_equal(field, v),
        Condition::Gt(v) => compare(field, v) == Some(Ordering::Greater),
        Condition::Gte(v) => compare(field, v).is_some_and(Ordering::is_ge),
        Condition::Lt(v) => compare(field, v) == Some(Ordering::Less),
        Condition::Lte(v) => compare(field, v).is_some_and(Ordering::is_le),
        Condition::In(list) => list.iter().any(|v| values_equal(field, v)),
        Condition::Nin(list) => !list.iter().any(|v| values_equal(field, v)),
    }
}

/// Evaluate every clause against `document`, clauses on `indexed` fields first.
pub(crate) fn matches(filter: &Filter, document: &Value, indexed: &[String]) -> bool {
    let (first, rest): (Vec<_>, Vec<_>) = filter
        .clauses
        .iter()
        .partition(|(path, _)| indexed.contains(path));
    first
        .into_iter()
        .chain(rest)
        .all(|(path, condition)| condition_holds(lookup(document, path), condition))
}

/// Total order used for sorting: comparable values by value, otherwise by kind, absent last.
pub(crate) fn sort_order(a: Option<&Value>, b: Option<&Value>, order: SortOrder) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => {
            let ordering = compare(x, y).unwrap_or_else(|| kind_rank(x).cmp(&kind_rank(y)));
            match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Array(_) => 5,
        Value::Object(_) => 6,
        other => comparable(other).map_or(0, |c| c.rank()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_fields_only_satisfy_exists_false() {
        let doc = json!({ "name": "Ada" });
        for condition in [
            Condition::Eq(json!(1)),
            Condition::Ne(json!(1)),
            Condition::Gt(json!(30)),
            Condition::Lte(json!(30)),
            Condition::In(vec![json!(1)]),
            Condition::Nin(vec![json!(1)]),
            Condition::Exists(true),
        ] {
            assert!(!condition_holds(lookup(&doc, "age"), &condition), "{condition:?}");
        }
        assert!(condition_holds(lookup(&doc, "age"), &Condition::Exists(false)));
    }

    #[test]
    fn numbers_compare_across_representations() {
        assert!(values_equal(&json!(2), &json!(2.0)));
        assert_eq!(compare(&json!(3), &json!(2.5)), Some(Ordering::Greater));
    }

    #[test]
    fn timestamps_compare_by_instant() {
        let utc = json!("2024-03-01T10:00:00Z");
        let offset = json!("2024-03-01T12:00:00+02:00");
        assert!(values_equal(&utc, &offset));
        assert_eq!(
            compare(&json!("2024-03-01T09:59:59Z"), &offset),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn different_kinds_never_compare() {
        assert_eq!(compare(&json!(5), &json!("5")), None);
        assert_eq!(compare(&json!("2024-03-01T10:00:00Z"), &json!("abc")), None);
        assert!(!condition_holds(Some(&json!("10")), &Condition::Gt(json!(5))));
        assert!(!condition_holds(Some(&json!("10")), &Condition::Lt(json!(5))));
    }

    #[test]
    fn nested_paths_and_indexes() {
        let doc = json!({ "address": { "city": "Paris" }, "tags": ["a", "b"] });
        assert_eq!(lookup(&doc, "address.city"), Some(&json!("Paris")));
        assert_eq!(lookup(&doc, "tags.1"), Some(&json!("b")));
        assert_eq!(lookup(&doc, "address.zip"), None);
    }

    #[test]
    fn filter_from_json() {
        let filter = Filter::from_json(&json!({ "age": { "$gte": 18, "$lt": 65 }, "role": "admin" }))
            .unwrap();
        assert_eq!(filter.clauses.len(), 3);
        assert!(matches(&filter, &json!({ "age": 30, "role": "admin" }), &[]));
        assert!(!matches(&filter, &json!({ "age": 70, "role": "admin" }), &[]));
        assert!(Filter::from_json(&json!({ "age": { "$regex": "x" } })).is_err());
        assert!(Filter::from_json(&json!([1, 2])).is_err());
    }

    #[test]
    fn literal_objects_are_equality() {
        let filter = Filter::from_json(&json!({ "address": { "city": "Paris" } })).unwrap();
        assert!(matches(&filter, &json!({ "address": { "city": "Paris" } }), &[]));
    }

    #[test]
    fn sorting_puts_absent_last() {
        let (one, two) = (json!(1), json!(2));
        assert_eq!(sort_order(Some(&one), Some(&two), SortOrder::Descending), Ordering::Greater);
        assert_eq!(sort_order(None, Some(&two), SortOrder::Descending), Ordering::Greater);
        assert_eq!(sort_order(Some(&one), None, SortOrder::Ascending), Ordering::Less);
    }
}
