//! Type-aware equality and row diffing for change detection.
//!
//! Stored rows and freshly normalized rows meet here. Comparison is
//! deliberately forgiving about representation and strict about meaning:
//! numbers compare within a relative epsilon, strings compare trimmed and
//! case-insensitively, null and missing are the same thing, and structured
//! fields compare after recursive key sorting. Given identical inputs the
//! classification is deterministic.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use robofleet_types::{FieldChange, Row};

/// Relative tolerance for numeric comparison.
const EPSILON: f64 = 1e-6;

/// Compares two field values under the type-aware rules.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(_) | Value::String(_), Value::Number(_) | Value::String(_)) => {
            // Numbers may arrive as strings from one side; compare
            // numerically when both sides coerce, textually otherwise.
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => numbers_equal(x, y),
                _ => match (a.as_str(), b.as_str()) {
                    (Some(x), Some(y)) => strings_equal(x, y),
                    _ => false,
                },
            }
        }
        (Value::Array(_) | Value::Object(_), Value::Array(_) | Value::Object(_)) => {
            canonicalize(a) == canonicalize(b)
        }
        _ => false,
    }
}

/// Diffs a new row against the stored row.
///
/// Only fields present in the new row are considered: the upsert leaves
/// absent columns untouched, so their stored values are not "changes". A
/// null on either side equals an absent field on the other.
pub fn diff_rows(stored: &Row, incoming: &Row) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for (field, new_value) in incoming {
        let old_value = stored.get(field).unwrap_or(&Value::Null);
        if !values_equal(old_value, new_value) {
            changes.push(FieldChange {
                field: field.clone(),
                old: old_value.clone(),
                new: new_value.clone(),
            });
        }
    }
    changes
}

fn numbers_equal(x: f64, y: f64) -> bool {
    let scale = 1.0_f64.max(x.abs()).max(y.abs());
    (x - y).abs() <= EPSILON * scale
}

fn strings_equal(x: &str, y: &str) -> bool {
    x.trim().eq_ignore_ascii_case(y.trim())
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Rebuilds a JSON value with every object's keys sorted, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), canonicalize(v))).collect();
            Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
