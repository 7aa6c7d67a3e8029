//! The `Value` type and its comparators.
//!
//! `spec.md` §3: a `Value` is one of string, finite IEEE-754 double,
//! boolean, null, or a nested JSON value. `undefined` is treated as `null`
//! at storage boundaries — this engine has no `undefined` at all, so
//! anything that would produce one (a missing column lookup) is mapped to
//! `Value::Null` at the call site instead of being representable here.

use serde_json::Value as Json;
use std::cmp::Ordering as CmpOrdering;

/// A single cell value in a row.
///
/// Numeric comparison is IEEE-754; string comparison is Unicode
/// code-point lexicographic (`str`'s own `Ord`, which compares UTF-8 bytes
/// — equivalent to code-point order for valid UTF-8).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Json(Json),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// SQL three-valued comparison ordering used by `Filter`'s `simple`
    /// operators other than `IS`/`IS NOT`: returns `None` if either side is
    /// null (comparison is "unknown"), matching `spec.md` §4.2.1.
    pub fn partial_compare(&self, other: &Value) -> Option<CmpOrdering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) => {
                // JSON values have no total order; equality is the only
                // comparison `spec.md` defines for them (via `=`/`!=`).
                if a == b {
                    Some(CmpOrdering::Equal)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// `IS`/`IS NOT` null-aware equality: unlike `partial_compare`, `null`
    /// participates and compares equal only to `null`.
    pub fn is_equal(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            _ => self.partial_compare(other) == Some(CmpOrdering::Equal),
        }
    }

    /// Total order used by `compareRows`: nulls sort first, then by type
    /// group, then by value. This is never exposed to `where` predicates —
    /// only used internally to give every `Ordering` a total comparator
    /// (`spec.md` §3 invariant: "the effective comparator is total").
    pub fn total_compare(&self, other: &Value) -> CmpOrdering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Number(_) => 2,
                Value::String(_) => 3,
                Value::Json(_) => 4,
            }
        }
        match (self, other) {
            (Value::Null, Value::Null) => CmpOrdering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => {
                a.partial_cmp(b).unwrap_or(CmpOrdering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.as_str().cmp(b.as_str()),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            _ => rank(self).cmp(&rank(other)),
        }
    }

    /// Canonical string form used for hashing and for `LIKE` matching
    /// against non-string operands.
    pub fn as_compare_str(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::Json(j) => j.to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}
