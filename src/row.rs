//! Row, primary key, and ordering types.
//!
//! `spec.md` §3: a `Row` is an unordered mapping from column name to
//! `Value`; its identity is its primary-key tuple. A `PrimaryKey` is a
//! non-empty ordered sequence of column names, and a source may never
//! contain two rows equal under it (Testable Property 1, §8).

use crate::value::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;

/// An unordered mapping from column name to value. Backed by a `BTreeMap`
/// so iteration order is deterministic (useful for hashing and for tests),
/// even though `spec.md` calls the mapping itself unordered.
pub type Row = BTreeMap<String, Value>;

/// A non-empty ordered sequence of column names identifying a row within
/// its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKey(Vec<String>);

impl PrimaryKey {
    pub fn new(columns: Vec<String>) -> Self {
        assert!(!columns.is_empty(), "primary key must be non-empty");
        PrimaryKey(columns)
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    /// Extract this key's tuple of values out of a row, in key-column
    /// order. Missing columns are treated as `Value::Null`.
    pub fn extract(&self, row: &Row) -> RowKey {
        RowKey(
            self.0
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }
}

/// A concrete, comparable primary-key value extracted from a row. Total,
/// hashable where the underlying values permit it (via a stable string
/// encoding), so it can key a `BTreeMap`/`HashMap` of Storage entries.
#[derive(Debug, Clone, PartialEq)]
pub struct RowKey(Vec<Value>);

impl RowKey {
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// A stable, order-preserving string encoding used as a Storage key
    /// and as a `HashMap`/`BTreeMap` key substitute (values aren't `Hash`
    /// because `f64` isn't, so we key by this string form instead).
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|v| v.as_compare_str().replace('\u{1}', "\u{1}\u{1}"))
            .collect::<Vec<_>>()
            .join("\u{1}\u{0}")
    }
}

impl Eq for RowKey {}

impl std::hash::Hash for RowKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.encode().hash(state);
    }
}

impl Ord for RowKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a.total_compare(b))
            .find(|o| *o != CmpOrdering::Equal)
            .unwrap_or(CmpOrdering::Equal)
    }
}

impl PartialOrd for RowKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Sort direction for one `Ordering` component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SortDir {
    Asc,
    Desc,
}

/// An ordered sequence of `(column, direction)` pairs. `spec.md` §3: ties
/// are always broken by appending the primary key ascending, making the
/// effective comparator total.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Ordering(pub Vec<(String, SortDir)>);

impl Ordering {
    pub fn new(components: Vec<(String, SortDir)>) -> Self {
        Ordering(components)
    }

    pub fn empty() -> Self {
        Ordering(Vec::new())
    }

    /// The effective, total comparator: this ordering's components, then
    /// the primary key ascending as a tiebreak.
    pub fn compare_rows(&self, pk: &PrimaryKey, a: &Row, b: &Row) -> CmpOrdering {
        for (col, dir) in &self.0 {
            let av = a.get(col).cloned().unwrap_or(Value::Null);
            let bv = b.get(col).cloned().unwrap_or(Value::Null);
            let cmp = av.total_compare(&bv);
            if cmp != CmpOrdering::Equal {
                return if *dir == SortDir::Desc { cmp.reverse() } else { cmp };
            }
        }
        pk.extract(a).cmp(&pk.extract(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_primary_key_extract_missing_column_is_null() {
        let pk = PrimaryKey::new(vec!["id".into()]);
        let r = row(&[("name", Value::String("a".into()))]);
        assert_eq!(pk.extract(&r).values(), &[Value::Null]);
    }

    #[test]
    fn test_row_key_ordering_is_total_and_consistent() {
        let pk = PrimaryKey::new(vec!["id".into()]);
        let r1 = row(&[("id", Value::Number(1.0))]);
        let r2 = row(&[("id", Value::Number(2.0))]);
        assert_eq!(
            pk.extract(&r1).cmp(&pk.extract(&r2)),
            CmpOrdering::Less
        );
    }

    #[test]
    fn test_ordering_ties_break_by_pk_ascending() {
        let pk = PrimaryKey::new(vec!["id".into()]);
        let ord = Ordering::empty();
        let r1 = row(&[("id", Value::Number(2.0))]);
        let r2 = row(&[("id", Value::Number(1.0))]);
        assert_eq!(ord.compare_rows(&pk, &r1, &r2), CmpOrdering::Greater);
    }

    #[test]
    fn test_ordering_desc_reverses_component_but_not_pk_tiebreak() {
        let pk = PrimaryKey::new(vec!["id".into()]);
        let ord = Ordering::new(vec![("title".into(), SortDir::Desc)]);
        let r1 = row(&[("title", Value::String("a".into())), ("id", Value::Number(1.0))]);
        let r2 = row(&[("title", Value::String("b".into())), ("id", Value::Number(2.0))]);
        // "a" < "b" but desc reverses => r1 > r2
        assert_eq!(ord.compare_rows(&pk, &r1, &r2), CmpOrdering::Greater);
    }

    #[test]
    fn test_row_key_encode_distinguishes_composite_keys() {
        let pk = PrimaryKey::new(vec!["a".into(), "b".into()]);
        let r1 = row(&[("a", Value::String("x".into())), ("b", Value::String("yz".into()))]);
        let r2 = row(&[("a", Value::String("xy".into())), ("b", Value::String("z".into()))]);
        assert_ne!(pk.extract(&r1).encode(), pk.extract(&r2).encode());
    }
}
