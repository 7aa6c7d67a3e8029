//! Shared machinery for `Join` and `Exists`: the child-correlation index.
//!
//! `spec.md` §4.2.2: "the join keeps an index from child-correlation-
//! tuple → count of referring parents; it uses `Storage.scan({prefix})`
//! to enumerate parents for a child push." `Exists` (§4.2.3) needs the
//! same shape — a way to go from "this child row changed" to "these
//! parent rows are affected" — so both operators share this index rather
//! than each maintaining their own.

use crate::ast::Correlation;
use crate::row::Row;
use crate::storage::Storage;
use crate::value::Value;

/// Encode a correlation key's field tuple (taken from either side of a
/// `Correlation`) into the byte-ordered string `Storage` keys on.
pub fn encode_key_tuple(fields: &[String], row: &Row) -> String {
    fields
        .iter()
        .map(|f| {
            row.get(f)
                .cloned()
                .unwrap_or(Value::Null)
                .as_compare_str()
                .replace('\u{1}', "\u{1}\u{1}")
        })
        .collect::<Vec<_>>()
        .join("\u{1}\u{0}")
}

/// Maps a child-correlation-tuple to the set of parent primary keys
/// currently referring to it, so a child push can be translated into
/// "which parent rows does this affect" without rescanning every parent.
/// Backed by whatever `Storage` the pipeline builder's delegate hands the
/// operator (`createStorage`), not hardcoded to `MemStorage`.
pub struct CorrelationIndex {
    storage: Box<dyn Storage>,
}

impl CorrelationIndex {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        CorrelationIndex { storage }
    }

    fn index_key(child_key: &str, parent_pk_encoded: &str) -> String {
        format!("{child_key}\u{1}{parent_pk_encoded}")
    }

    /// Register that `parent_pk_encoded` currently joins to `child_key`
    /// (the encoded child-correlation-field tuple for one parent row).
    pub fn add(&mut self, child_key: &str, parent_pk_encoded: &str) {
        self.storage.put(&Self::index_key(child_key, parent_pk_encoded), "1");
    }

    pub fn remove(&mut self, child_key: &str, parent_pk_encoded: &str) {
        self.storage.del(&Self::index_key(child_key, parent_pk_encoded));
    }

    /// All parent PKs (encoded) currently registered against `child_key`.
    pub fn parents_for_child(&self, child_key: &str) -> Vec<String> {
        let prefix = format!("{child_key}\u{1}");
        self.storage
            .scan(&prefix)
            .into_iter()
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }
}

/// Extract the encoded correlation key from a row on the parent side of
/// `correlation`.
pub fn parent_key(correlation: &Correlation, row: &Row) -> String {
    encode_key_tuple(&correlation.parent_field, row)
}

/// Extract the encoded correlation key from a row on the child side.
pub fn child_key(correlation: &Correlation, row: &Row) -> String {
    encode_key_tuple(&correlation.child_field, row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    #[test]
    fn test_add_then_parents_for_child_round_trips() {
        let mut idx = CorrelationIndex::new(Box::new(MemStorage::new()));
        idx.add("c1", "p1");
        idx.add("c1", "p2");
        idx.add("c2", "p3");
        let mut parents = idx.parents_for_child("c1");
        parents.sort();
        assert_eq!(parents, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn test_remove_drops_only_that_pair() {
        let mut idx = CorrelationIndex::new(Box::new(MemStorage::new()));
        idx.add("c1", "p1");
        idx.add("c1", "p2");
        idx.remove("c1", "p1");
        assert_eq!(idx.parents_for_child("c1"), vec!["p2".to_string()]);
    }

    #[test]
    fn test_correlation_key_encoding_matches_on_both_sides() {
        let correlation = Correlation {
            parent_field: vec!["id".into()],
            child_field: vec!["issue_id".into()],
        };
        let mut parent_row = Row::new();
        parent_row.insert("id".into(), Value::Number(7.0));
        let mut child_row = Row::new();
        child_row.insert("issue_id".into(), Value::Number(7.0));
        assert_eq!(parent_key(&correlation, &parent_row), child_key(&correlation, &child_row));
    }
}
