//! Per-operator scratch key/value state.
//!
//! `spec.md` §3/§4.2.2/§4.2.4: Join and Take keep ordered scratch state —
//! a child-correlation-tuple → count index for Join, a boundary-ordered
//! window for Take — backed by ordered scans over a byte-string key
//! space. This engine runs in-process, so `Storage` is a plain ordered
//! map rather than the teacher's on-disk change-buffer tables; the
//! contract (`get`/`put`/`del`/`scan({prefix})`) is the same shape the
//! teacher's `DiffContext` scans present to its operators, just backed by
//! memory instead of a Postgres relation.

use std::collections::BTreeMap;

/// An entry returned by `Storage::scan`, in key order.
pub type ScanEntry<'a> = (&'a str, &'a str);

/// Ordered key/value scratch space owned by one operator instance.
/// Keys sort byte-lexicographically, so callers that want "ordering
/// key" semantics must encode keys so that lexicographic order matches
/// the desired row order (see `row::RowKey::encode`).
pub trait Storage {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&mut self, key: &str, value: &str);
    fn del(&mut self, key: &str);
    /// All entries whose key starts with `prefix`, in key order.
    fn scan(&self, prefix: &str) -> Vec<(String, String)>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The only `Storage` implementation this engine needs: an in-process
/// `BTreeMap`, which gives ordered scans for free. A server-backed
/// deployment could swap in a KV-store-backed implementation behind the
/// same trait without touching the operators that use it.
#[derive(Debug, Default, Clone)]
pub struct MemStorage {
    entries: BTreeMap<String, String>,
}

impl MemStorage {
    pub fn new() -> Self {
        MemStorage::default()
    }
}

impl Storage for MemStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    fn del(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn scan(&self, prefix: &str) -> Vec<(String, String)> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
