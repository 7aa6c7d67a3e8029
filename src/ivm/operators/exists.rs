//! Exists operator: `spec.md` §4.2.3.
//!
//! Wraps a correlated subquery as a boolean filter (`EXISTS`/`NOT
//! EXISTS`). Maintains a counter per parent row (# matching children) and
//! emits a synthesized `add`/`remove` on the parent when that counter
//! crosses the `0 ↔ ≥1` boundary in response to a child change. The
//! counter is seeded lazily, on first reference to a parent row, via a
//! pull-based child count supplied by whatever wired this Exists to its
//! child connector (usually `crate::ivm::builder` using
//! `join_common::CorrelationIndex` to route child pushes here).

use crate::change::{Change, Node};
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::{PrimaryKey, Row};
use crate::storage::Storage;
use crate::stream::Stream;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct ExistsInner {
    parent_input: Box<dyn Input>,
    negate: bool,
    pk: PrimaryKey,
    initial_count: Box<dyn Fn(&Row) -> u32>,
    counts: RefCell<Box<dyn Storage>>,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

pub struct Exists(Rc<ExistsInner>);

impl Exists {
    /// `initial_count` pulls the current matching-children count for a
    /// parent row the first time Exists needs it (on a `fetch` or the
    /// first push affecting that row); afterwards the counter is
    /// maintained incrementally via `on_child_push`.
    pub fn new(
        parent_input: Box<dyn Input>,
        pk: PrimaryKey,
        negate: bool,
        initial_count: Box<dyn Fn(&Row) -> u32>,
        storage: Box<dyn Storage>,
    ) -> Exists {
        let inner = Rc::new(ExistsInner {
            parent_input,
            negate,
            pk,
            initial_count,
            counts: RefCell::new(storage),
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        });
        let weak = Rc::downgrade(&inner);
        inner.parent_input.set_output(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                Exists::handle_parent_push(&inner, change);
            }
        }));
        Exists(inner)
    }

    fn count_for(inner: &ExistsInner, row: &Row) -> u32 {
        let key = inner.pk.extract(row).encode();
        if let Some(v) = inner.counts.borrow().get(&key) {
            return v.parse().unwrap_or(0);
        }
        let n = (inner.initial_count)(row);
        inner.counts.borrow_mut().put(&key, &n.to_string());
        n
    }

    fn matches(inner: &ExistsInner, row: &Row) -> bool {
        let count = Exists::count_for(inner, row);
        if inner.negate { count == 0 } else { count > 0 }
    }

    /// Called by the join wiring when a child push affects `parent_row`'s
    /// matching-children count by `delta` (`+1` for a newly matching
    /// child, `-1` for one that stopped matching). Emits a synthesized
    /// `add`/`remove` on the parent iff the boolean verdict flips.
    pub fn on_child_push(&self, parent_row: &Row, delta: i32) {
        let inner = &self.0;
        if inner.destroyed.get() {
            return;
        }
        let key = inner.pk.extract(parent_row).encode();
        let before = Exists::count_for(inner, parent_row);
        let after = (before as i32 + delta).max(0) as u32;
        inner.counts.borrow_mut().put(&key, &after.to_string());

        let was_matching = if inner.negate { before == 0 } else { before > 0 };
        let now_matching = if inner.negate { after == 0 } else { after > 0 };
        if was_matching != now_matching {
            let mut out = inner.output.borrow_mut();
            if let Some(out) = out.as_mut() {
                let node = Node::new(parent_row.clone());
                if now_matching {
                    out(Change::Add { node });
                } else {
                    out(Change::Remove { node });
                }
            }
        }
    }

    fn handle_parent_push(inner: &Rc<ExistsInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        let _span = crate::observability::operator_span("exists", &inner.parent_input.get_schema().table).entered();
        let mut out = inner.output.borrow_mut();
        let Some(out) = out.as_mut() else { return };
        match change {
            Change::Add { node } => {
                if Exists::matches(inner, &node.row) {
                    out(Change::Add { node });
                }
            }
            Change::Remove { node } => {
                if Exists::matches(inner, &node.row) {
                    out(Change::Remove { node });
                }
            }
            Change::Edit { node, old_node } => {
                // Relationship subtree is unchanged across an edit
                // (spec.md invariant), so the matching-children count
                // for this parent PK doesn't move; only the filter's
                // own relevance to the new row values could, and Exists'
                // predicate never inspects non-PK row columns.
                if Exists::matches(inner, &node.row) {
                    out(Change::Edit { node, old_node });
                } else {
                    out(Change::Remove { node: old_node });
                }
            }
            Change::Child { node, child } => {
                if Exists::matches(inner, &node.row) {
                    out(Change::Child { node, child });
                }
            }
        }
    }
}

impl Input for Exists {
    fn get_schema(&self) -> crate::source::SourceSchema {
        self.0.parent_input.get_schema()
    }

    fn fully_applied_filters(&self) -> bool {
        true
    }

    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        *self.0.output.borrow_mut() = Some(output);
    }

    fn fetch(&self) -> Result<Stream<Node>, ZeroError> {
        if self.0.destroyed.get() {
            return Err(ZeroError::UseAfterDestroy);
        }
        let _span = crate::observability::operator_span("exists", &self.0.parent_input.get_schema().table).entered();
        let nodes: Vec<Node> = self
            .0
            .parent_input
            .fetch()?
            .drain()
            .into_iter()
            .filter(|n| Exists::matches(&self.0, &n.row))
            .collect();
        Ok(Stream::new(nodes.into_iter()))
    }

    fn cleanup(&self) -> Result<Stream<Node>, ZeroError> {
        self.0.parent_input.cleanup()
    }

    fn destroy(&self) {
        self.0.destroyed.set(true);
        *self.0.output.borrow_mut() = None;
        self.0.parent_input.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{Source, SourceChange, SourceSchema};
    use crate::storage::MemStorage;
    use crate::value::Value;
    use std::collections::BTreeMap;

    fn schema() -> SourceSchema {
        SourceSchema {
            table: "issue".into(),
            columns: vec!["id".into()],
            primary_key: PrimaryKey::new(vec!["id".into()]),
        }
    }

    fn row(id: i64) -> Row {
        let mut r = BTreeMap::new();
        r.insert("id".into(), Value::Number(id as f64));
        r
    }

    #[test]
    fn test_exists_filters_out_parents_with_zero_children_initially() {
        let src = Source::new(schema());
        src.push(SourceChange::Add { row: row(1) }).unwrap();
        src.push(SourceChange::Add { row: row(2) }).unwrap();
        let input = src.connect(crate::row::Ordering::empty(), None, vec![], true);
        let exists = Exists::new(
            Box::new(input),
            PrimaryKey::new(vec!["id".into()]),
            false,
            Box::new(|r: &Row| if r.get("id").unwrap().as_f64() == Some(1.0) { 1 } else { 0 }),
            Box::new(MemStorage::new()),
        );
        let rows: Vec<_> = exists.fetch().unwrap().drain();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].row.get("id").unwrap().as_f64(), Some(1.0));
    }

    #[test]
    fn test_on_child_push_emits_add_when_crossing_zero_to_one() {
        let src = Source::new(schema());
        src.push(SourceChange::Add { row: row(1) }).unwrap();
        let input = src.connect(crate::row::Ordering::empty(), None, vec![], true);
        let exists = Exists::new(
            Box::new(input),
            PrimaryKey::new(vec!["id".into()]),
            false,
            Box::new(|_: &Row| 0),
            Box::new(MemStorage::new()),
        );
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = seen.clone();
        exists.set_output(Box::new(move |c| {
            seen2.borrow_mut().push(matches!(c, Change::Add { .. }));
        }));
        exists.on_child_push(&row(1), 1);
        assert_eq!(*seen.borrow(), vec![true]);
    }

    #[test]
    fn test_not_exists_inverts_the_boundary() {
        let src = Source::new(schema());
        src.push(SourceChange::Add { row: row(1) }).unwrap();
        let input = src.connect(crate::row::Ordering::empty(), None, vec![], true);
        let exists = Exists::new(
            Box::new(input),
            PrimaryKey::new(vec!["id".into()]),
            true,
            Box::new(|_: &Row| 0),
            Box::new(MemStorage::new()),
        );
        let rows: Vec<_> = exists.fetch().unwrap().drain();
        assert_eq!(rows.len(), 1, "NOT EXISTS keeps parents with zero children");
    }
}
