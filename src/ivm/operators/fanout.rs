//! Fan-out/Fan-in: the alternate `or` realization described in
//! `spec.md` §4.2.1.
//!
//! For a top-level `or` with more than one disjunct, the builder may wire
//! a `FanOut` that feeds the same upstream `Change` to one `Filter` per
//! disjunct (each compiled from that branch's condition), followed by a
//! `FanIn` that deduplicates so a row satisfying multiple branches is
//! still emitted exactly once. `FanIn` tracks, per row, how many branches
//! currently consider it a match — the same 0-↔-≥1 counting technique
//! `Exists` uses — and only emits a synthesized `add`/`remove` when that
//! count crosses the boundary.
//!
//! `crate::ivm::operators::filter::Filter`'s own `evaluate` already
//! handles nested `Or` directly as boolean composition with no
//! duplication risk (it computes one boolean per row in a single pass),
//! so this operator is reserved for the specific case the builder chooses
//! it for — a standalone top-level `or` — rather than used for every `Or`
//! condition in a tree.

use crate::change::{Change, Node};
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::{PrimaryKey, RowKey};
use crate::storage::Storage;
use crate::stream::Stream;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct FanInInner {
    branch_count: usize,
    pk: PrimaryKey,
    /// `RowKey::encode() -> count of branches currently matching it`.
    counts: RefCell<Box<dyn Storage>>,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

/// Merges `branch_count` independent `Change` streams (one per `or`
/// disjunct) into one, deduplicated by primary key.
pub struct FanIn(Rc<FanInInner>);

impl FanIn {
    pub fn new(branch_count: usize, pk: PrimaryKey, storage: Box<dyn Storage>) -> FanIn {
        FanIn(Rc::new(FanInInner {
            branch_count,
            pk,
            counts: RefCell::new(storage),
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        }))
    }

    /// A closure a `FanOut` branch's `Filter` can be pointed at as its
    /// output, tagged with which branch it is.
    pub fn branch_sink(&self) -> Box<dyn FnMut(Change)> {
        let inner = self.0.clone();
        Box::new(move |change| FanIn::handle_branch_push(&inner, change))
    }

    fn key(inner: &FanInInner, node: &Node) -> String {
        inner.pk.extract(&node.row).encode()
    }

    fn count(inner: &FanInInner, key: &str) -> u32 {
        inner
            .counts
            .borrow()
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn set_count(inner: &FanInInner, key: &str, n: u32) {
        if n == 0 {
            inner.counts.borrow_mut().del(key);
        } else {
            inner.counts.borrow_mut().put(key, &n.to_string());
        }
    }

    fn handle_branch_push(inner: &Rc<FanInInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        match change {
            Change::Add { node } => {
                let key = FanIn::key(inner, &node);
                let before = FanIn::count(inner, &key);
                FanIn::set_count(inner, &key, before + 1);
                if before == 0 {
                    if let Some(out) = inner.output.borrow_mut().as_mut() {
                        out(Change::Add { node });
                    }
                }
            }
            Change::Remove { node } => {
                let key = FanIn::key(inner, &node);
                let before = FanIn::count(inner, &key);
                let after = before.saturating_sub(1);
                FanIn::set_count(inner, &key, after);
                if before > 0 && after == 0 {
                    if let Some(out) = inner.output.borrow_mut().as_mut() {
                        out(Change::Remove { node });
                    }
                }
            }
            // A row matched by >=1 branch both before and after an edit
            // (the common case) just passes the edit through once; an
            // edit is only delivered by a branch whose Filter still
            // considers the row a match post-edit, so no count bookkeeping
            // is needed beyond what `Add`/`Remove` already do for the
            // branches that flip.
            Change::Edit { node, old_node } => {
                if let Some(out) = inner.output.borrow_mut().as_mut() {
                    out(Change::Edit { node, old_node });
                }
            }
            Change::Child { node, child } => {
                if let Some(out) = inner.output.borrow_mut().as_mut() {
                    out(Change::Child { node, child });
                }
            }
        }
    }
}

impl Input for FanIn {
    fn get_schema(&self) -> crate::source::SourceSchema {
        unreachable!("FanIn has no single upstream; callers use FanOut's schema")
    }

    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        *self.0.output.borrow_mut() = Some(output);
    }

    fn fetch(&self) -> Result<Stream<Node>, ZeroError> {
        Ok(Stream::empty())
    }

    fn cleanup(&self) -> Result<Stream<Node>, ZeroError> {
        Ok(Stream::empty())
    }

    fn destroy(&self) {
        self.0.destroyed.set(true);
        *self.0.output.borrow_mut() = None;
    }
}

/// Registers each disjunct's `Filter` output against a shared `FanIn`,
/// and exposes the merged, deduplicated fetch by unioning every branch's
/// initial fetch through the same counting logic `FanIn` uses for pushes.
pub struct FanOut {
    branches: Vec<Box<dyn Input>>,
    fan_in: FanIn,
}

impl FanOut {
    pub fn new(branches: Vec<Box<dyn Input>>, pk: PrimaryKey, storage: Box<dyn Storage>) -> FanOut {
        let fan_in = FanIn::new(branches.len(), pk, storage);
        for branch in &branches {
            branch.set_output(fan_in.branch_sink());
        }
        FanOut { branches, fan_in }
    }

    pub fn fan_in(&self) -> &FanIn {
        &self.fan_in
    }

    /// The union of every branch's current fetch, deduplicated by PK.
    pub fn fetch_union(&self) -> Result<Vec<Node>, ZeroError> {
        let mut seen: std::collections::HashSet<RowKey> = std::collections::HashSet::new();
        let mut out = Vec::new();
        for branch in &self.branches {
            for node in branch.fetch()?.drain() {
                let key = self.fan_in.0.pk.extract(&node.row);
                if seen.insert(key) {
                    out.push(node);
                }
            }
        }
        Ok(out)
    }

    pub fn destroy(&self) {
        for branch in &self.branches {
            branch.destroy();
        }
        self.fan_in.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivm::operators::filter::{compile, Filter};
    use crate::source::{Source, SourceSchema};
    use crate::storage::MemStorage;
    use crate::value::Value;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    fn schema() -> SourceSchema {
        SourceSchema {
            table: "issue".into(),
            columns: vec!["id".into(), "a".into(), "b".into()],
            primary_key: PrimaryKey::new(vec!["id".into()]),
        }
    }

    fn row(id: i64, a: i64, b: i64) -> crate::row::Row {
        let mut r = BTreeMap::new();
        r.insert("id".into(), Value::Number(id as f64));
        r.insert("a".into(), Value::Number(a as f64));
        r.insert("b".into(), Value::Number(b as f64));
        r
    }

    fn eq_cond(col: &str, v: f64) -> crate::ast::Condition {
        crate::ast::Condition::Simple {
            op: crate::ast::SimpleOp::Eq,
            left: crate::ast::Operand::Column { name: col.into() },
            right: crate::ast::Operand::Literal { value: Value::Number(v) },
        }
    }

    #[test]
    fn test_fan_in_emits_add_once_for_row_matching_two_branches() {
        let src = Source::new(schema());
        src.push(crate::source::SourceChange::Add { row: row(1, 1, 1) }).unwrap();

        let input_a = src.connect(crate::row::Ordering::empty(), None, vec![], false);
        let input_b = src.connect(crate::row::Ordering::empty(), None, vec![], false);
        let branch_a = Filter::new(
            Box::new(input_a),
            compile(&eq_cond("a", 1.0), &|_, _| None),
            Rc::new(|_, _| false),
        );
        let branch_b = Filter::new(
            Box::new(input_b),
            compile(&eq_cond("b", 1.0), &|_, _| None),
            Rc::new(|_, _| false),
        );
        let fan_out = FanOut::new(
            vec![Box::new(branch_a), Box::new(branch_b)],
            PrimaryKey::new(vec!["id".into()]),
            Box::new(MemStorage::new()),
        );

        let received = Rc::new(RefCell::new(Vec::new()));
        let received2 = received.clone();
        fan_out.fan_in().set_output(Box::new(move |c| {
            received2.borrow_mut().push(matches!(c, Change::Add { .. }));
        }));

        src.push(crate::source::SourceChange::Add { row: row(2, 1, 1) }).unwrap();
        assert_eq!(received.borrow().len(), 1, "deduped to a single Add");
    }

    #[test]
    fn test_fetch_union_dedupes_by_pk() {
        let src = Source::new(schema());
        src.push(crate::source::SourceChange::Add { row: row(1, 1, 1) }).unwrap();
        let input_a = src.connect(crate::row::Ordering::empty(), None, vec![], false);
        let input_b = src.connect(crate::row::Ordering::empty(), None, vec![], false);
        let branch_a = Filter::new(
            Box::new(input_a),
            compile(&eq_cond("a", 1.0), &|_, _| None),
            Rc::new(|_, _| false),
        );
        let branch_b = Filter::new(
            Box::new(input_b),
            compile(&eq_cond("b", 1.0), &|_, _| None),
            Rc::new(|_, _| false),
        );
        let fan_out = FanOut::new(
            vec![Box::new(branch_a), Box::new(branch_b)],
            PrimaryKey::new(vec!["id".into()]),
            Box::new(MemStorage::new()),
        );
        assert_eq!(fan_out.fetch_union().unwrap().len(), 1);
    }
}
