//! `Source`: the root of every pipeline.
//!
//! `spec.md` §4.1: a Source owns a per-table ordered collection of rows
//! and multicasts pushed changes to every registered connector, each with
//! its own ordering, optional predicate, and `splitEditKeys`. Grounded on
//! the teacher's change-buffer scan model (`dvm/operators/scan.rs`) but
//! in-process: instead of reading a Postgres change-buffer table, pushes
//! arrive directly as `SourceChange` and are fanned out synchronously to
//! connectors in registration order, matching the single-threaded
//! cooperative model of `spec.md` §5.

use crate::change::{Change, Node};
use crate::error::ZeroError;
use crate::row::{Ordering, PrimaryKey, Row, RowKey};
use crate::stream::Stream;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A boolean row predicate a connector filters its fetch/push traffic
/// through. Built by the pipeline builder from a `Condition` tree that
/// contains no `correlatedSubquery` (those require a Join, not a Source
/// connector); see `crate::ivm::operators::filter::compile_condition`.
pub type Predicate = Rc<dyn Fn(&Row) -> bool>;

/// Table-level metadata carried alongside every Input/Operator in the
/// pipeline, per `spec.md` §3 `SourceSchema`.
#[derive(Debug, Clone)]
pub struct SourceSchema {
    pub table: String,
    pub columns: Vec<String>,
    pub primary_key: PrimaryKey,
}

struct Connector {
    ordering: Ordering,
    predicate: Option<Predicate>,
    split_edit_keys: Vec<String>,
    fully_applied_filters: bool,
    destroyed: bool,
    output: Option<Box<dyn FnMut(Change)>>,
}

struct SourceInner {
    schema: SourceSchema,
    rows: BTreeMap<RowKey, Row>,
    connectors: Vec<Connector>,
}

/// Owns a table's rows and multicasts pushes to connectors. Cheaply
/// cloneable (an `Rc` handle) so it can be shared by reference across
/// multiple pipelines, per `spec.md` §5's "Sources are shared by
/// reference" resource policy.
#[derive(Clone)]
pub struct Source(Rc<RefCell<SourceInner>>);

impl Source {
    pub fn new(schema: SourceSchema) -> Self {
        Source(Rc::new(RefCell::new(SourceInner {
            schema,
            rows: BTreeMap::new(),
            connectors: Vec::new(),
        })))
    }

    pub fn schema(&self) -> SourceSchema {
        self.0.borrow().schema.clone()
    }

    /// Open a new connector with its own ordering, optional predicate, and
    /// the set of columns whose change should split an `edit` into
    /// `remove`+`add` on this connector (because those columns feed the
    /// connector's ordering or join key). `fully_applied_filters` tells
    /// the builder whether `predicate` already covers the entire `where`
    /// clause for this subtree, letting it elide a downstream Filter.
    pub fn connect(
        &self,
        ordering: Ordering,
        predicate: Option<Predicate>,
        split_edit_keys: Vec<String>,
        fully_applied_filters: bool,
    ) -> SourceInput {
        let mut inner = self.0.borrow_mut();
        inner.connectors.push(Connector {
            ordering,
            predicate,
            split_edit_keys,
            fully_applied_filters,
            destroyed: false,
            output: None,
        });
        let connector_id = inner.connectors.len() - 1;
        SourceInput {
            source: self.0.clone(),
            connector_id,
        }
    }

    fn pk(&self) -> PrimaryKey {
        self.0.borrow().schema.primary_key.clone()
    }

    /// Validate and apply `change` against storage, then push it to every
    /// connector in registration order (`spec.md` §4.1). Fails atomically
    /// on any invariant violation — storage is mutated only after all
    /// validation has passed.
    pub fn push(&self, change: SourceChange) -> Result<(), ZeroError> {
        for _ in self.gen_push(change)? {}
        Ok(())
    }

    /// Same effect as `push`, but returns an iterator that yields once per
    /// connector fan-out step so callers can interleave effects between
    /// deliveries, per `spec.md` §4.1. Storage is made durable before the
    /// first yield (the spec's "fetch never fails" guarantee would
    /// otherwise be at the mercy of how far the caller drives this
    /// iterator), and the return value records whether it completed.
    pub fn gen_push(&self, change: SourceChange) -> Result<Stream<()>, ZeroError> {
        let pk = self.pk();
        let deliveries = {
            let mut inner = self.0.borrow_mut();
            let resolved = resolve_change(&pk, &mut inner.rows, change)?;
            build_deliveries(&inner.connectors, &resolved)
        };
        let source = self.0.clone();
        let table = self.0.borrow().schema.table.clone();
        Ok(Stream::new(deliveries.into_iter().map(move |(id, ch)| {
            let _span = crate::observability::operator_span("source", &table).entered();
            let mut inner = source.borrow_mut();
            if let Some(connector) = inner.connectors.get_mut(id) {
                if !connector.destroyed {
                    if let Some(output) = connector.output.as_mut() {
                        output(ch);
                    }
                }
            }
        })))
    }

    /// Current snapshot, used by a connector's `fetch`.
    fn snapshot(&self) -> Vec<Row> {
        self.0.borrow().rows.values().cloned().collect()
    }
}

/// What is pushed into a `Source`. See `crate::change::SourceChange` for
/// the propagated-downstream counterpart; kept as a distinct type here so
/// `Source::push`'s signature documents exactly what external writers
/// supply.
pub use crate::change::SourceChange;

fn resolve_change(
    pk: &PrimaryKey,
    rows: &mut BTreeMap<RowKey, Row>,
    change: SourceChange,
) -> Result<ResolvedChange, ZeroError> {
    match change {
        SourceChange::Add { row } => {
            let key = pk.extract(&row);
            if rows.contains_key(&key) {
                crate::observability::log_invariant_violation("duplicate primary key on add");
                return Err(ZeroError::DuplicatePrimaryKey(pk.columns().to_vec()));
            }
            rows.insert(key, row.clone());
            Ok(ResolvedChange::Add { row })
        }
        SourceChange::Remove { row } => {
            let key = pk.extract(&row);
            if rows.remove(&key).is_none() {
                crate::observability::log_invariant_violation("missing primary key on remove");
                return Err(ZeroError::MissingPrimaryKey(pk.columns().to_vec(), "remove"));
            }
            Ok(ResolvedChange::Remove { row })
        }
        SourceChange::Edit { row, old_row } => {
            let old_key = pk.extract(&old_row);
            if rows.remove(&old_key).is_none() {
                crate::observability::log_invariant_violation("missing primary key on edit");
                return Err(ZeroError::MissingPrimaryKey(pk.columns().to_vec(), "edit"));
            }
            let new_key = pk.extract(&row);
            if new_key != old_key && rows.contains_key(&new_key) {
                crate::observability::log_invariant_violation("duplicate primary key on edit");
                return Err(ZeroError::DuplicatePrimaryKey(pk.columns().to_vec()));
            }
            rows.insert(new_key, row.clone());
            Ok(ResolvedChange::Edit { row, old_row })
        }
        SourceChange::Set { row } => {
            let key = pk.extract(&row);
            match rows.insert(key, row.clone()) {
                Some(old_row) => Ok(ResolvedChange::Edit { row, old_row }),
                None => Ok(ResolvedChange::Add { row }),
            }
        }
    }
}

enum ResolvedChange {
    Add { row: Row },
    Remove { row: Row },
    Edit { row: Row, old_row: Row },
}

fn build_deliveries(connectors: &[Connector], change: &ResolvedChange) -> Vec<(usize, Change)> {
    let mut out = Vec::new();
    for (id, connector) in connectors.iter().enumerate() {
        if connector.destroyed {
            continue;
        }
        let matches = |row: &Row| connector.predicate.as_ref().is_none_or(|p| p(row));
        match change {
            ResolvedChange::Add { row } => {
                if matches(row) {
                    out.push((id, Change::Add { node: Node::new(row.clone()) }));
                }
            }
            ResolvedChange::Remove { row } => {
                if matches(row) {
                    out.push((id, Change::Remove { node: Node::new(row.clone()) }));
                }
            }
            ResolvedChange::Edit { row, old_row } => {
                let key_changed = connector
                    .split_edit_keys
                    .iter()
                    .any(|c| row.get(c) != old_row.get(c));
                let old_matches = matches(old_row);
                let new_matches = matches(row);
                if key_changed {
                    if old_matches {
                        out.push((id, Change::Remove { node: Node::new(old_row.clone()) }));
                    }
                    if new_matches {
                        out.push((id, Change::Add { node: Node::new(row.clone()) }));
                    }
                } else {
                    match (old_matches, new_matches) {
                        (true, true) => out.push((
                            id,
                            Change::Edit {
                                node: Node::new(row.clone()),
                                old_node: Node::new(old_row.clone()),
                            },
                        )),
                        (true, false) => {
                            out.push((id, Change::Remove { node: Node::new(old_row.clone()) }))
                        }
                        (false, true) => {
                            out.push((id, Change::Add { node: Node::new(row.clone()) }))
                        }
                        (false, false) => {}
                    }
                }
            }
        }
    }
    out
}

/// A connector handle returned by `Source::connect`. Exclusively owned by
/// the pipeline that opened it; implements the `Input` half of the
/// `spec.md` §4.2 operator contract at the leaf of the graph.
pub struct SourceInput {
    source: Rc<RefCell<SourceInner>>,
    connector_id: usize,
}

impl SourceInput {
    fn is_destroyed(&self) -> bool {
        self.source.borrow().connectors[self.connector_id].destroyed
    }
}

impl crate::operator::Input for SourceInput {
    fn get_schema(&self) -> SourceSchema {
        self.source.borrow().schema.clone()
    }

    /// Whether this connector's predicate already covers the whole
    /// `where` clause the builder connected it with, letting the builder
    /// elide a downstream Filter operator.
    fn fully_applied_filters(&self) -> bool {
        self.source.borrow().connectors[self.connector_id].fully_applied_filters
    }

    /// Register the downstream sink this connector pushes `Change`s to.
    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        self.source.borrow_mut().connectors[self.connector_id].output = Some(output);
    }

    /// Yield every row matching this connector's predicate, ordered by
    /// its ordering. `cleanup` has the identical contract here: Source
    /// rows are always retained regardless of whether a consumer drains
    /// or abandons the stream, so there is nothing extra to release.
    fn fetch(&self) -> Result<Stream<Node>, ZeroError> {
        if self.is_destroyed() {
            return Err(ZeroError::UseAfterDestroy);
        }
        let (predicate, ordering, pk, table) = {
            let inner = self.source.borrow();
            let c = &inner.connectors[self.connector_id];
            (c.predicate.clone(), c.ordering.clone(), inner.schema.primary_key.clone(), inner.schema.table.clone())
        };
        let _span = crate::observability::operator_span("source", &table).entered();
        let source = Source(self.source.clone());
        let mut rows: Vec<Row> = source
            .snapshot()
            .into_iter()
            .filter(|r| predicate.as_ref().is_none_or(|p| p(r)))
            .collect();
        rows.sort_by(|a, b| ordering.compare_rows(&pk, a, b));
        Ok(Stream::new(rows.into_iter().map(Node::new)))
    }

    fn cleanup(&self) -> Result<Stream<Node>, ZeroError> {
        crate::operator::Input::fetch(self)
    }

    /// Idempotent; unregisters this connector so it stops receiving
    /// pushes and releases its output closure.
    fn destroy(&self) {
        let mut inner = self.source.borrow_mut();
        let c = &mut inner.connectors[self.connector_id];
        c.destroyed = true;
        c.output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ZeroErrorKind;
    use crate::operator::Input;
    use crate::value::Value;

    fn schema() -> SourceSchema {
        SourceSchema {
            table: "issue".into(),
            columns: vec!["id".into(), "title".into()],
            primary_key: PrimaryKey::new(vec!["id".into()]),
        }
    }

    fn row(id: i64, title: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), Value::Number(id as f64));
        r.insert("title".into(), Value::String(title.into()));
        r
    }

    #[test]
    fn test_add_duplicate_pk_is_invariant_violation() {
        let src = Source::new(schema());
        src.push(SourceChange::Add { row: row(1, "a") }).unwrap();
        let err = src.push(SourceChange::Add { row: row(1, "b") }).unwrap_err();
        assert_eq!(err.kind(), ZeroErrorKind::Invariant);
    }

    #[test]
    fn test_remove_missing_pk_is_invariant_violation() {
        let src = Source::new(schema());
        let err = src.push(SourceChange::Remove { row: row(1, "a") }).unwrap_err();
        assert_eq!(err.kind(), ZeroErrorKind::Invariant);
    }

    #[test]
    fn test_connector_receives_pushes_in_registration_order() {
        let src = Source::new(schema());
        let order = Rc::new(RefCell::new(Vec::new()));
        let input1 = src.connect(Ordering::empty(), None, vec![], true);
        let input2 = src.connect(Ordering::empty(), None, vec![], true);
        let o1 = order.clone();
        input1.set_output(Box::new(move |_| o1.borrow_mut().push(1)));
        let o2 = order.clone();
        input2.set_output(Box::new(move |_| o2.borrow_mut().push(2)));
        src.push(SourceChange::Add { row: row(1, "a") }).unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_fetch_respects_predicate_and_ordering() {
        let src = Source::new(schema());
        src.push(SourceChange::Add { row: row(2, "b") }).unwrap();
        src.push(SourceChange::Add { row: row(1, "a") }).unwrap();
        let pred: Predicate = Rc::new(|r: &Row| {
            r.get("id").and_then(|v| v.as_f64()).unwrap_or(0.0) >= 1.0
        });
        let input = src.connect(
            Ordering::new(vec![("id".into(), crate::row::SortDir::Asc)]),
            Some(pred),
            vec![],
            true,
        );
        let rows: Vec<Row> = input.fetch().unwrap().drain().into_iter().map(|n| n.row).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id").unwrap().as_f64(), Some(1.0));
    }

    #[test]
    fn test_edit_splits_when_ordering_key_changes() {
        let src = Source::new(schema());
        src.push(SourceChange::Add { row: row(1, "a") }).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let input = src.connect(Ordering::empty(), None, vec!["title".into()], true);
        let seen2 = seen.clone();
        input.set_output(Box::new(move |c| {
            seen2.borrow_mut().push(match c {
                Change::Add { .. } => "add",
                Change::Remove { .. } => "remove",
                Change::Edit { .. } => "edit",
                Change::Child { .. } => "child",
            });
        }));
        src.push(SourceChange::Edit { row: row(1, "b"), old_row: row(1, "a") }).unwrap();
        assert_eq!(*seen.borrow(), vec!["remove", "add"]);
    }

    #[test]
    fn test_destroyed_connector_receives_no_further_pushes() {
        let src = Source::new(schema());
        let input = src.connect(Ordering::empty(), None, vec![], true);
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        input.set_output(Box::new(move |_| *count2.borrow_mut() += 1));
        input.destroy();
        src.push(SourceChange::Add { row: row(1, "a") }).unwrap();
        assert_eq!(*count.borrow(), 0);
    }
}
