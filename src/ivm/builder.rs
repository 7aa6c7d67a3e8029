//! Pipeline Builder: `spec.md` §4.3.
//!
//! Assembles an operator graph from an `Ast` plus a `BuilderDelegate`
//! (analogous to the teacher's planner stitching scan/join/filter nodes
//! together from a parsed query, but here built post-order bottom-up from
//! `Source::connect` rather than by visiting a SQL plan tree). Construction
//! order:
//!
//! 1. `map_ast` (if the delegate provides one) translates client-facing
//!    names to whatever the delegate's schema actually calls them.
//! 2. Resolve the table's `Source` and open one connector with the
//!    effective ordering; push the whole `where` clause into the
//!    connector's predicate when it contains no `correlatedSubquery`
//!    (`fully_applied_filters = true`, eliding a downstream Filter).
//! 3. Resolve any remaining `where` (Filter / Fan-out-Fan-in / Exists),
//!    then `start` (Skip), then `related[]` as Joins in declaration order;
//!    each join recursively builds its subquery's pipeline.
//! 4. Apply `limit` last via Take.
//!
//! Step 3 applies `start` *after* the `where` clause rather than before it
//! as `spec.md`'s literal step list reads. A top-level `or` that can't be
//! pushed to the Source realizes as a `FanOut` whose branches each open
//! their own fresh `Source::connect()` — every operator downstream of a
//! Source exposes exactly one `output` slot, so a shared intermediate
//! stage (like a `Skip` sitting between the connector and the fan-out)
//! cannot be fanned out to multiple branches the way a Source's
//! `connect()` itself can. Skip's row-inclusion test is independent of
//! which `or` branch a row matched, so the two operations commute as set
//! operations, and applying Skip after the where-clause resolution (on
//! the fan-out's merged output) gets the same result without requiring
//! every branch to duplicate it.

use super::operators::exists::Exists;
use super::operators::fanout::FanOut;
use super::operators::filter::{self, Filter};
use super::operators::filter_pipeline::ExistsProbe;
use super::operators::join::Join;
use super::operators::join_common::{self, CorrelationIndex};
use super::operators::skip::Skip;
use super::operators::take::Take;
use crate::ast::{Ast, Condition, Correlation, ExistsOp, Related};
use crate::change::Change;
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::{PrimaryKey, Row};
use crate::source::Source;
use crate::storage::Storage;
use crate::stream::Stream;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Everything the builder needs from its embedder: where to find a table's
/// `Source`, how to allocate `Storage` for stateful operators, and two
/// optional hooks for decorating the graph or remapping AST names.
/// Mirrors `spec.md` §4.3's "AST + BuilderDelegate".
pub trait BuilderDelegate {
    /// Resolve the `Source` backing `schema.table` (schema is the AST's
    /// optional namespace, table its name). A `BuilderError`-class
    /// `ZeroError` if unknown.
    fn get_source(&self, schema: Option<&str>, table: &str) -> Result<Source, ZeroError>;

    /// Allocate a fresh `Storage` for one stateful operator (a
    /// `CorrelationIndex`, an `Exists` counter table, or a `FanIn` dedupe
    /// table). Called once per operator that needs one, so a delegate
    /// backing a server deployment can hand out namespaced KV regions
    /// instead of always using an in-memory map.
    fn create_storage(&self) -> Box<dyn Storage>;

    /// Wrap a freshly built stage before it's handed to its parent.
    /// Default: identity. A delegate could use this to instrument every
    /// stage with its own logging/metrics wrapper.
    fn decorate_input(&self, input: Box<dyn Input>) -> Box<dyn Input> {
        input
    }

    /// Translate client-facing schema/table/column names to whatever this
    /// delegate's backing store actually calls them. Default: no-op.
    fn map_ast(&self, ast: &Ast) -> Ast {
        ast.clone()
    }

    /// Resolve a late-bound `Parameter` (`spec.md` §9) to a concrete
    /// value at build time. Default: always unresolved; delegates that
    /// support parameters (e.g. `authData`) must override this.
    fn resolve_parameter(&self, _anchor: &str, _field: &str) -> Option<Value> {
        None
    }
}

/// Build the operator graph for `ast` against `delegate`, returning the
/// terminal `Input` the caller attaches its output to.
pub fn build(ast: &Ast, delegate: &dyn BuilderDelegate) -> Result<Box<dyn Input>, ZeroError> {
    let ast = delegate.map_ast(ast);
    let source = delegate.get_source(ast.schema.as_deref(), &ast.table)?;
    let schema = source.schema();
    let pk = schema.primary_key.clone();
    let ordering = ast.effective_order_by(pk.columns());

    let (push_down, remainder) = split_where(&ast, delegate);

    let split_edit_keys = ordering.0.iter().map(|(c, _)| c.clone()).collect::<Vec<_>>();
    let connector = source.connect(ordering.clone(), push_down.clone(), split_edit_keys, push_down.is_some());
    let mut input: Box<dyn Input> = delegate.decorate_input(Box::new(connector));

    if let Some(cond) = remainder {
        input = delegate.decorate_input(build_where(input, &source, &cond, &ordering, &pk, delegate)?);
    }

    if let Some(start) = &ast.start {
        input = delegate.decorate_input(Box::new(Skip::new(
            input,
            ordering.clone(),
            pk.clone(),
            start.row.clone(),
            start.exclusive,
        )));
    }

    for related in &ast.related {
        let child_pipeline = build(&related.subquery, delegate)?;
        let storage = delegate.create_storage();
        let join = Join::new(
            input,
            child_pipeline,
            related.relationship_name.clone(),
            related.correlation.clone(),
            pk.clone(),
            storage,
        );
        input = delegate.decorate_input(Box::new(join));
    }

    if let Some(limit) = ast.limit {
        let take = Take::new(input, limit as usize, ordering, pk)?;
        input = delegate.decorate_input(Box::new(take));
    }

    Ok(input)
}

/// A `where` clause with no `correlatedSubquery` anywhere in its tree can
/// be pushed entirely into the Source connector's predicate, per
/// `spec.md` §4.3 step 2. Returns `(predicate, None)` in that case, or
/// `(None, Some(condition))` when a Filter/FanOut/Exists stage is still
/// needed above the connector.
fn split_where(ast: &Ast, delegate: &dyn BuilderDelegate) -> (Option<crate::source::Predicate>, Option<Condition>) {
    match &ast.condition {
        Some(cond) if !contains_correlated_subquery(cond) => {
            let compiled = filter::compile(cond, &resolve_param_fn(delegate));
            (
                Some(Rc::new(move |row: &Row| filter::evaluate(&compiled, row, &|_, _| false))
                    as crate::source::Predicate),
                None,
            )
        }
        other => (None, other.clone()),
    }
}

fn resolve_param_fn<'a>(delegate: &'a dyn BuilderDelegate) -> impl Fn(&str, &str) -> Option<Value> + 'a {
    move |anchor: &str, field: &str| delegate.resolve_parameter(anchor, field)
}

fn contains_correlated_subquery(cond: &Condition) -> bool {
    match cond {
        Condition::Simple { .. } => false,
        Condition::And { conditions } | Condition::Or { conditions } => {
            conditions.iter().any(contains_correlated_subquery)
        }
        Condition::CorrelatedSubquery { .. } => true,
    }
}

fn build_where(
    input: Box<dyn Input>,
    source: &Source,
    cond: &Condition,
    ordering: &crate::row::Ordering,
    pk: &PrimaryKey,
    delegate: &dyn BuilderDelegate,
) -> Result<Box<dyn Input>, ZeroError> {
    // A bare top-level EXISTS/NOT EXISTS gets the fully push+pull-correct
    // dedicated Exists operator.
    if let Condition::CorrelatedSubquery { related, op } = cond {
        return Ok(Box::new(build_exists(input, related, *op, pk, delegate)?));
    }

    // A top-level `or` with more than one disjunct that contains a
    // correlated branch realizes as FanOut/FanIn, each branch opening its
    // own connector on `source`.
    if let Condition::Or { conditions } = cond {
        if conditions.len() > 1 {
            return build_or_fanout(source, conditions, ordering, pk, delegate);
        }
    }

    // Everything else (a Simple/And tree, or an Or with a single
    // disjunct) is a single Filter pass: nested correlatedSubquery leaves
    // are answered by a pull-based ExistsProbe per relationship.
    let compiled = filter::compile(cond, &resolve_param_fn(delegate));
    let probes = collect_exists_probes(cond, delegate)?;
    let exists_lookup: Rc<dyn Fn(&str, &Row) -> bool> = Rc::new(move |name, row| {
        probes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, probe)| probe.filter(&crate::change::Node::new(row.clone()), false))
            .unwrap_or(false)
    });
    Ok(Box::new(Filter::new(input, compiled, exists_lookup)))
}

/// Pre-build every `correlatedSubquery` leaf in `cond` into a pull-based
/// `ExistsProbe`, so the one `Filter` covering the whole tree can answer
/// `exists_lookup(name, row)` for any of them. Only correct on `fetch`
/// and on pushes to the row being tested; a child-only change does not
/// re-trigger re-evaluation for this nested case (see `ExistsProbe`'s own
/// doc comment) — the dominant, fully correct case is the bare top-level
/// EXISTS handled above by `build_exists`.
fn collect_exists_probes(
    cond: &Condition,
    delegate: &dyn BuilderDelegate,
) -> Result<Vec<(String, ExistsProbe)>, ZeroError> {
    let mut out = Vec::new();
    collect_exists_probes_into(cond, delegate, &mut out)?;
    Ok(out)
}

fn collect_exists_probes_into(
    cond: &Condition,
    delegate: &dyn BuilderDelegate,
    out: &mut Vec<(String, ExistsProbe)>,
) -> Result<(), ZeroError> {
    match cond {
        Condition::Simple { .. } => Ok(()),
        Condition::And { conditions } | Condition::Or { conditions } => {
            for c in conditions {
                collect_exists_probes_into(c, delegate, out)?;
            }
            Ok(())
        }
        Condition::CorrelatedSubquery { related, op } => {
            let child_pipeline = build(&related.subquery, delegate)?;
            out.push((
                related.relationship_name.clone(),
                ExistsProbe {
                    child_input: Rc::from(child_pipeline),
                    correlation: related.correlation.clone(),
                    negate: matches!(op, ExistsOp::NotExists),
                },
            ));
            Ok(())
        }
    }
}

/// Tracks, for a parent pipeline feeding an `Exists` operator, the same
/// child-correlation-key → parent-PK index (and a parent-row cache so a
/// child push can be turned back into a full parent row) that `Join`
/// maintains for its own parent side. Sits between the real parent
/// pipeline and `Exists`, forwarding every change unchanged after
/// recording it.
struct ExistsTapInner {
    inner: Box<dyn Input>,
    correlation: Correlation,
    pk: PrimaryKey,
    index: RefCell<CorrelationIndex>,
    parent_rows: RefCell<BTreeMap<String, Row>>,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

#[derive(Clone)]
struct ExistsTap(Rc<ExistsTapInner>);

impl ExistsTap {
    fn new(inner: Box<dyn Input>, correlation: Correlation, pk: PrimaryKey, storage: Box<dyn Storage>) -> ExistsTap {
        let inner_rc = Rc::new(ExistsTapInner {
            inner,
            correlation,
            pk,
            index: RefCell::new(CorrelationIndex::new(storage)),
            parent_rows: RefCell::new(BTreeMap::new()),
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        });
        let weak = Rc::downgrade(&inner_rc);
        inner_rc.inner.set_output(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                ExistsTap::handle_push(&inner, change);
            }
        }));
        ExistsTap(inner_rc)
    }

    fn register(inner: &ExistsTapInner, row: &Row) {
        let key = join_common::parent_key(&inner.correlation, row);
        let pk_encoded = inner.pk.extract(row).encode();
        inner.parent_rows.borrow_mut().insert(pk_encoded.clone(), row.clone());
        inner.index.borrow_mut().add(&key, &pk_encoded);
    }

    fn unregister(inner: &ExistsTapInner, row: &Row) {
        let key = join_common::parent_key(&inner.correlation, row);
        let pk_encoded = inner.pk.extract(row).encode();
        inner.index.borrow_mut().remove(&key, &pk_encoded);
        inner.parent_rows.borrow_mut().remove(&pk_encoded);
    }

    fn handle_push(inner: &Rc<ExistsTapInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        match &change {
            Change::Add { node } | Change::Edit { node, .. } => ExistsTap::register(inner, &node.row),
            Change::Remove { node } => ExistsTap::unregister(inner, &node.row),
            Change::Child { .. } => {}
        }
        if let Some(out) = inner.output.borrow_mut().as_mut() {
            out(change);
        }
    }

    fn parents_for_child(&self, child_key: &str) -> Vec<String> {
        self.0.index.borrow().parents_for_child(child_key)
    }

    fn parent_row(&self, pk_encoded: &str) -> Option<Row> {
        self.0.parent_rows.borrow().get(pk_encoded).cloned()
    }
}

impl Input for ExistsTap {
    fn get_schema(&self) -> crate::source::SourceSchema {
        self.0.inner.get_schema()
    }

    fn fully_applied_filters(&self) -> bool {
        self.0.inner.fully_applied_filters()
    }

    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        *self.0.output.borrow_mut() = Some(output);
    }

    fn fetch(&self) -> Result<Stream<crate::change::Node>, ZeroError> {
        let nodes: Vec<crate::change::Node> = self.0.inner.fetch()?.drain();
        for node in &nodes {
            ExistsTap::register(&self.0, &node.row);
        }
        Ok(Stream::new(nodes.into_iter()))
    }

    fn cleanup(&self) -> Result<Stream<crate::change::Node>, ZeroError> {
        self.0.inner.cleanup()
    }

    fn destroy(&self) {
        self.0.destroyed.set(true);
        *self.0.output.borrow_mut() = None;
        self.0.inner.destroy();
    }
}

/// Holds the `Exists` operator alongside the child pipeline and tap it
/// depends on, so their `Rc`-backed state (and the Source connectors the
/// child pipeline ultimately owns) stay alive for as long as `Exists`
/// does. `Exists` itself only needs a `Box<dyn Input>` for its parent
/// side; this wrapper is what the builder returns instead.
struct ExistsWithChild {
    exists: Exists,
    _child_pipeline: Rc<dyn Input>,
    _tap: ExistsTap,
}

impl Input for ExistsWithChild {
    fn get_schema(&self) -> crate::source::SourceSchema {
        self.exists.get_schema()
    }

    fn fully_applied_filters(&self) -> bool {
        self.exists.fully_applied_filters()
    }

    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        self.exists.set_output(output);
    }

    fn fetch(&self) -> Result<Stream<crate::change::Node>, ZeroError> {
        self.exists.fetch()
    }

    fn cleanup(&self) -> Result<Stream<crate::change::Node>, ZeroError> {
        self.exists.cleanup()
    }

    fn destroy(&self) {
        self.exists.destroy()
    }
}

/// A bare top-level `EXISTS`/`NOT EXISTS`: wires a dedicated `Exists`
/// operator against the subquery's pipeline, with the parent side tapped
/// through `ExistsTap` (for the child-key → parent-row lookups a child
/// push needs) and child pushes translated into `Exists::on_child_push`
/// calls for every affected parent.
fn build_exists(
    input: Box<dyn Input>,
    related: &Related,
    op: ExistsOp,
    pk: &PrimaryKey,
    delegate: &dyn BuilderDelegate,
) -> Result<ExistsWithChild, ZeroError> {
    let correlation = related.correlation.clone();
    let negate = matches!(op, ExistsOp::NotExists);

    let child_pipeline: Rc<dyn Input> = Rc::from(build(&related.subquery, delegate)?);

    let initial_count: Box<dyn Fn(&Row) -> u32> = {
        let correlation = correlation.clone();
        let child_pipeline = child_pipeline.clone();
        Box::new(move |parent_row: &Row| {
            let key = join_common::parent_key(&correlation, parent_row);
            child_pipeline
                .fetch()
                .map(|s| s.drain())
                .unwrap_or_default()
                .into_iter()
                .filter(|n| join_common::child_key(&correlation, &n.row) == key)
                .count() as u32
        })
    };

    let tap = ExistsTap::new(input, correlation.clone(), pk.clone(), delegate.create_storage());
    let exists = Exists::new(Box::new(tap.clone()), pk.clone(), negate, initial_count, delegate.create_storage());
    let exists_rc = Rc::new(exists);

    {
        let exists_for_child = exists_rc.clone();
        let tap_for_child = tap.clone();
        let correlation = correlation.clone();
        child_pipeline.set_output(Box::new(move |change| {
            let delta = match &change {
                Change::Add { .. } => 1,
                Change::Remove { .. } => -1,
                // An edit never changes the correlation key (it would
                // have been split into remove+add upstream), and a
                // nested `child` change doesn't affect this parent's
                // matching-children count.
                _ => 0,
            };
            if delta == 0 {
                return;
            }
            let child_key = join_common::child_key(&correlation, change.row());
            for parent_pk in tap_for_child.parents_for_child(&child_key) {
                if let Some(parent_row) = tap_for_child.parent_row(&parent_pk) {
                    exists_for_child.on_child_push(&parent_row, delta);
                }
            }
        }));
    }

    let exists = Rc::try_unwrap(exists_rc).unwrap_or_else(|shared| {
        // Unreachable in practice: the closure above holds the only other
        // clone, and it is dropped along with `child_pipeline`'s output
        // slot only on `destroy()`, by which point this function has
        // already returned. Fall back to cloning the Rc's pointee would
        // require `Exists: Clone`, which it isn't, so this arm can't
        // actually be hit; kept for exhaustiveness rather than panicking.
        drop(shared);
        unreachable!("Exists is uniquely owned once build_exists returns")
    });

    Ok(ExistsWithChild { exists, _child_pipeline: child_pipeline, _tap: tap })
}

/// Top-level `or` with more than one disjunct that can't be fully pushed
/// to the Source: wire a `FanOut`/`FanIn`, with each branch opening its
/// own fresh connector on `source` (every operator downstream of a Source
/// has exactly one `output` slot, so a shared intermediate stage cannot
/// fan out to multiple branches the way a Source's `connect()` can).
fn build_or_fanout(
    source: &Source,
    conditions: &[Condition],
    ordering: &crate::row::Ordering,
    pk: &PrimaryKey,
    delegate: &dyn BuilderDelegate,
) -> Result<Box<dyn Input>, ZeroError> {
    let mut branches: Vec<Box<dyn Input>> = Vec::with_capacity(conditions.len());
    for cond in conditions {
        let compiled = filter::compile(cond, &resolve_param_fn(delegate));
        let probes = collect_exists_probes(cond, delegate)?;
        let exists_lookup: Rc<dyn Fn(&str, &Row) -> bool> = Rc::new(move |name, row| {
            probes
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, probe)| probe.filter(&crate::change::Node::new(row.clone()), false))
                .unwrap_or(false)
        });
        let connector = source.connect(ordering.clone(), None, Vec::new(), false);
        let branch_input: Box<dyn Input> = delegate.decorate_input(Box::new(connector));
        let filter = Filter::new(branch_input, compiled, exists_lookup);
        branches.push(delegate.decorate_input(Box::new(filter)));
    }

    let storage = delegate.create_storage();
    let fan_out = FanOut::new(branches, pk.clone(), storage);
    Ok(Box::new(FanOutInput { fan_out }))
}

/// Adapts a `FanOut` (which has no single upstream `Input` of its own —
/// its `fetch` must union every branch) into the `Input` contract the rest
/// of the builder composes against.
struct FanOutInput {
    fan_out: FanOut,
}

impl Input for FanOutInput {
    fn get_schema(&self) -> crate::source::SourceSchema {
        unreachable!("FanOutInput is only ever used as an interior builder stage")
    }

    fn fully_applied_filters(&self) -> bool {
        true
    }

    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        self.fan_out.fan_in().set_output(output);
    }

    fn fetch(&self) -> Result<Stream<crate::change::Node>, ZeroError> {
        Ok(Stream::new(self.fan_out.fetch_union()?.into_iter()))
    }

    fn cleanup(&self) -> Result<Stream<crate::change::Node>, ZeroError> {
        self.fetch()
    }

    fn destroy(&self) {
        self.fan_out.destroy();
    }
}
