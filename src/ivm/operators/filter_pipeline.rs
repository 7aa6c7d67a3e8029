//! Filter sub-pipeline (FilterInput/FilterOutput): `spec.md` §4.2.6.
//!
//! An alternate shape used inside complex `where` clauses, especially
//! `or`: instead of wiring a Fan-out/Fan-in (one sub-`Filter` per
//! disjunct, merged by counting), a chain of `FilterOperator`s probes
//! each node with a plain `bool` call. A `FilterOperator` can only drop a
//! node, never mutate its row or relationships, which is what lets `or`
//! and `and` compose as nested probes (`OrFilter`/`AndFilter`) without
//! materializing a union of sub-fetches. `FilterStart` marks the raw
//! input entering the chain; `FilterEnd` is the gate that actually
//! applies it to `fetch`/pushes.

use super::filter::{evaluate, Compiled};
use crate::change::{Change, Node};
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::Row;
use crate::stream::Stream;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A single probe in a filter chain. `cleanup` distinguishes a regular
/// evaluation from one made while draining a `cleanup()` stream, for
/// probes (like an exists check) whose answer may legitimately differ
/// once the pipeline is being torn down.
pub trait FilterOperator {
    fn filter(&self, node: &Node, cleanup: bool) -> bool;
}

/// Wraps a compiled `simple`/`and`/`or`/`correlatedSubquery` condition
/// tree as a single probe — the leaf most chains bottom out at.
pub struct ConditionFilter {
    pub compiled: Compiled,
    pub exists_lookup: Rc<dyn Fn(&str, &Row) -> bool>,
}

impl FilterOperator for ConditionFilter {
    fn filter(&self, node: &Node, _cleanup: bool) -> bool {
        evaluate(&self.compiled, &node.row, self.exists_lookup.as_ref())
    }
}

/// A live, pull-based existence probe: counts matching children by
/// re-fetching the child connector and filtering by correlation key on
/// every call, rather than maintaining a push-updated counter the way
/// `operators::exists::Exists` does. Appropriate here because a probe is
/// only ever called from within a `fetch`/push already touching this row,
/// not continuously.
pub struct ExistsProbe {
    pub child_input: Rc<dyn Input>,
    pub correlation: crate::ast::Correlation,
    pub negate: bool,
}

impl FilterOperator for ExistsProbe {
    fn filter(&self, node: &Node, _cleanup: bool) -> bool {
        let key = super::join_common::parent_key(&self.correlation, &node.row);
        let exists = self
            .child_input
            .fetch()
            .map(|s| s.drain())
            .unwrap_or_default()
            .into_iter()
            .any(|c| super::join_common::child_key(&self.correlation, &c.row) == key);
        if self.negate { !exists } else { exists }
    }
}

pub struct OrFilter(pub Vec<Box<dyn FilterOperator>>);

impl FilterOperator for OrFilter {
    fn filter(&self, node: &Node, cleanup: bool) -> bool {
        self.0.iter().any(|f| f.filter(node, cleanup))
    }
}

pub struct AndFilter(pub Vec<Box<dyn FilterOperator>>);

impl FilterOperator for AndFilter {
    fn filter(&self, node: &Node, cleanup: bool) -> bool {
        self.0.iter().all(|f| f.filter(node, cleanup))
    }
}

/// Marks the raw input entering a filter sub-pipeline. A thin, identity
/// wrapper — `FilterEnd` is where probing actually happens.
pub struct FilterStart(Box<dyn Input>);

impl FilterStart {
    pub fn new(input: Box<dyn Input>) -> FilterStart {
        FilterStart(input)
    }
}

struct FilterEndInner {
    input: FilterStart,
    chain: Box<dyn FilterOperator>,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

/// Gates `fetch`/pushes from `FilterStart`'s input through a probe chain,
/// using the same edit-splitting law `Filter` uses: a pass-through `edit`
/// only crosses when the chain agrees on both the old and new row.
pub struct FilterEnd(Rc<FilterEndInner>);

impl FilterEnd {
    pub fn new(input: FilterStart, chain: Box<dyn FilterOperator>) -> FilterEnd {
        let inner = Rc::new(FilterEndInner {
            input,
            chain,
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        });
        let weak = Rc::downgrade(&inner);
        inner.input.0.set_output(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                FilterEnd::handle_push(&inner, change);
            }
        }));
        FilterEnd(inner)
    }

    fn handle_push(inner: &Rc<FilterEndInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        let _span =
            crate::observability::operator_span("filter_pipeline", &inner.input.0.get_schema().table).entered();
        let mut out = inner.output.borrow_mut();
        let Some(out) = out.as_mut() else { return };
        match change {
            Change::Add { node } => {
                if inner.chain.filter(&node, false) {
                    out(Change::Add { node });
                }
            }
            Change::Remove { node } => {
                if inner.chain.filter(&node, false) {
                    out(Change::Remove { node });
                }
            }
            Change::Edit { node, old_node } => {
                let new_matches = inner.chain.filter(&node, false);
                let old_matches = inner.chain.filter(&old_node, false);
                match (old_matches, new_matches) {
                    (true, true) => out(Change::Edit { node, old_node }),
                    (true, false) => out(Change::Remove { node: old_node }),
                    (false, true) => out(Change::Add { node }),
                    (false, false) => {}
                }
            }
            Change::Child { node, child } => {
                if inner.chain.filter(&node, false) {
                    out(Change::Child { node, child });
                }
            }
        }
    }

    #[allow(dead_code)]
    fn row_passes(&self, row: &Row) -> bool {
        self.0.chain.filter(&Node::new(row.clone()), false)
    }
}

impl Input for FilterEnd {
    fn get_schema(&self) -> crate::source::SourceSchema {
        self.0.input.0.get_schema()
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
        let _span =
            crate::observability::operator_span("filter_pipeline", &self.0.input.0.get_schema().table).entered();
        let nodes: Vec<Node> = self
            .0
            .input
            .0
            .fetch()?
            .drain()
            .into_iter()
            .filter(|n| self.0.chain.filter(n, false))
            .collect();
        Ok(Stream::new(nodes.into_iter()))
    }

    fn cleanup(&self) -> Result<Stream<Node>, ZeroError> {
        let _span =
            crate::observability::operator_span("filter_pipeline", &self.0.input.0.get_schema().table).entered();
        let nodes: Vec<Node> = self
            .0
            .input
            .0
            .cleanup()?
            .drain()
            .into_iter()
            .filter(|n| self.0.chain.filter(n, true))
            .collect();
        Ok(Stream::new(nodes.into_iter()))
    }

    fn destroy(&self) {
        self.0.destroyed.set(true);
        *self.0.output.borrow_mut() = None;
        self.0.input.0.destroy();
    }
}
