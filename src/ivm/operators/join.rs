//! Join operator (correlated subquery expansion): `spec.md` §4.2.2.
//!
//! Given a parent input and a raw child connector, joins on a compound
//! correlation (parent field tuple ↔ child field tuple). For each parent
//! row it attaches a relationship thunk that re-queries the child
//! connector, filtered to rows whose correlation key matches that parent's
//! key. A `join_common::CorrelationIndex` maps a child's correlation key
//! to the parent PKs currently referring to it, so a child push can be
//! translated into "which parents does this affect" without rescanning
//! every parent row.

use super::join_common::{self, CorrelationIndex};
use crate::ast::Correlation;
use crate::change::{Change, ChildChange, Node};
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::{PrimaryKey, Row};
use crate::storage::Storage;
use crate::stream::Stream;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

struct JoinInner {
    parent_input: Box<dyn Input>,
    child_input: Box<dyn Input>,
    relationship_name: String,
    correlation: Correlation,
    pk: PrimaryKey,
    index: RefCell<CorrelationIndex>,
    /// Parent rows currently known, by encoded PK, so a child push (which
    /// only identifies parents by their correlation key) can be turned
    /// back into full parent `Node`s for the `child` change it emits.
    parent_rows: RefCell<BTreeMap<String, Row>>,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

pub struct Join(Rc<JoinInner>);

impl Join {
    pub fn new(
        parent_input: Box<dyn Input>,
        child_input: Box<dyn Input>,
        relationship_name: impl Into<String>,
        correlation: Correlation,
        pk: PrimaryKey,
        storage: Box<dyn Storage>,
    ) -> Join {
        let inner = Rc::new(JoinInner {
            parent_input,
            child_input,
            relationship_name: relationship_name.into(),
            correlation,
            pk,
            index: RefCell::new(CorrelationIndex::new(storage)),
            parent_rows: RefCell::new(BTreeMap::new()),
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        });

        let parent_weak = Rc::downgrade(&inner);
        inner.parent_input.set_output(Box::new(move |change| {
            if let Some(inner) = parent_weak.upgrade() {
                Join::handle_parent_push(&inner, change);
            }
        }));

        let child_weak = Rc::downgrade(&inner);
        inner.child_input.set_output(Box::new(move |change| {
            if let Some(inner) = child_weak.upgrade() {
                Join::handle_child_push(&inner, change);
            }
        }));

        Join(inner)
    }

    fn relationship_closure(inner: &Rc<JoinInner>, parent_key: String) -> Rc<dyn Fn() -> Stream<Node>> {
        let inner = inner.clone();
        Rc::new(move || {
            let correlation = &inner.correlation;
            let nodes: Vec<Node> = inner
                .child_input
                .fetch()
                .map(|s| s.drain())
                .unwrap_or_default()
                .into_iter()
                .filter(|n| join_common::child_key(correlation, &n.row) == parent_key)
                .collect();
            Stream::new(nodes.into_iter())
        })
    }

    fn attach(inner: &Rc<JoinInner>, mut node: Node) -> Node {
        let key = join_common::parent_key(&inner.correlation, &node.row);
        let thunk = Join::relationship_closure(inner, key);
        node.relationships.insert(inner.relationship_name.clone(), thunk);
        node
    }

    fn handle_parent_push(inner: &Rc<JoinInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        let _span = crate::observability::operator_span("join", &inner.parent_input.get_schema().table).entered();
        match change {
            Change::Add { node } => {
                let key = join_common::parent_key(&inner.correlation, &node.row);
                let pk_encoded = inner.pk.extract(&node.row).encode();
                inner.parent_rows.borrow_mut().insert(pk_encoded.clone(), node.row.clone());
                inner.index.borrow_mut().add(&key, &pk_encoded);
                let node = Join::attach(inner, node);
                if let Some(out) = inner.output.borrow_mut().as_mut() {
                    out(Change::Add { node });
                }
            }
            Change::Remove { node } => {
                let key = join_common::parent_key(&inner.correlation, &node.row);
                let pk_encoded = inner.pk.extract(&node.row).encode();
                // Attach before unregistering: the relationship stream
                // this emits must still see the pre-removal correlation
                // key ("its then-still-valid relationship stream").
                let attached = Join::attach(inner, node);
                if let Some(out) = inner.output.borrow_mut().as_mut() {
                    out(Change::Remove { node: attached });
                }
                inner.index.borrow_mut().remove(&key, &pk_encoded);
                inner.parent_rows.borrow_mut().remove(&pk_encoded);
            }
            Change::Edit { node, old_node } => {
                // Correlation fields feed `splitEditKeys` on the parent
                // connector, so an edit reaching here never changes the
                // correlation key; the relationship subtree is unchanged
                // by the same invariant.
                let pk_encoded = inner.pk.extract(&node.row).encode();
                inner.parent_rows.borrow_mut().insert(pk_encoded, node.row.clone());
                let node = Join::attach(inner, node);
                let old_node = Join::attach(inner, old_node);
                if let Some(out) = inner.output.borrow_mut().as_mut() {
                    out(Change::Edit { node, old_node });
                }
            }
            Change::Child { node, child } => {
                let pk_encoded = inner.pk.extract(&node.row).encode();
                inner.parent_rows.borrow_mut().insert(pk_encoded, node.row.clone());
                let node = Join::attach(inner, node);
                if let Some(out) = inner.output.borrow_mut().as_mut() {
                    out(Change::Child { node, child });
                }
            }
        }
    }

    fn handle_child_push(inner: &Rc<JoinInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        let _span = crate::observability::operator_span("join", &inner.child_input.get_schema().table).entered();
        let child_key = join_common::child_key(&inner.correlation, change.row());
        let parent_pks = inner.index.borrow().parents_for_child(&child_key);
        for parent_pk in parent_pks {
            let Some(parent_row) = inner.parent_rows.borrow().get(&parent_pk).cloned() else {
                continue;
            };
            let parent_node = Join::attach(inner, Node::new(parent_row));
            if let Some(out) = inner.output.borrow_mut().as_mut() {
                out(Change::Child {
                    node: parent_node,
                    child: ChildChange {
                        relationship_name: inner.relationship_name.clone(),
                        change: Box::new(change.clone()),
                    },
                });
            }
        }
    }
}

impl Input for Join {
    fn get_schema(&self) -> crate::source::SourceSchema {
        self.0.parent_input.get_schema()
    }

    fn fully_applied_filters(&self) -> bool {
        self.0.parent_input.fully_applied_filters()
    }

    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        *self.0.output.borrow_mut() = Some(output);
    }

    fn fetch(&self) -> Result<Stream<Node>, ZeroError> {
        if self.0.destroyed.get() {
            return Err(ZeroError::UseAfterDestroy);
        }
        let inner = &self.0;
        let _span = crate::observability::operator_span("join", &inner.parent_input.get_schema().table).entered();
        let nodes: Vec<Node> = inner
            .parent_input
            .fetch()?
            .drain()
            .into_iter()
            .map(|node| {
                let key = join_common::parent_key(&inner.correlation, &node.row);
                let pk_encoded = inner.pk.extract(&node.row).encode();
                inner.parent_rows.borrow_mut().insert(pk_encoded.clone(), node.row.clone());
                inner.index.borrow_mut().add(&key, &pk_encoded);
                Join::attach(inner, node)
            })
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
        self.0.child_input.destroy();
    }
}
