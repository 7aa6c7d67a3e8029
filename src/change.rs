//! Change propagation types: `Node`, `Change`, `SourceChange`.
//!
//! `spec.md` §3: a `Node` pairs a row with thunks returning lazy,
//! single-use relationship streams; `Change` is the tagged variant
//! operators push downstream; `SourceChange` is what callers push into a
//! `Source`.

use crate::row::Row;
use crate::stream::Stream;
use std::collections::BTreeMap;
use std::rc::Rc;

/// A row plus its relationship streams, keyed by relationship name. Each
/// stream is a thunk: calling it produces a fresh, lazy, single-use
/// `Stream<Node>` for that relationship — `spec.md` §3's "thunk returning
/// a Stream of child Nodes".
#[derive(Clone)]
pub struct Node {
    pub row: Row,
    pub relationships: BTreeMap<String, Rc<dyn Fn() -> Stream<Node>>>,
}

impl Node {
    pub fn new(row: Row) -> Self {
        Node {
            row,
            relationships: BTreeMap::new(),
        }
    }

    pub fn with_relationship(
        mut self,
        name: impl Into<String>,
        thunk: Rc<dyn Fn() -> Stream<Node>>,
    ) -> Self {
        self.relationships.insert(name.into(), thunk);
        self
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("row", &self.row)
            .field("relationships", &self.relationships.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A single step of a nested `child` change: which relationship changed,
/// and the change itself.
#[derive(Debug, Clone)]
pub struct ChildChange {
    pub relationship_name: String,
    pub change: Box<Change>,
}

/// The tagged variant propagated downstream by operators, per `spec.md`
/// §3. `Edit`'s invariant (no relationship change may cross an edit — the
/// relationship subtree of `node` equals that of `old_node`) is enforced
/// by construction at every call site that builds one: those sites clone
/// `relationships` from the pre-edit node rather than rebuilding it.
#[derive(Debug, Clone)]
pub enum Change {
    Add { node: Node },
    Remove { node: Node },
    Edit { node: Node, old_node: Node },
    Child { node: Node, child: ChildChange },
}

impl Change {
    /// The row of the node this change is about, ignoring the nested
    /// `old_node`/`child` payload — useful for PK lookups during push
    /// handling.
    pub fn row(&self) -> &Row {
        match self {
            Change::Add { node } | Change::Remove { node } | Change::Child { node, .. } => {
                &node.row
            }
            Change::Edit { node, .. } => &node.row,
        }
    }
}

/// What is pushed into a `Source`: `spec.md` §3 `SourceChange`. `Set` is
/// upsert semantics — a convenience the Source resolves into `Add` or
/// `Edit` depending on whether the primary key already exists.
#[derive(Debug, Clone)]
pub enum SourceChange {
    Add { row: Row },
    Remove { row: Row },
    Edit { row: Row, old_row: Row },
    Set { row: Row },
}

/// The "rowless relationship" projection of `Change` used by the view
/// assembler to mutate an already-materialized tree in place, per
/// `spec.md` §4.4. Distinct from `Change` because the assembler never
/// re-fetches relationship streams — it only needs row deltas plus a path
/// to the relationship that changed.
#[derive(Debug, Clone)]
pub enum ViewChange {
    Add { row: Row },
    Remove { row: Row },
    Edit { row: Row, old_row: Row },
    /// `row` identifies the parent entry (by its table's primary key) the
    /// named relationship was found under, since this projection carries no
    /// `Node`/thunks to derive it from the way `Change::Child` does.
    Child { row: Row, relationship_name: String, change: Box<ViewChange> },
}

impl From<&Change> for ViewChange {
    /// Project a pipeline `Change` (which carries `Node`s with lazy
    /// relationship thunks) down to the plain-data delta the view
    /// assembler mutates its tree with and a wire format could serialize —
    /// `Rc<dyn Fn() -> Stream<Node>>` itself never needs to survive this
    /// conversion, only the row-level deltas do.
    fn from(change: &Change) -> Self {
        match change {
            Change::Add { node } => ViewChange::Add { row: node.row.clone() },
            Change::Remove { node } => ViewChange::Remove { row: node.row.clone() },
            Change::Edit { node, old_node } => {
                ViewChange::Edit { row: node.row.clone(), old_row: old_node.row.clone() }
            }
            Change::Child { node, child } => ViewChange::Child {
                row: node.row.clone(),
                relationship_name: child.relationship_name.clone(),
                change: Box::new(ViewChange::from(child.change.as_ref())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(id: i64) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), Value::Number(id as f64));
        r
    }

    #[test]
    fn test_change_row_unwraps_each_variant() {
        let add = Change::Add { node: Node::new(row(1)) };
        assert_eq!(add.row(), &row(1));

        let edit = Change::Edit {
            node: Node::new(row(2)),
            old_node: Node::new(row(1)),
        };
        assert_eq!(edit.row(), &row(2));
    }

    #[test]
    fn test_view_change_child_carries_parent_row_for_lookup() {
        let inner = Change::Add { node: Node::new(row(10)) };
        let change = Change::Child {
            node: Node::new(row(1)),
            child: ChildChange { relationship_name: "comments".into(), change: Box::new(inner) },
        };
        let vc = ViewChange::from(&change);
        match vc {
            ViewChange::Child { row: parent_row, relationship_name, change } => {
                assert_eq!(parent_row, row(1));
                assert_eq!(relationship_name, "comments");
                assert!(matches!(*change, ViewChange::Add { .. }));
            }
            _ => panic!("expected Child"),
        }
    }

    #[test]
    fn test_node_relationship_thunk_is_lazy_until_called() {
        let calls = Rc::new(std::cell::RefCell::new(0));
        let calls2 = calls.clone();
        let node = Node::new(row(1)).with_relationship(
            "comments",
            Rc::new(move || {
                *calls2.borrow_mut() += 1;
                Stream::empty()
            }),
        );
        assert_eq!(*calls.borrow(), 0);
        let thunk = node.relationships.get("comments").unwrap();
        let _ = thunk();
        assert_eq!(*calls.borrow(), 1);
    }
}
