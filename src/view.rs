//! View assembler: `spec.md` §4.4.
//!
//! Turns a pipeline's `fetch` result plus the `Change` stream it pushes
//! afterward into a hierarchical, copy-on-write result tree matching a
//! `Format`. Works directly from `Change` (which still carries each
//! `Node`'s relationship thunks) rather than from the `ViewChange`
//! projection `change.rs` defines — this assembler is the one place that
//! actually needs to invoke those thunks, to build the nested `View` for a
//! freshly added subtree; `ViewChange` exists for callers (e.g. a listener
//! or `channel`) that want a plain-data diff with no thunks to hold onto.
//!
//! Entries are `Rc`-shared so a mutation only allocates along the path
//! from the root to the changed node: untouched siblings keep their old
//! `Rc` (and so their old `Entry::PartialEq` identity), matching
//! `spec.md` §9's "mutate a cloned path from root" note and Testable
//! Property 8 (mutating a returned snapshot must not affect the next one
//! — trivially true here since every mutation produces new `View`/`Entry`
//! values rather than mutating in place).

use crate::change::{Change, ChildChange};
use crate::row::{Ordering, PrimaryKey, Row};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Per-query (or per-relationship) output shape: whether this level
/// projects to a single `Entry` or an array, the comparator and primary
/// key used to place/locate entries at this level, and the nested shape
/// of each declared (non-hidden) relationship. A hidden `related[]` entry
/// simply has no key here, which is what makes the assembler skip it —
/// `Node::relationships` may still carry a thunk for it (Join/Exists need
/// it for join fan-out / EXISTS filtering), but `build_entry` only ever
/// looks up names present in `relationships`.
#[derive(Debug, Clone, PartialEq)]
pub struct Format {
    pub singular: bool,
    pub pk: PrimaryKey,
    pub ordering: Ordering,
    pub relationships: BTreeMap<String, Format>,
}

impl Format {
    pub fn new(singular: bool, pk: PrimaryKey, ordering: Ordering) -> Self {
        Format { singular, pk, ordering, relationships: BTreeMap::new() }
    }

    pub fn with_relationship(mut self, name: impl Into<String>, format: Format) -> Self {
        self.relationships.insert(name.into(), format);
        self
    }
}

/// One materialized row: its own column values plus, for every declared
/// relationship, a nested `View`. `spec.md` describes an Entry as a single
/// mapping from column name to `Value` *or* nested `View`; splitting that
/// into `row`/`relationships` fields is an implementation-only choice —
/// the two together are exactly that mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub row: Row,
    pub relationships: BTreeMap<String, View>,
}

/// A materialized result: a single optional `Entry` (`Format.singular`) or
/// an ordered array of them. Immutable between commits; consumers hold a
/// `View` value (not a reference into the assembler) so a later mutation
/// can't retroactively change a snapshot already handed out.
#[derive(Debug, Clone, PartialEq)]
pub enum View {
    Single(Option<Rc<Entry>>),
    Many(Vec<Rc<Entry>>),
}

impl View {
    pub fn is_empty(&self) -> bool {
        match self {
            View::Single(e) => e.is_none(),
            View::Many(v) => v.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            View::Single(e) => e.is_some() as usize,
            View::Many(v) => v.len(),
        }
    }
}

fn build_entry(node: &crate::change::Node, format: &Format) -> Rc<Entry> {
    let mut relationships = BTreeMap::new();
    for (name, sub_format) in &format.relationships {
        let view = match node.relationships.get(name) {
            Some(thunk) => build_view(thunk().drain(), sub_format),
            None => empty_view(sub_format),
        };
        relationships.insert(name.clone(), view);
    }
    Rc::new(Entry { row: node.row.clone(), relationships })
}

fn empty_view(format: &Format) -> View {
    if format.singular {
        View::Single(None)
    } else {
        View::Many(Vec::new())
    }
}

fn build_view(nodes: Vec<crate::change::Node>, format: &Format) -> View {
    if format.singular {
        View::Single(nodes.iter().next().map(|n| build_entry(n, format)))
    } else {
        View::Many(nodes.iter().map(|n| build_entry(n, format)).collect())
    }
}

fn binary_position(format: &Format, entries: &[Rc<Entry>], row: &Row) -> usize {
    entries
        .binary_search_by(|e| format.ordering.compare_rows(&format.pk, &e.row, row))
        .unwrap_or_else(|pos| pos)
}

fn find_index(format: &Format, entries: &[Rc<Entry>], row: &Row) -> Option<usize> {
    let key = format.pk.extract(row);
    entries.iter().position(|e| format.pk.extract(&e.row) == key)
}

fn insert_entry(view: &View, format: &Format, entry: Rc<Entry>) -> View {
    if format.singular {
        return View::Single(Some(entry));
    }
    match view {
        View::Many(entries) => {
            let pos = binary_position(format, entries, &entry.row);
            let mut next = entries.clone();
            next.insert(pos, entry);
            View::Many(next)
        }
        View::Single(_) => unreachable!("non-singular Format never holds a Single view"),
    }
}

fn remove_entry(view: &View, format: &Format, row: &Row) -> View {
    match view {
        View::Single(entry) => {
            let key = format.pk.extract(row);
            match entry {
                Some(e) if format.pk.extract(&e.row) == key => View::Single(None),
                _ => view.clone(),
            }
        }
        View::Many(entries) => match find_index(format, entries, row) {
            Some(idx) => {
                let mut next = entries.clone();
                next.remove(idx);
                View::Many(next)
            }
            None => view.clone(),
        },
    }
}

fn edit_entry(view: &View, format: &Format, old_row: &Row, new_row: &Row) -> View {
    let old_relationships = match view {
        View::Single(Some(e)) if format.pk.extract(&e.row) == format.pk.extract(old_row) => {
            Some(e.relationships.clone())
        }
        View::Many(entries) => find_index(format, entries, old_row).map(|idx| entries[idx].relationships.clone()),
        _ => None,
    };
    let Some(relationships) = old_relationships else { return view.clone() };
    let new_entry = Rc::new(Entry { row: new_row.clone(), relationships });
    if format.singular {
        return View::Single(Some(new_entry));
    }
    // Reinsert rather than update-in-place: cheap relative to a fetch, and
    // correct regardless of whether the edit moved this row's position
    // under `format.ordering`.
    let without_old = remove_entry(view, format, old_row);
    insert_entry(&without_old, format, new_entry)
}

fn update_child(view: &View, format: &Format, parent_row: &Row, child: &ChildChange) -> View {
    let Some(sub_format) = format.relationships.get(&child.relationship_name) else {
        // Hidden or otherwise unprojected relationship: nothing to update.
        return view.clone();
    };
    let rebuild = |entry: &Rc<Entry>| -> Rc<Entry> {
        let old_child_view = entry.relationships.get(&child.relationship_name).cloned().unwrap_or_else(|| empty_view(sub_format));
        let new_child_view = apply_at(&old_child_view, sub_format, &child.change);
        let mut relationships = entry.relationships.clone();
        relationships.insert(child.relationship_name.clone(), new_child_view);
        Rc::new(Entry { row: entry.row.clone(), relationships })
    };
    match view {
        View::Single(Some(e)) if format.pk.extract(&e.row) == format.pk.extract(parent_row) => {
            View::Single(Some(rebuild(e)))
        }
        View::Single(_) => view.clone(),
        View::Many(entries) => match find_index(format, entries, parent_row) {
            Some(idx) => {
                let mut next = entries.clone();
                next[idx] = rebuild(&next[idx]);
                View::Many(next)
            }
            None => view.clone(),
        },
    }
}

fn apply_at(view: &View, format: &Format, change: &Change) -> View {
    match change {
        Change::Add { node } => insert_entry(view, format, build_entry(node, format)),
        Change::Remove { node } => remove_entry(view, format, &node.row),
        Change::Edit { node, old_node } => edit_entry(view, format, &old_node.row, &node.row),
        Change::Child { node, child } => update_child(view, format, &node.row, child),
    }
}

/// Whether a materialization's server registration has been acknowledged.
/// `spec.md` §4.6/GLOSSARY: starts `Unknown` (snapshot may be stale or
/// partial), flips to `Complete` once the server channel confirms "got".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    Unknown,
    Complete,
}

/// Owns one materialized query's current snapshot and notifies listeners
/// on commit. Constructed by the pipeline builder's caller (the query
/// lifecycle manager) from the root pipeline's initial `fetch` and the
/// root `Format`; subsequent `Change`s (from the root `Input::set_output`)
/// are applied via `apply`, and `notify` is called once per transaction by
/// the change coordinator.
pub struct ViewAssembler {
    format: Format,
    root: RefCell<View>,
    result_type: Cell<ResultType>,
    listeners: RefCell<Vec<Box<dyn Fn(&View, ResultType)>>>,
    ttl_ms: Cell<Option<u64>>,
    on_destroy: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl ViewAssembler {
    /// Build the initial tree from a root pipeline's `fetch` result.
    pub fn new(nodes: Vec<crate::change::Node>, format: Format) -> Self {
        let root = build_view(nodes, &format);
        ViewAssembler {
            format,
            root: RefCell::new(root),
            result_type: Cell::new(ResultType::Unknown),
            listeners: RefCell::new(Vec::new()),
            ttl_ms: Cell::new(None),
            on_destroy: RefCell::new(None),
        }
    }

    /// Inject the lifecycle manager's reference-count decrement, called
    /// once from `destroy`. Kept as a closure rather than a concrete
    /// `lifecycle::QueryLifecycleManager` handle so this module has no
    /// dependency on `lifecycle` (which depends on this one).
    pub fn set_on_destroy(&self, cb: Box<dyn FnOnce()>) {
        *self.on_destroy.borrow_mut() = Some(cb);
    }

    pub fn data(&self) -> View {
        self.root.borrow().clone()
    }

    pub fn result_type(&self) -> ResultType {
        self.result_type.get()
    }

    /// Apply one pipeline `Change` to the tree. Does not notify listeners
    /// by itself — the change coordinator calls `notify` once after every
    /// `Change` in a transaction has been applied, so consumers observe
    /// the net effect of a commit rather than an intermediate state.
    pub fn apply(&self, change: &Change) {
        let next = apply_at(&self.root.borrow(), &self.format, change);
        *self.root.borrow_mut() = next;
    }

    pub fn add_listener(&self, cb: Box<dyn Fn(&View, ResultType)>) {
        self.listeners.borrow_mut().push(cb);
    }

    pub fn notify(&self) {
        let root = self.root.borrow();
        let result_type = self.result_type.get();
        for listener in self.listeners.borrow().iter() {
            listener(&root, result_type);
        }
    }

    /// Flip `Unknown → Complete` on the server's "got" acknowledgement
    /// and fire listeners even if no row changed, per `spec.md` §4.6.
    pub fn mark_complete(&self) {
        if self.result_type.get() != ResultType::Complete {
            self.result_type.set(ResultType::Complete);
            self.notify();
        }
    }

    pub fn update_ttl(&self, ttl_ms: Option<u64>) {
        self.ttl_ms.set(ttl_ms);
    }

    pub fn ttl_ms(&self) -> Option<u64> {
        self.ttl_ms.get()
    }

    /// Idempotent: the lifecycle callback only fires once, on the first
    /// call.
    pub fn destroy(&self) {
        if let Some(cb) = self.on_destroy.borrow_mut().take() {
            cb();
        }
    }
}
