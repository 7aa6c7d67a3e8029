//! Take (limit) operator: `spec.md` §4.2.4.
//!
//! Retains the first `limit` nodes of the upstream ordering in an
//! in-memory window (the idiomatic equivalent of the ordering-key-indexed
//! Storage the pipeline builder could otherwise back it with — here a
//! sorted `Vec` plays that role directly, since the window only ever
//! holds `limit` entries). The last window entry is the "boundary": any
//! incoming row that sorts before it evicts it.

use crate::change::{Change, Node};
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::{Ordering, PrimaryKey, RowKey};
use crate::stream::Stream;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

struct TakeInner {
    input: Box<dyn Input>,
    limit: usize,
    ordering: Ordering,
    pk: PrimaryKey,
    window: RefCell<Vec<Node>>,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

pub struct Take(Rc<TakeInner>);

impl Take {
    pub fn new(
        input: Box<dyn Input>,
        limit: usize,
        ordering: Ordering,
        pk: PrimaryKey,
    ) -> Result<Take, ZeroError> {
        let initial: Vec<Node> = input.fetch()?.drain().into_iter().take(limit).collect();
        let inner = Rc::new(TakeInner {
            input,
            limit,
            ordering,
            pk,
            window: RefCell::new(initial),
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        });
        let weak = Rc::downgrade(&inner);
        inner.input.set_output(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                Take::handle_push(&inner, change);
            }
        }));
        Ok(Take(inner))
    }

    fn position(inner: &TakeInner, window: &[Node], row: &crate::row::Row) -> usize {
        window
            .binary_search_by(|n| inner.ordering.compare_rows(&inner.pk, &n.row, row))
            .unwrap_or_else(|pos| pos)
    }

    fn index_of(inner: &TakeInner, window: &[Node], key: &RowKey) -> Option<usize> {
        window.iter().position(|n| &inner.pk.extract(&n.row) == key)
    }

    fn emit(inner: &TakeInner, change: Change) {
        if let Some(out) = inner.output.borrow_mut().as_mut() {
            out(change);
        }
    }

    fn handle_add(inner: &Rc<TakeInner>, node: Node) {
        let mut window = inner.window.borrow_mut();
        let pos = Take::position(inner, &window, &node.row);
        if window.len() < inner.limit {
            window.insert(pos, node.clone());
            drop(window);
            Take::emit(inner, Change::Add { node });
        } else if pos < inner.limit {
            window.insert(pos, node.clone());
            let evicted = window.pop().expect("window was at capacity");
            drop(window);
            Take::emit(inner, Change::Remove { node: evicted });
            Take::emit(inner, Change::Add { node });
        }
        // else: sorts at or past the boundary of a full window, dropped.
    }

    fn handle_remove(inner: &Rc<TakeInner>, node: Node) {
        let key = inner.pk.extract(&node.row);
        let mut window = inner.window.borrow_mut();
        let Some(idx) = Take::index_of(inner, &window, &key) else {
            return;
        };
        window.remove(idx);
        drop(window);
        Take::emit(inner, Change::Remove { node });

        if inner.window.borrow().len() < inner.limit {
            if let Ok(all) = inner.input.fetch() {
                let present: Vec<RowKey> =
                    inner.window.borrow().iter().map(|n| inner.pk.extract(&n.row)).collect();
                for candidate in all.drain() {
                    let ckey = inner.pk.extract(&candidate.row);
                    if !present.contains(&ckey) {
                        let pos = Take::position(inner, &inner.window.borrow(), &candidate.row);
                        inner.window.borrow_mut().insert(pos, candidate.clone());
                        Take::emit(inner, Change::Add { node: candidate });
                        break;
                    }
                }
            }
        }
    }

    fn handle_push(inner: &Rc<TakeInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        let _span = crate::observability::operator_span("take", &inner.input.get_schema().table).entered();
        match change {
            Change::Add { node } => Take::handle_add(inner, node),
            Change::Remove { node } => Take::handle_remove(inner, node),
            Change::Edit { node, old_node } => {
                if inner.ordering.compare_rows(&inner.pk, &old_node.row, &node.row)
                    == std::cmp::Ordering::Equal
                {
                    let key = inner.pk.extract(&node.row);
                    let in_window = {
                        let window = inner.window.borrow();
                        Take::index_of(inner, &window, &key)
                    };
                    if let Some(idx) = in_window {
                        inner.window.borrow_mut()[idx] = node.clone();
                        Take::emit(inner, Change::Edit { node, old_node });
                    }
                } else {
                    Take::handle_remove(inner, old_node);
                    Take::handle_add(inner, node);
                }
            }
            Change::Child { node, child } => {
                let key = inner.pk.extract(&node.row);
                let in_window = {
                    let window = inner.window.borrow();
                    Take::index_of(inner, &window, &key)
                };
                if in_window.is_some() {
                    Take::emit(inner, Change::Child { node, child });
                }
            }
        }
    }
}

impl Input for Take {
    fn get_schema(&self) -> crate::source::SourceSchema {
        self.0.input.get_schema()
    }

    fn fully_applied_filters(&self) -> bool {
        self.0.input.fully_applied_filters()
    }

    fn set_output(&self, output: Box<dyn FnMut(Change)>) {
        *self.0.output.borrow_mut() = Some(output);
    }

    fn fetch(&self) -> Result<Stream<Node>, ZeroError> {
        if self.0.destroyed.get() {
            return Err(ZeroError::UseAfterDestroy);
        }
        let _span = crate::observability::operator_span("take", &self.0.input.get_schema().table).entered();
        Ok(Stream::new(self.0.window.borrow().clone().into_iter()))
    }

    fn cleanup(&self) -> Result<Stream<Node>, ZeroError> {
        self.0.input.cleanup()
    }

    fn destroy(&self) {
        self.0.destroyed.set(true);
        *self.0.output.borrow_mut() = None;
        self.0.input.destroy();
    }
}
