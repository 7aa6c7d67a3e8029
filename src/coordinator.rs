//! Change Coordinator: `spec.md` §4.7.
//!
//! Batches the `Source.push` calls made between transaction start and
//! commit, then notifies every registered view assembler exactly once,
//! so UI frameworks observe one net update per transaction instead of one
//! per intermediate row change. Grounded on the apply/notify split
//! `view::ViewAssembler` already exposes (`apply` mutates immediately,
//! `notify` fans out to listeners) — this module is the single place that
//! decides *when* that second half runs, composing it with `Source`'s own
//! synchronous, registration-ordered push fan-out.
//!
//! `spec.md` §4.7 literally reads "signals every view assembler to
//! finalize" — taken at face value here rather than tracked per-source
//! dirty sets: `notify` only dispatches to listeners (no recomputation),
//! so the cost of notifying an assembler nothing changed is the same as
//! checking whether it needed notifying in the first place, and this
//! engine has no Source→ViewAssembler reachability map to consult anyway.
//!
//! Read-your-writes within a transaction falls out for free: `Source::push`
//! mutates its row map synchronously, so any `fetch` issued later in the
//! same transaction already observes it — no buffering needed here.

use crate::error::ZeroError;
use crate::source::{Source, SourceChange};
use crate::view::ViewAssembler;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

struct Inner {
    views: RefCell<Vec<Rc<ViewAssembler>>>,
    depth: Cell<u32>,
}

/// Cheaply cloneable (`Rc`) handle shared by every part of an embedding
/// application that pushes changes or registers a materialized view.
#[derive(Clone)]
pub struct ChangeCoordinator(Rc<Inner>);

impl ChangeCoordinator {
    pub fn new() -> Self {
        ChangeCoordinator(Rc::new(Inner {
            views: RefCell::new(Vec::new()),
            depth: Cell::new(0),
        }))
    }

    /// Track a materialized view so it is notified at the end of every
    /// top-level transaction. The query lifecycle manager registers each
    /// `ViewAssembler` it builds here, and unregisters it on `destroy`.
    pub fn register_view(&self, view: Rc<ViewAssembler>) {
        self.0.views.borrow_mut().push(view);
    }

    pub fn unregister_view(&self, view: &Rc<ViewAssembler>) {
        self.0.views.borrow_mut().retain(|v| !Rc::ptr_eq(v, view));
    }

    pub fn in_transaction(&self) -> bool {
        self.0.depth.get() > 0
    }

    /// Run `f` as one transaction. Nested calls share the outermost
    /// transaction's commit point — only the outermost `transaction` call
    /// notifies listeners, per `spec.md` §4.7's batching. If `f` returns an
    /// error that `ZeroErrorKind::aborts_commit()`, the already-applied
    /// `ViewAssembler` mutations are left in place (no rollback machinery
    /// exists) but listeners are not notified of them, matching the "no
    /// partial snapshot observed" propagation policy in `spec.md` §7.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, ZeroError>
    where
        F: FnOnce() -> Result<T, ZeroError>,
    {
        self.0.depth.set(self.0.depth.get() + 1);
        let result = f();
        let depth = self.0.depth.get() - 1;
        self.0.depth.set(depth);
        if depth == 0 {
            let aborted = matches!(&result, Err(e) if e.aborts_commit());
            if !aborted {
                for view in self.0.views.borrow().iter() {
                    view.notify();
                }
            }
        }
        result
    }

    /// Convenience for the common single-push transaction.
    pub fn push(&self, source: &Source, change: SourceChange) -> Result<(), ZeroError> {
        self.transaction(|| source.push(change))
    }
}

impl Default for ChangeCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Ordering, PrimaryKey, Row, SortDir};
    use crate::source::SourceSchema;
    use crate::value::Value;
    use crate::view::Format;
    use std::cell::RefCell as StdRefCell;

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

    fn format() -> Format {
        Format::new(false, PrimaryKey::new(vec!["id".into()]), Ordering::new(vec![("id".into(), SortDir::Asc)]))
    }

    fn wired_view(source: &Source) -> Rc<ViewAssembler> {
        use crate::operator::Input;
        let input = source.connect(Ordering::empty(), None, vec![], true);
        let nodes = input.fetch().unwrap().drain();
        let view = Rc::new(ViewAssembler::new(nodes, format()));
        let view_for_push = view.clone();
        input.set_output(Box::new(move |change| view_for_push.apply(&change)));
        view
    }

    #[test]
    fn test_single_push_notifies_registered_view_once() {
        let source = Source::new(schema());
        let coordinator = ChangeCoordinator::new();
        let view = wired_view(&source);
        coordinator.register_view(view.clone());

        let count = Rc::new(StdRefCell::new(0));
        let count2 = count.clone();
        view.add_listener(Box::new(move |_, _| *count2.borrow_mut() += 1));

        coordinator.push(&source, SourceChange::Add { row: row(1, "a") }).unwrap();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_nested_transaction_notifies_only_once_at_outermost_commit() {
        let source = Source::new(schema());
        let coordinator = ChangeCoordinator::new();
        let view = wired_view(&source);
        coordinator.register_view(view.clone());

        let count = Rc::new(StdRefCell::new(0));
        let count2 = count.clone();
        view.add_listener(Box::new(move |_, _| *count2.borrow_mut() += 1));

        coordinator
            .transaction(|| {
                coordinator.push(&source, SourceChange::Add { row: row(1, "a") })?;
                coordinator.push(&source, SourceChange::Add { row: row(2, "b") })?;
                Ok(())
            })
            .unwrap();
        assert_eq!(*count.borrow(), 1, "two pushes inside one transaction notify exactly once");
    }

    #[test]
    fn test_unregistered_view_is_never_notified() {
        let source = Source::new(schema());
        let coordinator = ChangeCoordinator::new();
        let view = wired_view(&source);
        coordinator.register_view(view.clone());
        coordinator.unregister_view(&view);

        let count = Rc::new(StdRefCell::new(0));
        let count2 = count.clone();
        view.add_listener(Box::new(move |_, _| *count2.borrow_mut() += 1));

        coordinator.push(&source, SourceChange::Add { row: row(1, "a") }).unwrap();
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn test_committing_invariant_error_skips_notify() {
        let source = Source::new(schema());
        let coordinator = ChangeCoordinator::new();
        let view = wired_view(&source);
        coordinator.register_view(view.clone());

        let count = Rc::new(StdRefCell::new(0));
        let count2 = count.clone();
        view.add_listener(Box::new(move |_, _| *count2.borrow_mut() += 1));

        let err = coordinator
            .transaction(|| {
                source.push(SourceChange::Add { row: row(1, "a") })?;
                source.push(SourceChange::Remove { row: row(99, "missing") })
            })
            .unwrap_err();
        assert!(err.aborts_commit());
        assert_eq!(*count.borrow(), 0, "listeners never see the partially-applied aborted transaction");
    }

    #[test]
    fn test_in_transaction_reflects_nesting_depth() {
        let coordinator = ChangeCoordinator::new();
        assert!(!coordinator.in_transaction());
        coordinator
            .transaction(|| {
                assert!(coordinator.in_transaction());
                coordinator.transaction(|| {
                    assert!(coordinator.in_transaction());
                    Ok(())
                })
            })
            .unwrap();
        assert!(!coordinator.in_transaction());
    }
}
