//! Skip (start/cursor) operator: `spec.md` §4.2.5.
//!
//! Implements the `start.row, exclusive` bound: rows are kept iff they
//! sort after (or, when not exclusive, at-or-after) `start.row` under the
//! active ordering. Pushes are filtered the same way Filter filters by a
//! boolean predicate, just with an ordering comparison standing in for
//! the predicate.

use crate::change::{Change, Node};
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::{Ordering, PrimaryKey, Row};
use crate::stream::Stream;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering as CmpOrdering;
use std::rc::Rc;

struct SkipInner {
    input: Box<dyn Input>,
    ordering: Ordering,
    pk: PrimaryKey,
    start_row: Row,
    exclusive: bool,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

pub struct Skip(Rc<SkipInner>);

impl Skip {
    pub fn new(
        input: Box<dyn Input>,
        ordering: Ordering,
        pk: PrimaryKey,
        start_row: Row,
        exclusive: bool,
    ) -> Skip {
        let inner = Rc::new(SkipInner {
            input,
            ordering,
            pk,
            start_row,
            exclusive,
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        });
        let weak = Rc::downgrade(&inner);
        inner.input.set_output(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                Skip::handle_push(&inner, change);
            }
        }));
        Skip(inner)
    }

    fn matches(inner: &SkipInner, row: &Row) -> bool {
        let cmp = inner.ordering.compare_rows(&inner.pk, row, &inner.start_row);
        if inner.exclusive {
            cmp == CmpOrdering::Greater
        } else {
            cmp != CmpOrdering::Less
        }
    }

    fn handle_push(inner: &Rc<SkipInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        let _span = crate::observability::operator_span("skip", &inner.input.get_schema().table).entered();
        let mut out = inner.output.borrow_mut();
        let Some(out) = out.as_mut() else { return };
        match change {
            Change::Add { node } => {
                if Skip::matches(inner, &node.row) {
                    out(Change::Add { node });
                }
            }
            Change::Remove { node } => {
                if Skip::matches(inner, &node.row) {
                    out(Change::Remove { node });
                }
            }
            Change::Edit { node, old_node } => {
                let new_matches = Skip::matches(inner, &node.row);
                let old_matches = Skip::matches(inner, &old_node.row);
                match (old_matches, new_matches) {
                    (true, true) => out(Change::Edit { node, old_node }),
                    (true, false) => out(Change::Remove { node: old_node }),
                    (false, true) => out(Change::Add { node }),
                    (false, false) => {}
                }
            }
            Change::Child { node, child } => {
                if Skip::matches(inner, &node.row) {
                    out(Change::Child { node, child });
                }
            }
        }
    }
}

impl Input for Skip {
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
        let _span = crate::observability::operator_span("skip", &self.0.input.get_schema().table).entered();
        let nodes: Vec<Node> = self
            .0
            .input
            .fetch()?
            .drain()
            .into_iter()
            .filter(|n| Skip::matches(&self.0, &n.row))
            .collect();
        Ok(Stream::new(nodes.into_iter()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::SortDir;
    use crate::source::{Source, SourceChange, SourceSchema};
    use crate::value::Value;

    fn schema() -> SourceSchema {
        SourceSchema {
            table: "issue".into(),
            columns: vec!["id".into()],
            primary_key: PrimaryKey::new(vec!["id".into()]),
        }
    }

    fn row(id: i64) -> Row {
        let mut r = Row::new();
        r.insert("id".into(), Value::Number(id as f64));
        r
    }

    fn ordering() -> Ordering {
        Ordering::new(vec![("id".into(), SortDir::Asc)])
    }

    #[test]
    fn test_exclusive_skip_drops_the_start_row_itself() {
        let src = Source::new(schema());
        for id in [1, 2, 3] {
            src.push(SourceChange::Add { row: row(id) }).unwrap();
        }
        let input = src.connect(ordering(), None, vec![], true);
        let skip = Skip::new(Box::new(input), ordering(), PrimaryKey::new(vec!["id".into()]), row(2), true);
        let ids: Vec<i64> = skip
            .fetch()
            .unwrap()
            .drain()
            .into_iter()
            .map(|n| n.row.get("id").unwrap().as_f64().unwrap() as i64)
            .collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn test_inclusive_skip_keeps_the_start_row() {
        let src = Source::new(schema());
        for id in [1, 2, 3] {
            src.push(SourceChange::Add { row: row(id) }).unwrap();
        }
        let input = src.connect(ordering(), None, vec![], true);
        let skip = Skip::new(Box::new(input), ordering(), PrimaryKey::new(vec!["id".into()]), row(2), false);
        let ids: Vec<i64> = skip
            .fetch()
            .unwrap()
            .drain()
            .into_iter()
            .map(|n| n.row.get("id").unwrap().as_f64().unwrap() as i64)
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
