//! Filter operator: `spec.md` §4.2.1.
//!
//! Filters an input stream by a compiled predicate over `simple`/`and`/
//! `or`/`correlatedSubquery` conditions. Edit changes are split when the
//! predicate's verdict flips: a pass-through `edit` is emitted iff both
//! the old and new row satisfy the predicate; otherwise a `remove`/`add`
//! pair is synthesized for whichever side(s) newly satisfy or newly stop
//! satisfying it.

use crate::ast::{Condition, ExistsOp, Operand, SimpleOp};
use crate::change::{Change, Node};
use crate::error::ZeroError;
use crate::operator::Input;
use crate::row::Row;
use crate::stream::Stream;
use crate::value::Value;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// A condition tree after `Parameter` operands have been substituted at
/// pipeline-build time (`spec.md` §9's resolution of late-bound
/// parameters) — the only thing left to evaluate per-row is columns and
/// literals, plus a relationship-existence lookup for `correlatedSubquery`
/// leaves, supplied by whatever Exists operator the builder wired
/// alongside this Filter for the same relationship.
#[derive(Debug, Clone)]
pub enum Compiled {
    Simple { op: SimpleOp, left: CompiledOperand, right: CompiledOperand },
    And(Vec<Compiled>),
    Or(Vec<Compiled>),
    CorrelatedSubquery { relationship_name: String, negate: bool },
}

#[derive(Debug, Clone)]
pub enum CompiledOperand {
    Column(String),
    Literal(Value),
    LiteralArray(Vec<Value>),
}

/// Substitute `Parameter` operands with their resolved value and drop the
/// distinction between an AST `Condition` and its compiled form. Panics if
/// a `Parameter` has no binding — callers must resolve all parameters
/// before compiling (an unresolved one is a `BuilderError`, surfaced by
/// the caller before reaching this function).
pub fn compile(cond: &Condition, resolve_param: &dyn Fn(&str, &str) -> Option<Value>) -> Compiled {
    match cond {
        Condition::Simple { op, left, right } => Compiled::Simple {
            op: *op,
            left: compile_operand(left, resolve_param),
            right: compile_operand(right, resolve_param),
        },
        Condition::And { conditions } => {
            Compiled::And(conditions.iter().map(|c| compile(c, resolve_param)).collect())
        }
        Condition::Or { conditions } => {
            Compiled::Or(conditions.iter().map(|c| compile(c, resolve_param)).collect())
        }
        Condition::CorrelatedSubquery { related, op } => Compiled::CorrelatedSubquery {
            relationship_name: related.relationship_name.clone(),
            negate: matches!(op, ExistsOp::NotExists),
        },
    }
}

fn compile_operand(op: &Operand, resolve_param: &dyn Fn(&str, &str) -> Option<Value>) -> CompiledOperand {
    match op {
        Operand::Column { name } => CompiledOperand::Column(name.clone()),
        Operand::Literal { value } => CompiledOperand::Literal(value.clone()),
        Operand::LiteralArray { values } => CompiledOperand::LiteralArray(values.clone()),
        Operand::Parameter(p) => {
            let anchor = match p.anchor {
                crate::ast::ParameterAnchor::AuthData => "authData",
                crate::ast::ParameterAnchor::PreMutationRow => "preMutationRow",
            };
            let value = resolve_param(anchor, &p.field)
                .expect("unresolved Parameter must be rejected before compile() is called");
            CompiledOperand::Literal(value)
        }
    }
}

fn resolve(operand: &CompiledOperand, row: &Row) -> OperandValue {
    match operand {
        CompiledOperand::Column(name) => {
            OperandValue::Scalar(row.get(name).cloned().unwrap_or(Value::Null))
        }
        CompiledOperand::Literal(v) => OperandValue::Scalar(v.clone()),
        CompiledOperand::LiteralArray(vs) => OperandValue::Array(vs.clone()),
    }
}

enum OperandValue {
    Scalar(Value),
    Array(Vec<Value>),
}

/// SQL `LIKE`/`ILIKE` matching: `%` any run of characters, `_` any single
/// character, `\` escapes the following metacharacter literally.
pub fn like_match(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    fn norm(s: &str, ci: bool) -> Vec<char> {
        if ci {
            s.to_lowercase().chars().collect()
        } else {
            s.chars().collect()
        }
    }
    let t = norm(text, case_insensitive);
    let p = norm(pattern, case_insensitive);

    // Classic DP over (text position, pattern position); small inputs in
    // practice (row values), so O(n*m) is fine.
    let (n, m) = (t.len(), p.len());
    let mut dp = vec![vec![false; m + 1]; n + 1];
    dp[0][0] = true;
    let mut pi = 0;
    while pi < m {
        if p[pi] == '%' {
            dp[0][pi + 1] = dp[0][pi];
        }
        pi += 1;
    }
    for ti in 0..n {
        let mut pi = 0;
        while pi < m {
            dp[ti + 1][pi + 1] = match p[pi] {
                '%' => dp[ti][pi + 1] || dp[ti + 1][pi],
                '_' => dp[ti][pi],
                '\\' if pi + 1 < m => dp[ti][pi] && t[ti] == p[pi + 1],
                c => dp[ti][pi] && t[ti] == c,
            };
            pi += 1;
        }
    }
    dp[n][m]
}

fn eval_simple(op: SimpleOp, left: &Row, lo: &CompiledOperand, ro: &CompiledOperand) -> bool {
    let l = resolve(lo, left);
    let r = resolve(ro, left);
    match (op, &l, &r) {
        (SimpleOp::Is, OperandValue::Scalar(a), OperandValue::Scalar(b)) => a.is_equal(b),
        (SimpleOp::IsNot, OperandValue::Scalar(a), OperandValue::Scalar(b)) => !a.is_equal(b),
        (SimpleOp::In, OperandValue::Scalar(a), OperandValue::Array(bs)) => {
            bs.iter().any(|b| a.partial_compare(b) == Some(std::cmp::Ordering::Equal))
        }
        (SimpleOp::NotIn, OperandValue::Scalar(a), OperandValue::Array(bs)) => {
            !bs.iter().any(|b| a.partial_compare(b) == Some(std::cmp::Ordering::Equal))
        }
        (SimpleOp::Like | SimpleOp::NotLike | SimpleOp::ILike | SimpleOp::NotILike, OperandValue::Scalar(a), OperandValue::Scalar(b)) => {
            let (Some(text), Some(pattern)) = (a.as_str(), b.as_str()) else {
                return false;
            };
            let ci = matches!(op, SimpleOp::ILike | SimpleOp::NotILike);
            let matched = like_match(text, pattern, ci);
            if matches!(op, SimpleOp::NotLike | SimpleOp::NotILike) {
                !matched
            } else {
                matched
            }
        }
        (_, OperandValue::Scalar(a), OperandValue::Scalar(b)) => {
            let Some(cmp) = a.partial_compare(b) else { return false };
            match op {
                SimpleOp::Eq => cmp == std::cmp::Ordering::Equal,
                SimpleOp::Neq => cmp != std::cmp::Ordering::Equal,
                SimpleOp::Lt => cmp == std::cmp::Ordering::Less,
                SimpleOp::Lte => cmp != std::cmp::Ordering::Greater,
                SimpleOp::Gt => cmp == std::cmp::Ordering::Greater,
                SimpleOp::Gte => cmp != std::cmp::Ordering::Less,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Evaluate a compiled condition against one row. `exists_lookup` answers
/// whether `row` currently has a matching child under the named
/// relationship — backed by an Exists-like lookup (pull- or push-based)
/// the builder wired alongside this Filter for that relationship. Takes
/// the row, not just the relationship name: existence is always relative
/// to which parent row is being tested.
pub fn evaluate(cond: &Compiled, row: &Row, exists_lookup: &dyn Fn(&str, &Row) -> bool) -> bool {
    match cond {
        Compiled::Simple { op, left, right } => eval_simple(*op, row, left, right),
        Compiled::And(cs) => cs.iter().all(|c| evaluate(c, row, exists_lookup)),
        Compiled::Or(cs) => cs.iter().any(|c| evaluate(c, row, exists_lookup)),
        Compiled::CorrelatedSubquery { relationship_name, negate } => {
            let exists = exists_lookup(relationship_name, row);
            if *negate { !exists } else { exists }
        }
    }
}

struct FilterInner {
    input: Box<dyn Input>,
    compiled: Compiled,
    exists_lookup: Rc<dyn Fn(&str, &Row) -> bool>,
    output: RefCell<Option<Box<dyn FnMut(Change)>>>,
    destroyed: Cell<bool>,
}

/// Filters the rows and pushes of its input by a compiled predicate.
pub struct Filter(Rc<FilterInner>);

impl Filter {
    pub fn new(
        input: Box<dyn Input>,
        compiled: Compiled,
        exists_lookup: Rc<dyn Fn(&str, &Row) -> bool>,
    ) -> Filter {
        let inner = Rc::new(FilterInner {
            input,
            compiled,
            exists_lookup,
            output: RefCell::new(None),
            destroyed: Cell::new(false),
        });
        let weak: Weak<FilterInner> = Rc::downgrade(&inner);
        inner.input.set_output(Box::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                Filter::handle_push(&inner, change);
            }
        }));
        Filter(inner)
    }

    fn matches(inner: &FilterInner, row: &Row) -> bool {
        evaluate(&inner.compiled, row, inner.exists_lookup.as_ref())
    }

    fn handle_push(inner: &Rc<FilterInner>, change: Change) {
        if inner.destroyed.get() {
            return;
        }
        let _span = crate::observability::operator_span("filter", &inner.input.get_schema().table).entered();
        let mut out = inner.output.borrow_mut();
        let Some(out) = out.as_mut() else { return };
        match change {
            Change::Add { node } => {
                if Filter::matches(inner, &node.row) {
                    out(Change::Add { node });
                }
            }
            Change::Remove { node } => {
                if Filter::matches(inner, &node.row) {
                    out(Change::Remove { node });
                }
            }
            Change::Edit { node, old_node } => {
                let new_matches = Filter::matches(inner, &node.row);
                let old_matches = Filter::matches(inner, &old_node.row);
                match (old_matches, new_matches) {
                    (true, true) => out(Change::Edit { node, old_node }),
                    (true, false) => out(Change::Remove { node: old_node }),
                    (false, true) => out(Change::Add { node }),
                    (false, false) => {}
                }
            }
            Change::Child { node, child } => {
                if Filter::matches(inner, &node.row) {
                    out(Change::Child { node, child });
                }
            }
        }
    }
}

impl Input for Filter {
    fn get_schema(&self) -> crate::source::SourceSchema {
        self.0.input.get_schema()
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
        let _span = crate::observability::operator_span("filter", &self.0.input.get_schema().table).entered();
        let nodes: Vec<Node> = self
            .0
            .input
            .fetch()?
            .drain()
            .into_iter()
            .filter(|n| Filter::matches(&self.0, &n.row))
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

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn always_false(_: &str, _: &Row) -> bool {
        false
    }

    #[test]
    fn test_like_match_percent_and_underscore() {
        assert!(like_match("hello", "h%o", false));
        assert!(like_match("hello", "h_llo", false));
        assert!(!like_match("hello", "h_o", false));
    }

    #[test]
    fn test_like_match_escaped_percent() {
        assert!(like_match("50%", "50\\%", false));
        assert!(!like_match("50x", "50\\%", false));
    }

    #[test]
    fn test_ilike_is_case_insensitive() {
        let eq = Compiled::Simple {
            op: SimpleOp::ILike,
            left: CompiledOperand::Column("name".into()),
            right: CompiledOperand::Literal(Value::String("ALICE".into())),
        };
        let r = row(&[("name", Value::String("alice".into()))]);
        assert!(evaluate(&eq, &r, &always_false));
    }

    #[test]
    fn test_is_null_participates_unlike_eq() {
        let is_null = Compiled::Simple {
            op: SimpleOp::Is,
            left: CompiledOperand::Column("deleted_at".into()),
            right: CompiledOperand::Literal(Value::Null),
        };
        let eq_null = Compiled::Simple {
            op: SimpleOp::Eq,
            left: CompiledOperand::Column("deleted_at".into()),
            right: CompiledOperand::Literal(Value::Null),
        };
        let r = row(&[("deleted_at", Value::Null)]);
        assert!(evaluate(&is_null, &r, &always_false));
        assert!(!evaluate(&eq_null, &r, &always_false));
    }

    #[test]
    fn test_in_matches_literal_array() {
        let in_cond = Compiled::Simple {
            op: SimpleOp::In,
            left: CompiledOperand::Column("status".into()),
            right: CompiledOperand::LiteralArray(vec![
                Value::String("open".into()),
                Value::String("closed".into()),
            ]),
        };
        let r = row(&[("status", Value::String("open".into()))]);
        assert!(evaluate(&in_cond, &r, &always_false));
    }

    #[test]
    fn test_or_requires_any_true() {
        let a = Compiled::Simple {
            op: SimpleOp::Eq,
            left: CompiledOperand::Column("a".into()),
            right: CompiledOperand::Literal(Value::Number(1.0)),
        };
        let b = Compiled::Simple {
            op: SimpleOp::Eq,
            left: CompiledOperand::Column("b".into()),
            right: CompiledOperand::Literal(Value::Number(2.0)),
        };
        let or = Compiled::Or(vec![a, b]);
        let r = row(&[("a", Value::Number(0.0)), ("b", Value::Number(2.0))]);
        assert!(evaluate(&or, &r, &always_false));
    }

    #[test]
    fn test_correlated_subquery_uses_exists_lookup() {
        let cond = Compiled::CorrelatedSubquery {
            relationship_name: "comments".into(),
            negate: false,
        };
        let r = row(&[]);
        assert!(evaluate(&cond, &r, &|name, _row| name == "comments"));
        assert!(!evaluate(&cond, &r, &|name, _row| name != "comments"));
    }
}
