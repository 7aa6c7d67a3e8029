//! Query intermediate representation.
//!
//! `spec.md` §3/§4.3: an `Ast` is built by the Query Object, never parsed
//! from query text — there is no SQL tokenizer or grammar anywhere in this
//! crate, by design.

use crate::row::{Ordering, SortDir};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A comparison operator usable in a `Condition::Simple`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimpleOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Is,
    IsNot,
    Like,
    NotLike,
    ILike,
    NotILike,
    In,
    NotIn,
}

/// The right- or left-hand operand of a `simple` condition: a column
/// reference or a literal value (including a literal array, for
/// `IN`/`NOT IN`, or a late-bound `Parameter`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operand {
    Column { name: String },
    Literal { value: Value },
    LiteralArray { values: Vec<Value> },
    Parameter(Parameter),
}

/// A late-bound reference resolved by the pipeline builder at construction
/// time, never plumbed through `fetch` at runtime (`spec.md` §9 resolves
/// this as a substitution pass over the AST / a join capture closure).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub anchor: ParameterAnchor,
    pub field: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterAnchor {
    AuthData,
    PreMutationRow,
}

/// The EXISTS/NOT EXISTS discriminator for a `correlatedSubquery`
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistsOp {
    Exists,
    NotExists,
}

/// A boolean expression tree over a table's rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    Simple {
        op: SimpleOp,
        left: Operand,
        right: Operand,
    },
    And {
        conditions: Vec<Condition>,
    },
    Or {
        conditions: Vec<Condition>,
    },
    CorrelatedSubquery {
        related: Box<CorrelatedSubquery>,
        op: ExistsOp,
    },
}

/// A compound-key correlation between a parent table field tuple and a
/// child table field tuple, e.g. `parentField: [issue_id], childField:
/// [id]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub parent_field: Vec<String>,
    pub child_field: Vec<String>,
}

/// One entry of an AST's `related` list: a correlated child query plus the
/// correlation that ties it to its parent row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Related {
    pub relationship_name: String,
    pub correlation: Correlation,
    /// Excluded from the assembled View (still drives `EXISTS` filtering
    /// and join fan-out) when true.
    #[serde(default)]
    pub hidden: bool,
    pub subquery: Box<Ast>,
}

/// A seek position for `start`: resume strictly after (`exclusive: true`)
/// or at-or-after the given anchor row's key/ordering columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Start {
    pub row: std::collections::BTreeMap<String, Value>,
    pub exclusive: bool,
}

/// The query intermediate representation. Constructed exclusively by the
/// Query Object's builder methods — never parsed from text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ast {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<Related>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<Start>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Ordering>,
}

/// Alias kept for readability at call sites that destructure a
/// `related[]` entry's nested query; `Ast::related` stores `Related`
/// directly, so this just documents the shape named in `spec.md` §3.
pub type CorrelatedSubquery = Related;

impl Ast {
    pub fn new(table: impl Into<String>) -> Self {
        Ast {
            schema: None,
            table: table.into(),
            alias: None,
            condition: None,
            related: Vec::new(),
            start: None,
            limit: None,
            order_by: None,
        }
    }

    /// The effective ordering: `order_by` if set, otherwise primary-key
    /// ascending (`spec.md` §3: "defaulting to primary-key ascending when
    /// omitted").
    pub fn effective_order_by(&self, pk_columns: &[String]) -> Ordering {
        self.order_by.clone().unwrap_or_else(|| {
            Ordering::new(
                pk_columns
                    .iter()
                    .map(|c| (c.clone(), SortDir::Asc))
                    .collect(),
            )
        })
    }
}
