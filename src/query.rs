//! Query Object: `spec.md` §4.5.
//!
//! An immutable AST builder. Every method takes `&self` and returns a new
//! `Query`, so a partially built query can be reused as the base for
//! several branches (e.g. the same `issue` query filtered two different
//! ways) without either branch observing the other's additions — the
//! "immutable builder" `spec.md` describes.
//!
//! `materialize`/`run`/`preload` are deliberately NOT methods here: in the
//! original API they close over an implicit engine instance, but this
//! crate has no such singleton. Those operations live on
//! `crate::lifecycle::QueryLifecycleManager`, which takes a `&Query` —
//! keeping this module a plain value type with no dependency on the
//! lifecycle/view machinery that consumes it.

use crate::ast::{Ast, Condition, Correlation, ExistsOp, Operand, Parameter, Related, Start};
use crate::error::ZeroError;
use crate::hash;
use crate::ivm::builder::BuilderDelegate;
use crate::row::SortDir;
use crate::value::Value;
use crate::view::Format;
use serde_json::Value as Json;

/// The right-hand side of a `filter` call: a literal, a literal array (for
/// `IN`/`NOT IN`), or a late-bound `Parameter` resolved by the pipeline
/// builder at construction time.
#[derive(Debug, Clone)]
pub enum FilterValue {
    Literal(Value),
    Array(Vec<Value>),
    Parameter(Parameter),
}

impl From<Value> for FilterValue {
    fn from(v: Value) -> Self {
        FilterValue::Literal(v)
    }
}

impl From<Vec<Value>> for FilterValue {
    fn from(v: Vec<Value>) -> Self {
        FilterValue::Array(v)
    }
}

impl From<Parameter> for FilterValue {
    fn from(p: Parameter) -> Self {
        FilterValue::Parameter(p)
    }
}

fn to_operand(v: FilterValue) -> Operand {
    match v {
        FilterValue::Literal(value) => Operand::Literal { value },
        FilterValue::Array(values) => Operand::LiteralArray { values },
        FilterValue::Parameter(p) => Operand::Parameter(p),
    }
}

/// Immutable query builder; constructs an `Ast` without ever parsing query
/// text, per `spec.md` §4.5/§9.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    ast: Ast,
    name_and_args: Option<(String, Json)>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Query { ast: Ast::new(table), name_and_args: None }
    }

    pub fn ast(&self) -> &Ast {
        &self.ast
    }

    pub fn into_ast(self) -> Ast {
        self.ast
    }

    pub fn schema(&self, schema: impl Into<String>) -> Query {
        let mut q = self.clone();
        q.ast.schema = Some(schema.into());
        q
    }

    pub fn alias(&self, alias: impl Into<String>) -> Query {
        let mut q = self.clone();
        q.ast.alias = Some(alias.into());
        q
    }

    /// `where(field, op, value)`. Successive calls AND together, flattening
    /// into a single top-level `Condition::And` rather than nesting.
    pub fn filter(&self, field: impl Into<String>, op: crate::ast::SimpleOp, value: impl Into<FilterValue>) -> Query {
        let cond = Condition::Simple {
            op,
            left: Operand::Column { name: field.into() },
            right: to_operand(value.into()),
        };
        self.and_condition(cond)
    }

    /// `where(field, value)` — the omitted-`op` shorthand `spec.md` §4.5
    /// describes, defaulting to `=`.
    pub fn filter_eq(&self, field: impl Into<String>, value: impl Into<FilterValue>) -> Query {
        self.filter(field, crate::ast::SimpleOp::Eq, value)
    }

    fn and_condition(&self, cond: Condition) -> Query {
        let mut q = self.clone();
        q.ast.condition = Some(match q.ast.condition.take() {
            None => cond,
            Some(Condition::And { mut conditions }) => {
                conditions.push(cond);
                Condition::And { conditions }
            }
            Some(existing) => Condition::And { conditions: vec![existing, cond] },
        });
        q
    }

    /// `related(name, subBuilder)`: appends a projected correlated
    /// subquery. `child_table` and `correlation` stand in for "the
    /// schema-declared relationship" `spec.md` names — this crate has no
    /// global schema registry, so the caller supplies them at the call
    /// site, the same dependency-injection shape `BuilderDelegate` uses
    /// elsewhere.
    pub fn related(
        &self,
        name: impl Into<String>,
        child_table: impl Into<String>,
        correlation: Correlation,
        build: impl FnOnce(Query) -> Query,
    ) -> Query {
        let sub = build(Query::new(child_table));
        let mut q = self.clone();
        q.ast.related.push(Related {
            relationship_name: name.into(),
            correlation,
            hidden: false,
            subquery: Box::new(sub.ast),
        });
        q
    }

    /// `whereExists(name, subBuilder)` shorthand for an EXISTS
    /// correlated-subquery condition.
    pub fn where_exists(
        &self,
        name: impl Into<String>,
        child_table: impl Into<String>,
        correlation: Correlation,
        build: impl FnOnce(Query) -> Query,
    ) -> Query {
        self.add_exists(name, child_table, correlation, build, ExistsOp::Exists)
    }

    pub fn where_not_exists(
        &self,
        name: impl Into<String>,
        child_table: impl Into<String>,
        correlation: Correlation,
        build: impl FnOnce(Query) -> Query,
    ) -> Query {
        self.add_exists(name, child_table, correlation, build, ExistsOp::NotExists)
    }

    fn add_exists(
        &self,
        name: impl Into<String>,
        child_table: impl Into<String>,
        correlation: Correlation,
        build: impl FnOnce(Query) -> Query,
        op: ExistsOp,
    ) -> Query {
        let sub = build(Query::new(child_table));
        let cond = Condition::CorrelatedSubquery {
            related: Box::new(Related {
                relationship_name: name.into(),
                correlation,
                hidden: true,
                subquery: Box::new(sub.ast),
            }),
            op,
        };
        self.and_condition(cond)
    }

    /// `or(subBuilder, subBuilder, ...)`: ANDs in an OR of each branch's
    /// condition. Each branch is built against a fresh query scoped to this
    /// table; anything other than the condition it attaches (`related`,
    /// `orderBy`, ...) is discarded, the same restriction `spec.md` §4.5
    /// places on `or`'s branches.
    pub fn or(&self, branches: Vec<Box<dyn FnOnce(Query) -> Query>>) -> Query {
        let conditions: Vec<Condition> = branches
            .into_iter()
            .map(|build| {
                let built = build(Query::new(self.ast.table.clone()));
                built.ast.condition.unwrap_or(Condition::And { conditions: Vec::new() })
            })
            .collect();
        self.and_condition(Condition::Or { conditions })
    }

    /// `start(partialRow, {inclusive})`.
    pub fn start(&self, row: crate::row::Row, inclusive: bool) -> Query {
        let mut q = self.clone();
        q.ast.start = Some(Start { row, exclusive: !inclusive });
        q
    }

    pub fn limit(&self, n: u32) -> Query {
        let mut q = self.clone();
        q.ast.limit = Some(n);
        q
    }

    /// `orderBy(field, dir)`. Successive calls append components, building
    /// up a composite ordering in call order.
    pub fn order_by(&self, field: impl Into<String>, dir: SortDir) -> Query {
        let mut q = self.clone();
        let mut components = q.ast.order_by.take().map(|o| o.0).unwrap_or_default();
        components.push((field.into(), dir));
        q.ast.order_by = Some(crate::row::Ordering::new(components));
        q
    }

    /// `one()`: caps the result to a single row. `Format.singular` is
    /// derived from `ast.limit == Some(1)` by `build_format` below rather
    /// than tracked as separate state, so this is equivalent to `limit(1)`
    /// plus that downstream convention.
    pub fn one(&self) -> Query {
        self.limit(1)
    }

    /// `nameAndArgs(name, args)`: turns this into a custom query,
    /// registered with the server by `(name, args)` rather than by AST
    /// hash (`spec.md` §4.5's client/server hash-identity split).
    pub fn name_and_args(&self, name: impl Into<String>, args: Json) -> Query {
        let mut q = self.clone();
        q.name_and_args = Some((name.into(), args));
        q
    }

    pub fn name_and_args_ref(&self) -> Option<&(String, Json)> {
        self.name_and_args.as_ref()
    }

    /// Client-side identity: always the canonical AST hash, used to dedupe
    /// locally materialized pipelines regardless of whether this query is
    /// named.
    pub fn client_hash(&self) -> String {
        hash::hash_ast(&self.ast)
    }

    /// Server-side identity: `(name, args)` for a named custom query,
    /// otherwise the same AST hash (an ad-hoc query registers under its
    /// own AST, with `name` implicitly the reserved ad-hoc constant).
    pub fn server_hash(&self) -> String {
        match &self.name_and_args {
            Some((name, args)) => hash::hash_custom_query(name, args),
            None => self.client_hash(),
        }
    }

    /// Build the `Format` tree this query's `View` will be assembled
    /// against: `singular`/`pk`/`ordering` per level plus every non-hidden
    /// `related[]` entry, recursively. Uses the same `BuilderDelegate` the
    /// pipeline builder does, so a table's primary key and effective
    /// ordering are resolved identically in both places.
    pub fn build_format(&self, delegate: &dyn BuilderDelegate) -> Result<Format, ZeroError> {
        build_format_for(&self.ast, delegate)
    }
}

fn build_format_for(ast: &Ast, delegate: &dyn BuilderDelegate) -> Result<Format, ZeroError> {
    let mapped = delegate.map_ast(ast);
    let source = delegate.get_source(mapped.schema.as_deref(), &mapped.table)?;
    let schema = source.schema();
    let pk = schema.primary_key.clone();
    let ordering = mapped.effective_order_by(pk.columns());
    let singular = mapped.limit == Some(1);
    let mut format = Format::new(singular, pk, ordering);
    for related in &mapped.related {
        if related.hidden {
            continue;
        }
        let child_format = build_format_for(&related.subquery, delegate)?;
        format = format.with_relationship(related.relationship_name.clone(), child_format);
    }
    Ok(format)
}
