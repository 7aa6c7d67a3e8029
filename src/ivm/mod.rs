//! Incremental view maintenance: the operator graph and the builder that
//! assembles one from an `Ast`.
//!
//! Grounded in Gupta & Mumick's per-operator incremental maintenance
//! rules and the DBSP Z-set formulation: each operator in `operators`
//! maintains its output as a function of an upstream delta rather than
//! recomputing from scratch, and `builder` wires them into the graph a
//! query's `Ast` describes.

pub mod builder;
pub mod operators;
