//! Relational operators: Filter, Skip, Take, Join, Exists, Fan-out/Fan-in.
//!
//! Every operator here implements `crate::operator::Input` and is built
//! bottom-up by `crate::ivm::builder`: each operator owns its upstream
//! `Box<dyn Input>` and wires itself in as that input's output via a
//! `Weak`-capturing closure, so the object graph has no reference cycles
//! even though changes flow upward and fetches flow downward through the
//! same edges.

pub mod exists;
pub mod fanout;
pub mod filter;
pub mod filter_pipeline;
pub mod join;
pub mod join_common;
pub mod skip;
pub mod take;
