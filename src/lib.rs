//! zero-ivm — a client-side incremental view maintenance engine for a
//! synchronizing relational query layer.
//!
//! Applications declare a typed schema and compose relational queries
//! (filters, joins via declared relationships, ordering, bounded ranges,
//! limit, singular projection). The engine materializes each query into a
//! live view kept consistent under a stream of row-level changes from a
//! local persistent store and a remote authoritative source.
//!
//! # Theoretical basis
//!
//! - **DBSP**: Budiu et al., "DBSP: Automatic Differential View
//!   Maintenance for Rich Query Languages", PVLDB 2023.
//!   <https://arxiv.org/abs/2203.16684>
//! - **Gupta & Mumick (1995)**: "Maintenance of Materialized Views:
//!   Problems, Techniques, and Applications", IEEE Data Engineering
//!   Bulletin.
//!
//! # Scope
//!
//! In scope: the query IR (`ast`), the IVM pipeline (`source`, `ivm`),
//! the view assembly layer (`view`), and the query lifecycle manager
//! (`lifecycle`). Out of scope, treated as external collaborators: network
//! transport, the persistent KV store's own implementation, custom
//! mutators, permission compilation, and UI framework bindings — see
//! `channel` and `storage` for the trait seams those integrate through.

#![allow(dead_code)]

pub mod ast;
pub mod change;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod ivm;
pub mod lifecycle;
pub mod observability;
pub mod operator;
pub mod query;
pub mod row;
pub mod source;
pub mod storage;
pub mod stream;
pub mod value;
pub mod view;

pub use error::ZeroError;
