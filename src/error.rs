//! Error types for the IVM engine.
//!
//! All fallible engine operations return `Result<T, ZeroError>`. Errors are
//! classified into the categories `spec.md` §7 describes, which determine
//! whether they abort the current transaction's commit or are merely
//! reported to the embedder while the pipeline keeps running on cached
//! data.
//!
//! # Error Classification
//!
//! - **Invariant** — programmer error (PK collision, double-fetch of a
//!   destroyed input). Fatal, surfaced synchronously, never retried.
//! - **Builder** — an AST references an unknown table/column/relationship,
//!   an unresolved `Parameter` at fetch time, or an incompatible `one()`.
//!   Surfaced at materialize time.
//! - **Storage** — propagated from the KV store. Fatal for the current
//!   transaction; the view update is aborted without a partial snapshot.
//! - **Server** — `ServerAuthError` / `SchemaVersionMismatch` /
//!   `ClientStateNotFound` / `ConnectionClosed`, delivered from the server
//!   channel. Reported via `onError`; the local pipeline keeps running.
//! - **Transform** — a named-query transform request failed (`app` error).
//!   Scoped to the one query whose `complete` future rejects.

use thiserror::Error;

/// Primary error type for the engine.
#[derive(Debug, Error)]
pub enum ZeroError {
    // ── Invariant violations — fatal, never retried ──────────────────────
    /// A `push` would create two rows with the same primary key.
    #[error("invariant violation: duplicate primary key {0:?} in add")]
    DuplicatePrimaryKey(Vec<String>),

    /// A `remove`/`edit` referenced a primary key with no matching row.
    #[error("invariant violation: no row with primary key {0:?} to {1}")]
    MissingPrimaryKey(Vec<String>, &'static str),

    /// `fetch`/`push` was called on an `Input` after `destroy()`.
    #[error("invariant violation: input used after destroy")]
    UseAfterDestroy,

    // ── Builder errors — surfaced at materialize time ────────────────────
    /// The AST names a table the `BuilderDelegate` has no `Source` for.
    #[error("builder error: unknown table '{0}'")]
    UnknownTable(String),

    /// The AST names a relationship the schema does not declare.
    #[error("builder error: unknown relationship '{0}' on table '{1}'")]
    UnknownRelationship(String, String),

    /// A `where` clause references a column not in the table schema.
    #[error("builder error: unknown column '{0}' on table '{1}'")]
    UnknownColumn(String, String),

    /// A late-bound `Parameter` had no value at pipeline-build time.
    #[error("builder error: unresolved parameter {anchor}.{field}")]
    UnresolvedParameter { anchor: String, field: String },

    /// `one()` was combined with a `Format` that cannot be reconciled
    /// (e.g. nested under an array relationship expecting multiple rows).
    #[error("builder error: one() is incompatible with outer format")]
    IncompatibleFormat,

    /// A TTL string didn't match the `Ns|Nm|Nh|Nd|Ny`/`forever`/`none`
    /// grammar `spec.md` §4.6 defines.
    #[error("builder error: invalid ttl '{0}'")]
    InvalidTtl(String),

    // ── Storage errors — abort the current transaction ───────────────────
    /// The backing key/value store reported a failure.
    #[error("storage error: {0}")]
    Storage(String),

    // ── Server channel errors — reported, pipeline keeps running ─────────
    #[error("server auth error: {0}")]
    ServerAuthError(String),

    #[error("schema version mismatch: client={client_version}, server={server_version}")]
    SchemaVersionMismatch {
        client_version: String,
        server_version: String,
    },

    #[error("client state not found: {0}")]
    ClientStateNotFound(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    // ── Transform errors — scoped to one named query ─────────────────────
    #[error("transform error for query '{name}': {details}")]
    TransformError { name: String, details: String },
}

/// Coarse classification used by the lifecycle manager's `onError` routing
/// and by observability to decide log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroErrorKind {
    Invariant,
    Builder,
    Storage,
    Server,
    Transform,
}

impl ZeroError {
    /// Classify this error.
    pub fn kind(&self) -> ZeroErrorKind {
        use ZeroError::*;
        match self {
            DuplicatePrimaryKey(_) | MissingPrimaryKey(..) | UseAfterDestroy => {
                ZeroErrorKind::Invariant
            }
            UnknownTable(_)
            | UnknownRelationship(..)
            | UnknownColumn(..)
            | UnresolvedParameter { .. }
            | IncompatibleFormat
            | InvalidTtl(_) => ZeroErrorKind::Builder,
            Storage(_) => ZeroErrorKind::Storage,
            ServerAuthError(_)
            | SchemaVersionMismatch { .. }
            | ClientStateNotFound(_)
            | ConnectionClosed(_) => ZeroErrorKind::Server,
            TransformError { .. } => ZeroErrorKind::Transform,
        }
    }

    /// Whether this error must abort the in-progress commit and leave the
    /// view at its last consistent snapshot, per `spec.md` §7's
    /// propagation policy.
    pub fn aborts_commit(&self) -> bool {
        matches!(self.kind(), ZeroErrorKind::Invariant | ZeroErrorKind::Storage)
    }

    /// Whether the engine is fatally broken and should not self-recover
    /// (as opposed to server errors, which leave cached data usable).
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ZeroErrorKind::Invariant)
    }
}
