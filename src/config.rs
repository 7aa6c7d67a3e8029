//! Runtime configuration for the IVM engine.
//!
//! The teacher crate this engine is descended from exposed its tunables as
//! PostgreSQL GUCs, registered in `_PG_init()`. This engine has no
//! PostgreSQL host to register GUCs with, so the equivalent ambient
//! concern is a plain, `serde`-deserializable struct that an embedding
//! application constructs directly or loads from its own config file.

use serde::{Deserialize, Serialize};

/// Tunables for the query lifecycle manager and change coordinator.
///
/// See `spec.md` §4.6 for the semantics of each field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long the lifecycle manager batches `QueriesPatch` emissions
    /// before flushing to the server channel, in milliseconds.
    pub flush_throttle_ms: u64,

    /// A materialization whose pipeline build + initial fetch takes longer
    /// than this is logged as a warning via `observability::on_slow_materialize`.
    pub slow_materialize_warn_ms: u64,

    /// When true, newly materialized queries are synthesized as
    /// `ResultType::Complete` immediately instead of starting `Unknown` and
    /// waiting for a server "got" acknowledgement. Intended for local-only
    /// deployments with no remote server channel.
    pub default_query_complete: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            flush_throttle_ms: 10,
            slow_materialize_warn_ms: 5_000,
            default_query_complete: false,
        }
    }
}

impl EngineConfig {
    /// Construct a config with `default_query_complete` forced on, for
    /// embedding in a local-only deployment with no server channel.
    pub fn local_only() -> Self {
        EngineConfig {
            default_query_complete: true,
            ..Self::default()
        }
    }
}
