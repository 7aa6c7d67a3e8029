//! Observability: structured logging via `tracing`.
//!
//! The teacher crate logs through `pgrx`'s `log!`/`warning!` macros tied to
//! PostgreSQL's `elog` facility, and emits an additional layer of
//! operational alerts over `NOTIFY pg_stream_alert` (`monitor.rs`) so a
//! listening client can react to staleness/auto-suspend/etc. without
//! polling. This engine has no PostgreSQL backend to `NOTIFY` through, so
//! both layers collapse onto `tracing`: ordinary diagnostic logging and
//! "alert" events both become leveled, structured `tracing` events,
//! distinguished only by an `event` field matching `monitor.rs`'s payload
//! shape (`event`, plus whatever structured fields that event carries).
//!
//! No `Subscriber` is installed here or anywhere else in this crate —
//! exactly as the teacher crate never calls `tracing_subscriber::init()`
//! itself; the embedding application wires up its own.

use std::time::Duration;

/// Named operational events, mirroring `monitor.rs::AlertEvent`'s role:
/// each corresponds to one of the NOTIFY payloads that module emits,
/// retargeted from ST staleness/suspension to query materialization
/// lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A query pipeline was built and its initial snapshot fetched.
    QueryMaterialized,
    /// Materialize took longer than `EngineConfig::slow_materialize_warn_ms`.
    SlowMaterialize,
    /// A materialized query's reference count reached zero and started its
    /// TTL countdown.
    RefcountZero,
    /// A query's TTL elapsed with no new holder; its pipeline was torn down.
    TtlExpired,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::QueryMaterialized => "query_materialized",
            Event::SlowMaterialize => "slow_materialize",
            Event::RefcountZero => "refcount_zero",
            Event::TtlExpired => "ttl_expired",
        }
    }
}

/// Emit the `QueryMaterialized` event.
pub fn emit_materialized(hash: &str, duration: Duration) {
    tracing::info!(
        event = Event::QueryMaterialized.as_str(),
        hash = %hash,
        duration_ms = duration.as_millis() as u64,
        "query materialized"
    );
}

/// Emit the `SlowMaterialize` event: `duration` exceeded `threshold`.
pub fn emit_slow_materialize(hash: &str, duration: Duration, threshold_ms: u64) {
    tracing::warn!(
        event = Event::SlowMaterialize.as_str(),
        hash = %hash,
        duration_ms = duration.as_millis() as u64,
        threshold_ms,
        "slow query materialization"
    );
}

/// Emit the `RefcountZero` event: a query's last holder released it.
pub fn emit_refcount_zero(hash: &str) {
    tracing::info!(event = Event::RefcountZero.as_str(), hash = %hash, "query refcount reached zero");
}

/// Emit the `TtlExpired` event: the pipeline and view for `hash` were torn
/// down by a sweep.
pub fn emit_ttl_expired(hash: &str) {
    tracing::info!(event = Event::TtlExpired.as_str(), hash = %hash, "query ttl expired, pipeline torn down");
}

/// Log an invariant violation at the error site, in addition to returning
/// it as a `Result` — matching the teacher's practice of logging where an
/// error originates as well as propagating it (`spec.md` §7).
pub fn log_invariant_violation(detail: &str) {
    tracing::error!(kind = "invariant", detail = %detail, "invariant violation");
}

/// Log a storage error at the error site.
pub fn log_storage_error(detail: &str) {
    tracing::error!(kind = "storage", detail = %detail, "storage error");
}

/// A `tracing::debug_span` tagging one operator's push/fetch activity by
/// kind and table, for diagnosing IVM misbehavior without a debugger
/// (`spec.md` EXPANSION 1's per-operator logging bullet). Operators enter
/// this span around their `fetch`/push-handling bodies; left at `debug`
/// rather than `info` since it fires on every row, not just transitions.
pub fn operator_span(kind: &'static str, table: &str) -> tracing::Span {
    tracing::debug_span!("operator", kind, table = %table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_as_str_matches_payload_naming() {
        assert_eq!(Event::QueryMaterialized.as_str(), "query_materialized");
        assert_eq!(Event::SlowMaterialize.as_str(), "slow_materialize");
        assert_eq!(Event::RefcountZero.as_str(), "refcount_zero");
        assert_eq!(Event::TtlExpired.as_str(), "ttl_expired");
    }

    #[test]
    fn test_emit_helpers_do_not_panic_without_a_subscriber() {
        emit_materialized("abc123", Duration::from_millis(5));
        emit_slow_materialize("abc123", Duration::from_millis(6000), 5000);
        emit_refcount_zero("abc123");
        emit_ttl_expired("abc123");
        log_storage_error("disk full");
        let _span = operator_span("filter", "issue");
    }
}
