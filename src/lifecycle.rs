//! Query Lifecycle Manager: `spec.md` §4.6.
//!
//! Tracks, per distinct client AST hash, a reference count, an effective
//! TTL (max over live holders), the materialized pipeline + view, and a
//! `ResultType`. Grounded on the teacher's `monitor.rs` stale/
//! auto-suspend bookkeeping (a per-subscription refcount plus a timer
//! that tears things down once nobody references them anymore), retargeted
//! from Postgres replication slots to in-process pipelines.
//!
//! This crate runs no internal timer or event loop (`spec.md` §5: only the
//! host event loop suspends/resumes anything) — `sweep()` must be called
//! periodically by the embedder, and `take_pending_patches()` drains the
//! `QueriesPatch` queue for the embedder's own throttled flush, matching
//! `EngineConfig::flush_throttle_ms`.

use crate::channel::QueriesPatch;
use crate::config::EngineConfig;
use crate::error::ZeroError;
use crate::ivm::builder::BuilderDelegate;
use crate::observability;
use crate::operator::Input;
use crate::query::Query;
use crate::view::ViewAssembler;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A normalized time-to-live. `spec.md` §4.6: `'forever'` or any negative
/// number becomes `Infinity`; `'none'` becomes zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Ms(u64),
    Forever,
}

impl Ttl {
    pub fn none() -> Ttl {
        Ttl::Ms(0)
    }

    /// Parse the `Ns|Nm|Nh|Nd|Ny` string grammar plus the `forever`/`none`
    /// literals (`spec.md` §9/EXPANSION 6: `^-?\d+(ms|s|m|h|d|y)$`).
    pub fn parse(s: &str) -> Result<Ttl, ZeroError> {
        let trimmed = s.trim();
        if trimmed == "forever" {
            return Ok(Ttl::Forever);
        }
        if trimmed == "none" {
            return Ok(Ttl::Ms(0));
        }
        let negative = trimmed.starts_with('-');
        let rest = trimmed.strip_prefix('-').unwrap_or(trimmed);
        let (num, suffix) = split_suffix(rest).ok_or_else(|| ZeroError::InvalidTtl(s.to_string()))?;
        let n: u64 = num.parse().map_err(|_| ZeroError::InvalidTtl(s.to_string()))?;
        if negative {
            return Ok(Ttl::Forever);
        }
        let ms = match suffix {
            "ms" => n,
            "s" => n.saturating_mul(1_000),
            "m" => n.saturating_mul(60_000),
            "h" => n.saturating_mul(3_600_000),
            "d" => n.saturating_mul(86_400_000),
            "y" => n.saturating_mul(365 * 86_400_000),
            _ => unreachable!("split_suffix only returns a known suffix"),
        };
        Ok(Ttl::Ms(ms))
    }

    /// A raw millisecond count (the `number` form of the TTL surface):
    /// negative becomes `Forever`, matching the string grammar's sign
    /// convention.
    pub fn from_millis(n: i64) -> Ttl {
        if n < 0 {
            Ttl::Forever
        } else {
            Ttl::Ms(n as u64)
        }
    }

    fn as_millis_option(&self) -> Option<u64> {
        match self {
            Ttl::Ms(n) => Some(*n),
            Ttl::Forever => None,
        }
    }
}

fn split_suffix(s: &str) -> Option<(&str, &str)> {
    for suffix in ["ms", "s", "m", "h", "d", "y"] {
        if let Some(num) = s.strip_suffix(suffix) {
            if !num.is_empty() {
                return Some((num, suffix));
            }
        }
    }
    None
}

/// Max TTL over a set of `(holder_id, ttl)` pairs; any `Forever` holder
/// dominates.
fn max_ttl(ttls: &[(u64, Ttl)]) -> Ttl {
    ttls.iter().fold(Ttl::Ms(0), |acc, (_, ttl)| match (acc, ttl) {
        (Ttl::Forever, _) | (_, Ttl::Forever) => Ttl::Forever,
        (Ttl::Ms(a), Ttl::Ms(b)) => Ttl::Ms(a.max(*b)),
    })
}

struct Entry {
    refcount: usize,
    ttls: Vec<(u64, Ttl)>,
    effective_ttl: Ttl,
    zero_since: Option<Instant>,
    pipeline: Box<dyn Input>,
    view: Rc<ViewAssembler>,
}

struct ManagerInner {
    config: EngineConfig,
    entries: RefCell<HashMap<String, Entry>>,
    next_holder_id: Cell<u64>,
    pending_patches: RefCell<Vec<QueriesPatch>>,
}

/// Cheaply cloneable handle (an `Rc`), shared by every `MaterializedQuery`
/// it hands out so a holder's `release()` can reach back into the shared
/// bookkeeping.
#[derive(Clone)]
pub struct QueryLifecycleManager(Rc<ManagerInner>);

impl QueryLifecycleManager {
    pub fn new(config: EngineConfig) -> Self {
        QueryLifecycleManager(Rc::new(ManagerInner {
            config,
            entries: RefCell::new(HashMap::new()),
            next_holder_id: Cell::new(0),
            pending_patches: RefCell::new(Vec::new()),
        }))
    }

    /// `materialize(query, ttl?)`: increments the refcount for `query`'s
    /// client hash; builds the pipeline and view on the first reference,
    /// reuses them on subsequent ones.
    pub fn materialize(
        &self,
        query: &Query,
        ttl: Ttl,
        delegate: &dyn BuilderDelegate,
    ) -> Result<MaterializedQuery, ZeroError> {
        let hash = query.client_hash();
        let holder_id = self.0.next_holder_id.get();
        self.0.next_holder_id.set(holder_id + 1);

        {
            let mut entries = self.0.entries.borrow_mut();
            if let Some(entry) = entries.get_mut(&hash) {
                entry.refcount += 1;
                entry.zero_since = None;
                entry.ttls.push((holder_id, ttl));
                entry.effective_ttl = max_ttl(&entry.ttls);
                entry.view.update_ttl(entry.effective_ttl.as_millis_option());
                let view = entry.view.clone();
                return Ok(MaterializedQuery { manager: self.clone(), hash, holder_id, view });
            }
        }

        let start = Instant::now();
        let pipeline = crate::ivm::builder::build(query.ast(), delegate)?;
        let nodes = pipeline.fetch()?.drain();
        let format = query.build_format(delegate)?;
        let view = Rc::new(ViewAssembler::new(nodes, format));

        if self.0.config.default_query_complete {
            view.mark_complete();
        }

        let duration = start.elapsed();
        observability::emit_materialized(&hash, duration);
        if duration.as_millis() as u64 >= self.0.config.slow_materialize_warn_ms {
            observability::emit_slow_materialize(&hash, duration, self.0.config.slow_materialize_warn_ms);
        }

        let hash_for_destroy = hash.clone();
        view.set_on_destroy(Box::new(move || {
            tracing::debug!(hash = %hash_for_destroy, "view assembler destroyed");
        }));

        let view_for_push = view.clone();
        pipeline.set_output(Box::new(move |change| view_for_push.apply(&change)));

        let (name, args) = match query.name_and_args_ref() {
            Some((name, args)) => (Some(name.clone()), Some(args.clone())),
            None => (None, None),
        };
        self.0.pending_patches.borrow_mut().push(QueriesPatch::Put {
            hash: hash.clone(),
            ttl_ms: ttl.as_millis_option(),
            name,
            args,
            ast: Some(query.ast().clone()),
        });

        let mut entries = self.0.entries.borrow_mut();
        entries.insert(
            hash.clone(),
            Entry {
                refcount: 1,
                ttls: vec![(holder_id, ttl)],
                effective_ttl: ttl,
                zero_since: None,
                pipeline,
                view: view.clone(),
            },
        );

        Ok(MaterializedQuery { manager: self.clone(), hash, holder_id, view })
    }

    /// Decrement the refcount for `hash`. On reaching zero, the entry's
    /// TTL timer starts; `sweep()` tears it down once that TTL elapses
    /// without a new reference.
    fn release_holder(&self, hash: &str, holder_id: u64) {
        let mut entries = self.0.entries.borrow_mut();
        let Some(entry) = entries.get_mut(hash) else { return };
        entry.refcount = entry.refcount.saturating_sub(1);
        entry.ttls.retain(|(id, _)| *id != holder_id);
        if !entry.ttls.is_empty() {
            entry.effective_ttl = max_ttl(&entry.ttls);
        }
        if entry.refcount == 0 {
            entry.zero_since = Some(Instant::now());
            observability::emit_refcount_zero(hash);
        }
    }

    /// Flip a materialized query's `ResultType` `unknown → complete` on
    /// the server's "got" acknowledgement.
    pub fn mark_complete(&self, hash: &str) {
        if let Some(entry) = self.0.entries.borrow().get(hash) {
            entry.view.mark_complete();
        }
    }

    /// Tear down any entry whose refcount has been zero for at least its
    /// effective TTL. Must be called periodically by the embedder — this
    /// crate owns no timer of its own (`spec.md` §5).
    pub fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<String> = {
            let entries = self.0.entries.borrow();
            entries
                .iter()
                .filter_map(|(hash, entry)| {
                    let zero_since = entry.zero_since?;
                    let expired = match entry.effective_ttl {
                        Ttl::Forever => false,
                        Ttl::Ms(ms) => now.duration_since(zero_since) >= Duration::from_millis(ms),
                    };
                    expired.then(|| hash.clone())
                })
                .collect()
        };

        if expired.is_empty() {
            return;
        }
        let mut entries = self.0.entries.borrow_mut();
        for hash in expired {
            if let Some(entry) = entries.remove(&hash) {
                entry.pipeline.destroy();
                entry.view.destroy();
                self.0.pending_patches.borrow_mut().push(QueriesPatch::Del { hash: hash.clone() });
                observability::emit_ttl_expired(&hash);
            }
        }
    }

    /// Drain the queue of `QueriesPatch`es accumulated since the last
    /// call, for the embedder's own throttled flush to the server channel.
    pub fn take_pending_patches(&self) -> Vec<QueriesPatch> {
        std::mem::take(&mut *self.0.pending_patches.borrow_mut())
    }

    #[cfg(test)]
    fn refcount(&self, hash: &str) -> Option<usize> {
        self.0.entries.borrow().get(hash).map(|e| e.refcount)
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.0.entries.borrow().len()
    }
}

/// One holder's reference to a materialized query. Dropping this value
/// without calling `release` leaks the reference (matching `Box`/`Rc`'s
/// own non-affine-but-explicit cleanup style elsewhere in this crate); call
/// `release()` when the view is no longer needed.
pub struct MaterializedQuery {
    manager: QueryLifecycleManager,
    hash: String,
    holder_id: u64,
    pub view: Rc<ViewAssembler>,
}

impl MaterializedQuery {
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Release this holder's reference. Does not necessarily tear down
    /// the pipeline immediately — that happens only once the refcount is
    /// zero and the effective TTL has elapsed, via `sweep()`.
    pub fn release(self) {
        self.manager.release_holder(&self.hash, self.holder_id);
    }
}
