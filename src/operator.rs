//! The `Input` contract every pipeline stage implements.
//!
//! `spec.md` §4.2: "All operators implement: `getSchema()`,
//! `setOutput(output)`, `fetch(req) → Stream<Node>`, `cleanup(req) →
//! Stream<Node>`, `push(change)`, `destroy()`." A `SourceInput` (the leaf)
//! and every operator in `crate::ivm::operators` implement this same
//! trait, so the pipeline builder wires them together uniformly without
//! caring whether a given stage is the root Source connector or a Filter/
//! Join/Take/Skip above it.
//!
//! `push` is intentionally absent from this trait: each stage registers
//! itself as the *output* of its upstream `Input` via `set_output`, so
//! pushes flow by closure call rather than by a method callers invoke
//! directly on a downstream `Input` handle.

use crate::change::Change;
use crate::error::ZeroError;
use crate::change::Node;
use crate::source::SourceSchema;
use crate::stream::Stream;

/// One pipeline stage's upstream-facing contract. `Rc<RefCell<_>>`
/// interior mutability backs every implementor so `destroy()` can be
/// idempotent and `set_output` can be called after construction, matching
/// the builder's post-order construction order (§4.3: children are built
/// before their parent wires in as a listener).
pub trait Input {
    fn get_schema(&self) -> SourceSchema;

    /// Whether this stage's upstream already enforces the whole `where`
    /// clause it was built with, letting the builder elide a redundant
    /// Filter above it.
    fn fully_applied_filters(&self) -> bool {
        false
    }

    /// Register the downstream sink this stage's changes are pushed to.
    fn set_output(&self, output: Box<dyn FnMut(Change)>);

    fn fetch(&self) -> Result<Stream<Node>, ZeroError>;

    /// Mirrors `fetch`'s contract but signals downstream stages that the
    /// result need not be retained.
    fn cleanup(&self) -> Result<Stream<Node>, ZeroError>;

    /// Idempotent. Propagates upward to this stage's own input.
    fn destroy(&self);
}
