//! Server channel: the external collaborator `spec.md` §6 describes.
//!
//! This module defines only the data types and the trait seam a real
//! transport implements — no actual network I/O, matching the teacher's
//! own separation between `dvm` (the engine) and `pgtrickle-relay` (the
//! binary that owns a socket). An embedder wires a `ServerChannel`
//! implementation backed by whatever transport it has (WebSocket, HTTP
//! long-poll, an in-process test double) to `QueryLifecycleManager`.

use crate::ast::Ast;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// One entry of the throttled stream of registration changes the engine
/// emits, per `spec.md` §6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum QueriesPatch {
    /// Register or refresh a query. `name`/`args` identify a custom
    /// query; `ast` is present for an ad-hoc query (the name is then the
    /// reserved ad-hoc constant, `AD_HOC_QUERY_NAME`).
    Put {
        hash: String,
        ttl_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<Json>,
        #[serde(skip_serializing_if = "Option::is_none")]
        ast: Option<Ast>,
    },
    Del {
        hash: String,
    },
    Clear,
}

/// Reserved `name` a `Put` patch carries for an ad-hoc (unnamed) query,
/// distinguishing it from a real custom-query name in the patch stream.
pub const AD_HOC_QUERY_NAME: &str = "__ad_hoc__";

/// An acknowledgement that a query is now fully realized server-side,
/// keyed by hash, driving a view's `ResultType` `unknown → complete`
/// transition (`spec.md` §4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Got {
    pub hash: String,
}

/// One `transform` request for a named query: `spec.md` §6's protocol for
/// letting the server supply the authoritative AST for a `(name, args)`
/// pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub id: String,
    pub name: String,
    pub args: Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransformResponse {
    Ok { id: String, name: String, ast: Ast },
    Error { id: String, name: String, details: String },
}

/// The transport seam: an embedder implements this against its own
/// WebSocket/HTTP client. `send_patches` is fire-and-forget from the
/// engine's perspective (the channel owns retry/backoff, explicitly out
/// of scope here per `spec.md` §1); acknowledgements and transform
/// responses arrive asynchronously through whatever callback mechanism
/// the embedder's event loop uses, not through this trait's return
/// values.
pub trait ServerChannel {
    fn send_patches(&self, patches: &[QueriesPatch]);
    fn send_transform_requests(&self, requests: &[TransformRequest]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_patch_round_trips_through_json() {
        let patch = QueriesPatch::Put {
            hash: "abc123".into(),
            ttl_ms: Some(5000),
            name: None,
            args: None,
            ast: Some(Ast::new("issue")),
        };
        let json = serde_json::to_string(&patch).unwrap();
        let back: QueriesPatch = serde_json::from_str(&json).unwrap();
        assert_eq!(patch, back);
    }

    #[test]
    fn test_del_and_clear_round_trip() {
        let del = QueriesPatch::Del { hash: "abc".into() };
        let clear = QueriesPatch::Clear;
        for patch in [del, clear] {
            let json = serde_json::to_string(&patch).unwrap();
            let back: QueriesPatch = serde_json::from_str(&json).unwrap();
            assert_eq!(patch, back);
        }
    }

    #[test]
    fn test_transform_response_variants_round_trip() {
        let ok = TransformResponse::Ok { id: "1".into(), name: "byOwner".into(), ast: Ast::new("issue") };
        let err = TransformResponse::Error { id: "2".into(), name: "byOwner".into(), details: "bad args".into() };
        for resp in [ok, err] {
            let json = serde_json::to_string(&resp).unwrap();
            let back: TransformResponse = serde_json::from_str(&json).unwrap();
            assert_eq!(resp, back);
        }
    }
}
