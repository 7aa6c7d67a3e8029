//! Canonical AST hashing.
//!
//! `spec.md` §6: AST serialization uses canonical JSON (sorted keys) with
//! primitive values; the hash is a 64-bit variant rendered in base-36.
//! Grounded on the teacher's own use of `xxhash_rust::xxh64` with a fixed
//! seed for deterministic row identity — same crate, same seed, retargeted
//! from Postgres tuple text to canonicalized AST JSON.

use crate::ast::{Ast, Condition};
use serde::Serialize;
use serde_json::Value as Json;
use xxhash_rust::xxh64;

const SEED: u64 = 0x517cc1b727220a95;

/// Recursively sort all object keys in a `serde_json::Value` so that two
/// structurally-equal-but-differently-ordered JSON documents hash
/// identically (`spec.md` §9: "sorting object keys" is the first
/// canonicalization step).
fn sort_keys(value: Json) -> Json {
    match value {
        Json::Object(map) => {
            let mut entries: Vec<(String, Json)> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = serde_json::Map::new();
            for (k, v) in entries {
                sorted.insert(k, v);
            }
            Json::Object(sorted)
        }
        Json::Array(items) => Json::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Render a canonical JSON document (sorted keys, no insignificant
/// whitespace) for any serializable value.
fn canonical_json<T: Serialize>(value: &T) -> String {
    let raw = serde_json::to_value(value).expect("AST values are always JSON-serializable");
    serde_json::to_string(&sort_keys(raw)).expect("canonical JSON serialization cannot fail")
}

/// Render a `u64` hash as lowercase base-36, matching `spec.md` §6's
/// "rendered in base-36".
fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}

/// Flatten nested `and`/`or` of the same variant into one level and sort
/// each resulting list of conjuncts/disjuncts by structural hash, so two
/// conditions built in a different order (`a.and(b)` vs `b.and(a)`, or an
/// `or()` with its branches swapped) canonicalize to the same tree
/// (`spec.md` §9's "flattened and/or, sorted disjuncts/conjuncts" step).
/// Recurses into `correlatedSubquery` leaves' nested AST too.
fn canonicalize_condition(cond: Condition) -> Condition {
    match cond {
        Condition::Simple { .. } => cond,
        Condition::And { conditions } => {
            Condition::And { conditions: sort_by_structural_hash(flatten(conditions, is_and)) }
        }
        Condition::Or { conditions } => {
            Condition::Or { conditions: sort_by_structural_hash(flatten(conditions, is_or)) }
        }
        Condition::CorrelatedSubquery { mut related, op } => {
            related.subquery = Box::new(canonicalize_ast(*related.subquery));
            Condition::CorrelatedSubquery { related, op }
        }
    }
}

fn is_and(cond: &Condition) -> bool {
    matches!(cond, Condition::And { .. })
}

fn is_or(cond: &Condition) -> bool {
    matches!(cond, Condition::Or { .. })
}

/// Canonicalize every child first, then splice in any child that is itself
/// the same variant (`same_variant`) rather than nesting it one level
/// deeper — `and(a, and(b, c))` and `and(a, b, c)` must hash identically.
fn flatten(conditions: Vec<Condition>, same_variant: fn(&Condition) -> bool) -> Vec<Condition> {
    let mut out = Vec::with_capacity(conditions.len());
    for cond in conditions {
        let cond = canonicalize_condition(cond);
        if same_variant(&cond) {
            match cond {
                Condition::And { conditions } | Condition::Or { conditions } => out.extend(conditions),
                _ => unreachable!("same_variant only matches And/Or"),
            }
        } else {
            out.push(cond);
        }
    }
    out
}

fn sort_by_structural_hash(mut conditions: Vec<Condition>) -> Vec<Condition> {
    conditions.sort_by_key(structural_hash);
    conditions
}

fn structural_hash(cond: &Condition) -> u64 {
    xxh64::xxh64(canonical_json(cond).as_bytes(), SEED)
}

/// Canonicalize an AST's condition tree (and every related subquery's, in
/// turn) in place, leaving everything else untouched.
fn canonicalize_ast(mut ast: Ast) -> Ast {
    ast.condition = ast.condition.map(canonicalize_condition);
    ast.related = ast
        .related
        .into_iter()
        .map(|mut related| {
            related.subquery = Box::new(canonicalize_ast(*related.subquery));
            related
        })
        .collect();
    ast
}

/// Hash an AST. Canonicalizes the condition tree first (flattening nested
/// `and`/`or` and sorting conjuncts/disjuncts by structural hash) so two
/// semantically-identical conditions built in a different order hash the
/// same, then renders canonical JSON (sorted object keys) over the result.
pub fn hash_ast(ast: &Ast) -> String {
    let canon = canonicalize_ast(ast.clone());
    let json = canonical_json(&canon);
    to_base36(xxh64::xxh64(json.as_bytes(), SEED))
}

/// Hash a custom query's `(name, args)` identity pair, used for
/// server-side registration of named queries independent of their
/// client-side AST (`spec.md` §4.4).
pub fn hash_custom_query(name: &str, args: &Json) -> String {
    let json = canonical_json(&serde_json::json!({ "name": name, "args": args }));
    to_base36(xxh64::xxh64(json.as_bytes(), SEED))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Ast;

    #[test]
    fn test_hash_is_deterministic_across_calls() {
        let ast = Ast::new("issue");
        assert_eq!(hash_ast(&ast), hash_ast(&ast));
    }

    #[test]
    fn test_hash_differs_for_different_tables() {
        assert_ne!(hash_ast(&Ast::new("issue")), hash_ast(&Ast::new("comment")));
    }

    #[test]
    fn test_sort_keys_makes_field_order_irrelevant() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(
            serde_json::to_string(&sort_keys(a)).unwrap(),
            serde_json::to_string(&sort_keys(b)).unwrap()
        );
    }

    #[test]
    fn test_base36_round_trips_zero_and_nonzero() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn test_custom_query_hash_depends_on_args() {
        let a = hash_custom_query("byOwner", &serde_json::json!({"id": 1}));
        let b = hash_custom_query("byOwner", &serde_json::json!({"id": 2}));
        assert_ne!(a, b);
    }

    use crate::ast::{Operand, SimpleOp};
    use crate::value::Value;

    fn eq(col: &str, v: f64) -> Condition {
        Condition::Simple {
            op: SimpleOp::Eq,
            left: Operand::Column { name: col.into() },
            right: Operand::Literal { value: Value::Number(v) },
        }
    }

    #[test]
    fn test_hash_ast_is_order_independent_for_and_conjuncts() {
        let mut a = Ast::new("issue");
        a.condition = Some(Condition::And { conditions: vec![eq("a", 1.0), eq("b", 2.0)] });
        let mut b = Ast::new("issue");
        b.condition = Some(Condition::And { conditions: vec![eq("b", 2.0), eq("a", 1.0)] });
        assert_eq!(hash_ast(&a), hash_ast(&b));
    }

    #[test]
    fn test_hash_ast_is_order_independent_for_or_disjuncts() {
        let mut a = Ast::new("issue");
        a.condition = Some(Condition::Or { conditions: vec![eq("a", 1.0), eq("b", 2.0)] });
        let mut b = Ast::new("issue");
        b.condition = Some(Condition::Or { conditions: vec![eq("b", 2.0), eq("a", 1.0)] });
        assert_eq!(hash_ast(&a), hash_ast(&b));
    }

    #[test]
    fn test_hash_ast_flattens_nested_and_of_and() {
        let mut nested = Ast::new("issue");
        nested.condition = Some(Condition::And {
            conditions: vec![eq("a", 1.0), Condition::And { conditions: vec![eq("b", 2.0), eq("c", 3.0)] }],
        });
        let mut flat = Ast::new("issue");
        flat.condition = Some(Condition::And { conditions: vec![eq("a", 1.0), eq("b", 2.0), eq("c", 3.0)] });
        assert_eq!(hash_ast(&nested), hash_ast(&flat));
    }

    #[test]
    fn test_hash_ast_does_not_flatten_and_into_or() {
        let mut and_of_or = Ast::new("issue");
        and_of_or.condition =
            Some(Condition::And { conditions: vec![Condition::Or { conditions: vec![eq("a", 1.0), eq("b", 2.0)] }] });
        let mut or_alone = Ast::new("issue");
        or_alone.condition = Some(Condition::Or { conditions: vec![eq("a", 1.0), eq("b", 2.0)] });
        assert_ne!(hash_ast(&and_of_or), hash_ast(&or_alone));
    }
}
