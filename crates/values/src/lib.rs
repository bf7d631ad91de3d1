//! helmop values: bounded YAML overlay parsing, semantic comparison and
//! humanized diff summaries between two overlays.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

fn max_values_bytes() -> usize {
    std::env::var("HELMOP_MAX_VALUES_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_values_nodes() -> usize {
    std::env::var("HELMOP_MAX_VALUES_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a values overlay into a JSON tree. Blank text and a bare `null` are an
/// empty mapping; any other non-mapping document is rejected.
pub fn parse(text: &str) -> Result<Json> {
    if text.len() > max_values_bytes() {
        metrics::counter!("helmop_values_rejected_total", 1u64, "why" => "bytes");
        return Err(anyhow!("values too large (>{} bytes)", max_values_bytes()));
    }
    if text.trim().is_empty() {
        return Ok(Json::Object(serde_json::Map::new()));
    }
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).context("values parse error")?;
    let json = serde_json::to_value(yaml).context("converting values YAML to JSON")?;
    if node_budget_exceeded(&json, max_values_nodes()) {
        metrics::counter!("helmop_values_rejected_total", 1u64, "why" => "nodes");
        return Err(anyhow!("values too complex (>{} nodes)", max_values_nodes()));
    }
    match json {
        Json::Null => Ok(Json::Object(serde_json::Map::new())),
        Json::Object(_) => Ok(json),
        other => Err(anyhow!("values must be a mapping, got {}", type_name(&other))),
    }
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "sequence",
        Json::Object(_) => "mapping",
    }
}

/// Semantic equality of two overlays: key order is irrelevant, sequences compare
/// element-wise, and values of different types (including integer vs float) are
/// unequal. Either side failing to parse makes the pair unequal.
pub fn equal(a: &str, b: &str) -> bool {
    match (parse(a), parse(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

/// Equality against an already-parsed tree (e.g. values reported by the engine).
pub fn equal_to_tree(text: &str, tree: &Json) -> bool {
    let normalized = match tree {
        Json::Null => Json::Object(serde_json::Map::new()),
        t => t.clone(),
    };
    parse(text).map(|v| v == normalized).unwrap_or(false)
}

pub fn to_yaml(v: &Json) -> Result<String> {
    serde_yaml::to_string(v).context("rendering values as YAML")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

impl std::fmt::Display for DiffSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{} ~{} -{}", self.adds, self.updates, self.removes)
    }
}

/// Count leaf-level additions, updates and removals going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, out: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, out),
                        None => out.adds += 1,
                    }
                }
                out.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let common = aa.len().min(bb.len());
                out.updates += (0..common).filter(|&i| aa[i] != bb[i]).count();
                out.adds += aa.len().saturating_sub(bb.len());
                out.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => { if av != bv { out.updates += 1; } }
        }
    }
    let mut out = DiffSummary::default();
    walk(target, base, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_is_irrelevant() {
        assert!(equal("a: 1\nb: 2", "b: 2\na: 1"));
        assert!(equal("outer:\n  x: [1, 2]\n  y: z\n", "outer: {y: z, x: [1, 2]}"));
    }

    #[test]
    fn blank_and_null_are_empty_mappings() {
        assert!(equal("", ""));
        assert!(equal("", "{}"));
        assert!(equal("~", "   \n"));
        assert!(!equal("", "a: 1"));
    }

    #[test]
    fn sequences_compare_element_wise() {
        assert!(!equal("xs: [1, 2]", "xs: [2, 1]"));
        assert!(!equal("xs: [1]", "xs: [1, 1]"));
    }

    #[test]
    fn integer_and_float_are_different_types() {
        assert!(!equal("count: 3", "count: 3.0"));
        assert!(!equal("flag: true", "flag: \"true\""));
    }

    #[test]
    fn parse_errors_make_pairs_unequal() {
        assert!(!equal("a: [", "a: ["));
        assert!(parse("- 1\n- 2\n").unwrap_err().to_string().contains("mapping"));
    }

    #[test]
    fn tree_comparison_normalizes_null() {
        assert!(equal_to_tree("", &Json::Null));
        assert!(equal_to_tree("a: 1", &serde_json::json!({"a": 1})));
        assert!(!equal_to_tree("a: 1", &serde_json::json!({"a": 2})));
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({ "a": 1, "b": { "x": 1 }, "c": [1, 2, 3] });
        let target = serde_json::json!({ "a": 2, "b": { "x": 1, "y": 2 }, "c": [1, 9], "d": true });
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
        assert_eq!(s.to_string(), "+2 ~2 -1");
        assert!(diff_summary(&base, &base).is_empty());
    }
}
