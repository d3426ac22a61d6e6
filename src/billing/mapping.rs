//! Channel model mapping (model redirect) resolution.
//!
//! A channel may redirect model names, possibly through a chain
//! (`a -> b -> c`). The final name in the chain is what gets sent upstream.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("model mapping contains cycle: {from} -> {to}")]
    Cycle { from: String, to: String },

    #[error("unmarshal model mapping failed: {0}")]
    InvalidTable(String),
}

/// Result of resolving a model name against a channel's mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub origin: String,
    pub upstream: String,
    pub mapped: bool,
}

impl ResolvedModel {
    fn identity(origin: &str) -> Self {
        Self {
            origin: origin.to_string(),
            upstream: origin.to_string(),
            mapped: false,
        }
    }
}

/// Parse a channel's JSON mapping table. Empty strings and `{}` mean no mapping.
pub fn parse_mapping_table(raw: &str) -> Result<HashMap<String, String>, MappingError> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "{}" {
        return Ok(HashMap::new());
    }
    serde_json::from_str(raw).map_err(|e| MappingError::InvalidTable(e.to_string()))
}

/// Follow the redirect chain starting at `origin`.
///
/// - `{a: a}` resolves `a` to itself, unmapped.
/// - a chain ending in a self-mapped name stops there (`{a: b, b: b}` gives `b`).
/// - revisiting any other name is a cycle and fails.
pub fn resolve_model_mapping(
    origin: &str,
    table: &HashMap<String, String>,
) -> Result<ResolvedModel, MappingError> {
    if table.is_empty() {
        return Ok(ResolvedModel::identity(origin));
    }

    let mut current = origin.to_string();
    let mut visited: HashSet<String> = HashSet::from([current.clone()]);
    let mut mapped = false;

    while let Some(next) = table.get(&current).filter(|m| !m.is_empty()) {
        if visited.contains(next) {
            if *next == current {
                if current == origin {
                    return Ok(ResolvedModel::identity(origin));
                }
                break;
            }
            return Err(MappingError::Cycle {
                from: current,
                to: next.clone(),
            });
        }
        visited.insert(next.clone());
        current = next.clone();
        mapped = true;
    }

    if mapped {
        tracing::info!("Task model mapping: {} -> {}", origin, current);
    }

    Ok(ResolvedModel {
        origin: origin.to_string(),
        upstream: current,
        mapped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_mapping() {
        let resolved = resolve_model_mapping("sora-2", &HashMap::new()).unwrap();
        assert_eq!(resolved.upstream, "sora-2");
        assert!(!resolved.mapped);
    }

    #[test]
    fn test_chain_follows_to_tail() {
        let t = table(&[("a", "b"), ("b", "c")]);
        let resolved = resolve_model_mapping("a", &t).unwrap();
        assert_eq!(resolved.upstream, "c");
        assert!(resolved.mapped);
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let t = table(&[("A", "B"), ("B", "A")]);
        let err = resolve_model_mapping("A", &t).unwrap_err();
        assert_eq!(
            err,
            MappingError::Cycle {
                from: "B".into(),
                to: "A".into()
            }
        );
    }

    #[test]
    fn test_self_mapping_is_identity() {
        let t = table(&[("A", "A")]);
        let resolved = resolve_model_mapping("A", &t).unwrap();
        assert_eq!(resolved.upstream, "A");
        assert!(!resolved.mapped);
    }

    #[test]
    fn test_chain_ending_in_self_mapping() {
        let t = table(&[("a", "b"), ("b", "b")]);
        let resolved = resolve_model_mapping("a", &t).unwrap();
        assert_eq!(resolved.upstream, "b");
        assert!(resolved.mapped);
    }

    #[test]
    fn test_empty_target_ignored() {
        let t = table(&[("a", "")]);
        let resolved = resolve_model_mapping("a", &t).unwrap();
        assert!(!resolved.mapped);
    }

    #[test]
    fn test_parse_table() {
        assert!(parse_mapping_table("").unwrap().is_empty());
        assert!(parse_mapping_table("{}").unwrap().is_empty());
        let t = parse_mapping_table(r#"{"x":"y"}"#).unwrap();
        assert_eq!(t.get("x").map(String::as_str), Some("y"));
        assert!(matches!(
            parse_mapping_table("[1,2]"),
            Err(MappingError::InvalidTable(_))
        ));
    }
}
