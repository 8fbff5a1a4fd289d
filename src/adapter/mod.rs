//! Storage adapter surface.
//!
//! The engine consumes this contract; the store behind it is external. Reads
//! happen synchronously at bootstrap only; writes are best-effort outside
//! the frame hot path. The loader must tolerate both legacy energy formats
//! and overlays serialized as JSON strings.

pub mod sqlite;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::graph::{Graph, Link, Node};

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Load a fully populated graph: nodes, links, entities, adjacency.
    async fn load_graph(&self, graph_id: &str) -> Result<Graph>;

    async fn update_node_energy(&self, node: &Node) -> Result<()>;

    async fn update_link_weight(&self, link: &Link) -> Result<()>;

    async fn persist_subentities(&self, graph: &Graph) -> Result<()>;
}

/// Parse a stored energy value.
///
/// V1 rows carry `{entity_name: value}` maps (first value by sorted key
/// wins, so loads are deterministic); V2 rows carry `{default: value}`;
/// plain numbers pass through.
pub fn parse_energy(raw: &str) -> f64 {
    if let Ok(v) = raw.parse::<f64>() {
        return v.max(0.0);
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return 0.0;
    };
    match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0).max(0.0),
        serde_json::Value::Object(map) => {
            if let Some(v) = map.get("default").and_then(|v| v.as_f64()) {
                return v.max(0.0);
            }
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            keys.first()
                .and_then(|k| map.get(*k))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .max(0.0)
        }
        _ => 0.0,
    }
}

/// Overlays travel as a JSON-encoded string on the row; absent or malformed
/// payloads load as empty.
pub fn parse_overlays(raw: Option<&str>) -> HashMap<String, f64> {
    raw.and_then(|s| serde_json::from_str(s).ok()).unwrap_or_default()
}

pub fn encode_overlays(overlays: &HashMap<String, f64>) -> String {
    serde_json::to_string(overlays).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_energy_format() {
        assert!((parse_energy(r#"{"default": 0.42}"#) - 0.42).abs() < 1e-12);
    }

    #[test]
    fn v1_energy_takes_first_sorted_value() {
        let raw = r#"{"zeta": 9.0, "alpha": 0.25}"#;
        assert!((parse_energy(raw) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn plain_number_energy() {
        assert!((parse_energy("1.5") - 1.5).abs() < 1e-12);
    }

    #[test]
    fn garbage_energy_is_zero() {
        assert_eq!(parse_energy("not json"), 0.0);
        assert_eq!(parse_energy("-3.0"), 0.0);
    }

    #[test]
    fn overlays_roundtrip() {
        let mut m = HashMap::new();
        m.insert("entity_fn_a".to_string(), 0.5);
        let encoded = encode_overlays(&m);
        let decoded = parse_overlays(Some(&encoded));
        assert_eq!(decoded, m);
        assert!(parse_overlays(None).is_empty());
        assert!(parse_overlays(Some("nope")).is_empty());
    }
}
