//! One-time entity bootstrap.
//!
//! Functional entities come from a YAML config and are seeded onto nodes by
//! keyword match against name + description; semantic entities come from
//! k-means clustering of node embeddings. Both paths are idempotent: a
//! second run over the same inputs changes nothing.

use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;

use crate::config::Config;
use crate::graph::{Endpoint, Entity, EntityKind, Graph, Link, LinkType};
use crate::stats::cosine;

pub const FUNCTIONAL_PREFIX: &str = "entity_fn_";
pub const SEMANTIC_PREFIX: &str = "entity_sem_";

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionalEntitySpec {
    pub id: String,
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
}

fn default_kind() -> String {
    "functional".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionalEntitiesFile {
    pub entities: Vec<FunctionalEntitySpec>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub entities_created: usize,
    pub links_created: usize,
}

/// Seed functional entities from a YAML file.
pub fn bootstrap_functional_entities(
    graph: &mut Graph,
    path: &Path,
    cfg: &Config,
) -> Result<BootstrapReport> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read functional entities config {}", path.display()))?;
    bootstrap_functional_from_str(graph, &raw, cfg)
}

pub fn bootstrap_functional_from_str(
    graph: &mut Graph,
    yaml: &str,
    cfg: &Config,
) -> Result<BootstrapReport> {
    let file: FunctionalEntitiesFile =
        serde_yaml::from_str(yaml).context("parse functional entities yaml")?;
    let mut report = BootstrapReport::default();

    for spec in &file.entities {
        let entity_id = if spec.id.starts_with(FUNCTIONAL_PREFIX) {
            spec.id.clone()
        } else {
            format!("{}{}", FUNCTIONAL_PREFIX, spec.id)
        };

        if graph.get_entity(&entity_id).is_none() {
            let kind = EntityKind::parse(&spec.kind).unwrap_or(EntityKind::Functional);
            let mut entity = Entity::new(&entity_id, &spec.name, kind);
            entity.color = spec.color.clone();
            graph.add_entity(entity)?;
            report.entities_created += 1;
        }

        let keywords: Vec<String> = spec.keywords.iter().map(|k| k.to_lowercase()).collect();
        if keywords.is_empty() {
            continue;
        }
        let matching: Vec<String> = graph
            .nodes()
            .filter(|n| {
                let haystack = format!("{} {}", n.name, n.description).to_lowercase();
                keywords.iter().any(|k| haystack.contains(k.as_str()))
            })
            .map(|n| n.id.clone())
            .collect();

        for node_id in matching {
            let link_id = format!("bt_{}__{}", node_id, entity_id);
            if graph.get_link(&link_id).is_some() {
                continue;
            }
            let mut link = Link::new(
                &link_id,
                Endpoint::Node(node_id.clone()),
                Endpoint::Entity(entity_id.clone()),
                LinkType::BelongsTo,
            );
            link.membership_weight = cfg.belongs_to_initial_weight;
            graph.add_link(link)?;
            report.links_created += 1;
        }
    }

    normalize_memberships(graph);
    Ok(report)
}

/// Per-node membership normalization: scale down only when the sum exceeds
/// 1, so an already-normalized graph is a fixed point.
pub fn normalize_memberships(graph: &mut Graph) {
    let node_ids: Vec<String> = graph.node_ids().cloned().collect();
    for node_id in node_ids {
        let membership_links: Vec<(String, f64)> = graph
            .get_node(&node_id)
            .map(|n| {
                n.memberships
                    .iter()
                    .filter_map(|lid| graph.get_link(lid).map(|l| (lid.clone(), l.membership_weight)))
                    .collect()
            })
            .unwrap_or_default();
        let sum: f64 = membership_links.iter().map(|(_, w)| w).sum();
        if sum <= 1.0 {
            continue;
        }
        for (lid, w) in membership_links {
            if let Some(link) = graph.get_link_mut(&lid) {
                link.membership_weight = w / sum;
            }
        }
    }
}

/// Cluster node embeddings into semantic entities. Singleton clusters are
/// dropped; existing semantic entities make the pass a no-op.
pub fn bootstrap_semantic_entities(graph: &mut Graph, k: usize, cfg: &Config) -> Result<BootstrapReport> {
    let mut report = BootstrapReport::default();
    if graph.entities().any(|e| e.id.starts_with(SEMANTIC_PREFIX)) {
        return Ok(report);
    }

    let points: Vec<(String, Vec<f64>)> = graph
        .nodes()
        .filter_map(|n| n.embedding.as_ref().map(|e| (n.id.clone(), e.clone())))
        .collect();
    if points.len() < 4 {
        return Ok(report);
    }
    let k = k.max(2).min(points.len() / 2);

    let mut rng = StdRng::seed_from_u64(0x73656d);
    let mut centroids: Vec<Vec<f64>> = points
        .choose_multiple(&mut rng, k)
        .map(|(_, e)| e.clone())
        .collect();
    let mut assignment = vec![0usize; points.len()];

    for _ in 0..cfg.semantic_cluster_iters {
        for (i, (_, emb)) in points.iter().enumerate() {
            assignment[i] = centroids
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    cosine(emb, a)
                        .partial_cmp(&cosine(emb, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(c, _)| c)
                .unwrap_or(0);
        }
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = points
                .iter()
                .zip(assignment.iter())
                .filter(|(_, &a)| a == c)
                .map(|((_, e), _)| e)
                .collect();
            if members.is_empty() {
                continue;
            }
            for (d, slot) in centroid.iter_mut().enumerate() {
                *slot = members.iter().map(|m| m[d]).sum::<f64>() / members.len() as f64;
            }
        }
    }

    for (c, centroid) in centroids.iter().enumerate() {
        let members: Vec<(String, f64)> = points
            .iter()
            .zip(assignment.iter())
            .filter(|(_, &a)| a == c)
            .map(|((id, emb), _)| (id.clone(), cosine(emb, centroid).max(0.0)))
            .collect();
        if members.len() < 2 {
            continue;
        }
        let entity_id = format!("{}{}", SEMANTIC_PREFIX, c);
        let mut entity = Entity::new(&entity_id, &entity_id, EntityKind::Semantic);
        entity.centroid_embedding = Some(centroid.clone());
        graph.add_entity(entity)?;
        report.entities_created += 1;
        for (node_id, weight) in members {
            if weight <= 0.0 {
                continue;
            }
            let link_id = format!("bt_{}__{}", node_id, entity_id);
            let mut link = Link::new(
                &link_id,
                Endpoint::Node(node_id),
                Endpoint::Entity(entity_id.clone()),
                LinkType::BelongsTo,
            );
            link.membership_weight = weight * cfg.belongs_to_initial_weight;
            graph.add_link(link)?;
            report.links_created += 1;
        }
    }

    normalize_memberships(graph);
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, NodeType, Scope};

    const YAML: &str = r#"
entities:
  - id: translator
    name: Translator
    kind: functional
    description: turns intent into language
    keywords: [translate, language]
  - id: architect
    name: Architect
    keywords: [design, structure]
"#;

    fn graph_with_named_nodes() -> Graph {
        let mut g = Graph::new();
        let mut a = Node::new("n1", NodeType::Concept, Scope::Personal, "translate ideas");
        a.description = "turns thought into language".into();
        g.add_node(a).unwrap();
        let mut b = Node::new("n2", NodeType::Concept, Scope::Personal, "system design");
        b.description = "structure of the machine".into();
        g.add_node(b).unwrap();
        g.add_node(Node::new("n3", NodeType::Concept, Scope::Personal, "unrelated")).unwrap();
        g
    }

    #[test]
    fn functional_bootstrap_seeds_memberships() {
        let cfg = Config::from_env();
        let mut g = graph_with_named_nodes();
        let report = bootstrap_functional_from_str(&mut g, YAML, &cfg).unwrap();
        assert_eq!(report.entities_created, 2);
        assert_eq!(report.links_created, 2);
        assert!(g.get_entity("entity_fn_translator").is_some());
        assert!(g.membership_weight("n1", "entity_fn_translator") > 0.0);
        assert!(g.membership_weight("n2", "entity_fn_architect") > 0.0);
        assert_eq!(g.membership_weight("n3", "entity_fn_translator"), 0.0);
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let cfg = Config::from_env();
        let mut g = graph_with_named_nodes();
        bootstrap_functional_from_str(&mut g, YAML, &cfg).unwrap();
        let entities = g.entity_count();
        let links = g.link_count();
        let w = g.membership_weight("n1", "entity_fn_translator");

        let second = bootstrap_functional_from_str(&mut g, YAML, &cfg).unwrap();
        assert_eq!(second, BootstrapReport::default());
        assert_eq!(g.entity_count(), entities);
        assert_eq!(g.link_count(), links);
        assert!((g.membership_weight("n1", "entity_fn_translator") - w).abs() < 1e-12);
    }

    #[test]
    fn normalization_caps_per_node_sum() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        let mut n = Node::new("n1", NodeType::Concept, Scope::Personal, "design language");
        n.description = "translate structure".into();
        g.add_node(n).unwrap();
        bootstrap_functional_from_str(&mut g, YAML, &cfg).unwrap();
        // n1 matches both entities; 0.5 + 0.5 stays within the unit budget.
        let total = g.membership_weight("n1", "entity_fn_translator")
            + g.membership_weight("n1", "entity_fn_architect");
        assert!(total <= 1.0 + 1e-12);
    }

    #[test]
    fn semantic_bootstrap_clusters_embeddings() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        // Two tight clusters on opposite axes.
        for (i, emb) in [
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.95, 0.05],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
            vec![0.05, 0.95],
        ]
        .into_iter()
        .enumerate()
        {
            let mut n = Node::new(&format!("n{}", i), NodeType::Concept, Scope::Personal, "n");
            n.embedding = Some(emb);
            g.add_node(n).unwrap();
        }
        let report = bootstrap_semantic_entities(&mut g, 2, &cfg).unwrap();
        assert_eq!(report.entities_created, 2);
        assert!(report.links_created >= 6);

        // Second run is a no-op.
        let second = bootstrap_semantic_entities(&mut g, 2, &cfg).unwrap();
        assert_eq!(second.entities_created, 0);
    }

    #[test]
    fn semantic_bootstrap_needs_embeddings() {
        let cfg = Config::from_env();
        let mut g = graph_with_named_nodes();
        let report = bootstrap_semantic_entities(&mut g, 4, &cfg).unwrap();
        assert_eq!(report.entities_created, 0);
    }
}
