//! Adaptive activation threshold.
//!
//! The base rises with system criticality (fraction of active nodes); an
//! optional affect gate can only lower it. The controller's multiplier is
//! applied last.

use crate::affect::Affect;
use crate::config::Config;
use crate::graph::Graph;
use crate::stats::clamp;

/// Criticality-driven base threshold for the frame.
pub fn base_threshold(active: usize, total: usize, cfg: &Config) -> f64 {
    let load = if total > 0 { active as f64 / total as f64 } else { 0.0 };
    cfg.base_threshold * (1.0 + cfg.criticality_factor * load)
}

/// Affect-gated reduction h in [0, lambda]. Alignment between the ambient
/// affect context and the node's own emotion lowers the bar; misalignment
/// never raises it.
pub fn affect_reduction(context: Option<&Affect>, node_affect: Option<&Affect>, cfg: &Config) -> f64 {
    if !cfg.affect_threshold_enabled {
        return 0.0;
    }
    let (Some(ctx), Some(emo)) = (context, node_affect) else {
        return 0.0;
    };
    let lambda = cfg.affective_threshold_lambda_factor * cfg.base_threshold;
    let raw = ctx.magnitude() * ctx.cos(emo) * clamp(emo.magnitude(), 0.0, 1.0);
    clamp(raw, 0.0, 1.0) * lambda
}

/// Recompute theta for every node and return (active, total) counts under
/// the new thresholds.
pub fn refresh(
    graph: &mut Graph,
    prev_active: usize,
    affect_context: Option<Affect>,
    controller_multiplier: f64,
    cfg: &Config,
) -> (usize, usize) {
    let total = graph.node_count();
    let theta_base = base_threshold(prev_active, total, cfg);
    let mut active = 0usize;
    for node in graph.nodes_mut() {
        let h = affect_reduction(affect_context.as_ref(), node.affect.as_ref(), cfg);
        node.theta = ((theta_base - h) * controller_multiplier).max(0.0);
        if node.is_active() {
            active += 1;
        }
    }
    (active, total)
}

/// Soft-sigmoid activation read, for consumers that want a graded signal.
pub fn soft_activation(energy: f64, theta: f64) -> f64 {
    let k = 8.0;
    1.0 / (1.0 + (-k * (energy - theta)).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Node, NodeType, Scope};

    #[test]
    fn base_rises_with_load() {
        let cfg = Config::from_env();
        let idle = base_threshold(0, 100, &cfg);
        let busy = base_threshold(50, 100, &cfg);
        assert!((idle - 1.0).abs() < 1e-12);
        assert!((busy - 2.0).abs() < 1e-12);
    }

    #[test]
    fn affect_only_reduces() {
        let mut cfg = Config::from_env();
        cfg.affect_threshold_enabled = true;
        let ctx = Affect::new(0.8, 0.4);
        let aligned = Affect::new(0.4, 0.2);
        let opposed = Affect::new(-0.4, -0.2);
        assert!(affect_reduction(Some(&ctx), Some(&aligned), &cfg) > 0.0);
        // Opposed affect clamps to zero rather than raising theta.
        assert_eq!(affect_reduction(Some(&ctx), Some(&opposed), &cfg), 0.0);
    }

    #[test]
    fn reduction_disabled_by_default() {
        let cfg = Config::from_env();
        let ctx = Affect::new(0.8, 0.4);
        assert_eq!(affect_reduction(Some(&ctx), Some(&ctx), &cfg), 0.0);
    }

    #[test]
    fn refresh_counts_active_nodes() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        for (id, e) in [("a", 2.0), ("b", 0.1)] {
            let mut n = Node::new(id, NodeType::Concept, Scope::Personal, id);
            n.energy = e;
            g.add_node(n).unwrap();
        }
        let (active, total) = refresh(&mut g, 0, None, 1.0, &cfg);
        assert_eq!(total, 2);
        assert_eq!(active, 1);
        assert!((g.get_node("a").unwrap().theta - 1.0).abs() < 1e-12);
    }

    #[test]
    fn soft_read_brackets_hard_threshold() {
        assert!(soft_activation(2.0, 1.0) > 0.99);
        assert!(soft_activation(0.0, 1.0) < 0.01);
        assert!((soft_activation(1.0, 1.0) - 0.5).abs() < 1e-12);
    }
}
