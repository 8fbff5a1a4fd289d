//! Link cost scoring for stride selection.
//!
//! Base cost is inverse ease minus goal affinity; two emotion gates can pull
//! the cost down: resonance (aligned affect attracts) and complementarity
//! (opposite affect under high arousal exerts a regulation pull).

use crate::affect::Affect;
use crate::config::Config;
use crate::graph::{Graph, Link};
use crate::stats::{clamp, cosine};

#[derive(Debug, Clone, Copy)]
pub struct CostBreakdown {
    pub ease: f64,
    pub ease_cost: f64,
    pub goal_affinity: f64,
    pub res_mult: f64,
    pub res_score: f64,
    pub comp_mult: f64,
    pub emotion_mult: f64,
    pub base_cost: f64,
    pub total_cost: f64,
}

/// Score one candidate link from the current entity context.
pub fn link_cost(
    graph: &Graph,
    link: &Link,
    entity_ctx: Option<&str>,
    entity_affect: Option<&Affect>,
    goal_embedding: Option<&[f64]>,
    gates_enabled: bool,
    cfg: &Config,
) -> CostBreakdown {
    let ease = link.effective_log_weight(entity_ctx).exp();
    let ease_cost = 1.0 / ease.max(1e-9);

    let goal_affinity = match (goal_embedding, graph.get_node(link.target.id())) {
        (Some(goal), Some(target)) => target
            .embedding
            .as_ref()
            .map(|emb| cosine(emb, goal))
            .unwrap_or(0.0),
        _ => 0.0,
    };

    let base_cost = ease_cost - goal_affinity;

    let (res_mult, res_score, comp_mult) = match (gates_enabled, link.emotion, entity_affect) {
        (true, Some(emotion), Some(affect)) => emotion_gates(&emotion, affect, cfg),
        _ => (1.0, 0.0, 1.0),
    };
    let emotion_mult = res_mult * comp_mult;

    CostBreakdown {
        ease,
        ease_cost,
        goal_affinity,
        res_mult,
        res_score,
        comp_mult,
        emotion_mult,
        base_cost,
        total_cost: base_cost * emotion_mult,
    }
}

/// (res_mult, res_score, comp_mult).
///
/// Resonance: aligned affect lowers cost, opposed raises it, monotone in the
/// cosine. Complementarity: opposed affect under high arousal lowers cost
/// (regulation pull), gated by emotion intensity and arousal context.
fn emotion_gates(emotion: &Affect, affect: &Affect, cfg: &Config) -> (f64, f64, f64) {
    let res_score = affect.cos(emotion);
    let res_mult = clamp(1.0 - cfg.res_lambda * res_score, 1.0 - cfg.res_lambda, 1.0 + cfg.res_lambda);

    let intensity_gate = clamp(emotion.magnitude(), 0.0, 1.0);
    let context_gate = clamp((affect.arousal - 0.3) / 0.4, 0.0, 1.0);
    let comp_raw = (-res_score).max(0.0) * intensity_gate * context_gate;
    let comp_mult = clamp(1.0 - cfg.comp_lambda * comp_raw, 1.0 - cfg.comp_lambda, 1.0);

    (res_mult, res_score, comp_mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Link, LinkType, Node, NodeType, Scope};

    fn graph_pair() -> Graph {
        let mut g = Graph::new();
        for id in ["a", "b"] {
            g.add_node(Node::new(id, NodeType::Concept, Scope::Personal, id)).unwrap();
        }
        g
    }

    #[test]
    fn ease_cost_tracks_weight() {
        let cfg = Config::from_env();
        let g = graph_pair();
        let mut l = Link::between_nodes("l", "a", "b", LinkType::Association);
        l.log_weight = 1.0;
        let c = link_cost(&g, &l, None, None, None, false, &cfg);
        assert!((c.ease - 1.0f64.exp()).abs() < 1e-12);
        assert!((c.ease_cost - (-1.0f64).exp()).abs() < 1e-12);
        assert!((c.total_cost - c.base_cost).abs() < 1e-12);
    }

    #[test]
    fn overlay_context_changes_cost() {
        let cfg = Config::from_env();
        let g = graph_pair();
        let mut l = Link::between_nodes("l", "a", "b", LinkType::Association);
        l.log_weight_overlays.insert("entity_fn_x".into(), 1.0);
        let global = link_cost(&g, &l, None, None, None, false, &cfg);
        let scoped = link_cost(&g, &l, Some("entity_fn_x"), None, None, false, &cfg);
        assert!(scoped.total_cost < global.total_cost);
    }

    #[test]
    fn goal_affinity_reduces_cost() {
        let cfg = Config::from_env();
        let mut g = graph_pair();
        g.get_node_mut("b").unwrap().embedding = Some(vec![1.0, 0.0]);
        let l = Link::between_nodes("l", "a", "b", LinkType::Association);
        let goal = vec![1.0, 0.0];
        let with_goal = link_cost(&g, &l, None, None, Some(&goal), false, &cfg);
        let without = link_cost(&g, &l, None, None, None, false, &cfg);
        assert!((with_goal.goal_affinity - 1.0).abs() < 1e-9);
        assert!(with_goal.total_cost < without.total_cost);
    }

    #[test]
    fn resonance_attracts_aligned_affect() {
        let cfg = Config::from_env();
        let g = graph_pair();
        let mut l = Link::between_nodes("l", "a", "b", LinkType::Association);
        l.emotion = Some(Affect::new(0.8, 0.3));
        let affect = Affect::new(0.7, 0.2);
        let c = link_cost(&g, &l, None, Some(&affect), None, true, &cfg);
        assert!(c.res_mult < 1.0);
        assert!(c.res_score > 0.9);
        assert!(c.total_cost < c.base_cost);
    }

    #[test]
    fn complementarity_needs_arousal() {
        let cfg = Config::from_env();
        let g = graph_pair();
        let mut l = Link::between_nodes("l", "a", "b", LinkType::Association);
        l.emotion = Some(Affect::new(-0.8, -0.3));
        let calm = Affect::new(0.8, 0.1);
        let hot = Affect::new(0.8, 0.9);
        let c_calm = link_cost(&g, &l, None, Some(&calm), None, true, &cfg);
        let c_hot = link_cost(&g, &l, None, Some(&hot), None, true, &cfg);
        assert!((c_calm.comp_mult - 1.0).abs() < 1e-12, "no pull when calm");
        assert!(c_hot.comp_mult < 1.0, "regulation pull under high arousal");
    }

    #[test]
    fn gates_off_means_neutral_multipliers() {
        let cfg = Config::from_env();
        let g = graph_pair();
        let mut l = Link::between_nodes("l", "a", "b", LinkType::Association);
        l.emotion = Some(Affect::new(0.8, 0.3));
        let affect = Affect::new(0.7, 0.2);
        let c = link_cost(&g, &l, None, Some(&affect), None, false, &cfg);
        assert_eq!(c.emotion_mult, 1.0);
    }
}
