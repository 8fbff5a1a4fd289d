//! Single-stride execution: pick the cheapest outgoing link under the
//! fanout plan, stage the transfer, and strengthen the link in place.

use crate::affect::Affect;
use crate::config::{Config, TaskMode};
use crate::diffusion::cost::{link_cost, CostBreakdown};
use crate::diffusion::fanout::{self, FanoutPlan};
use crate::diffusion::DiffusionState;
use crate::graph::{Endpoint, Graph};
use crate::strengthen::{classify, stride_utility, Strengthener, Tier};
use crate::telemetry::{Emitter, Event, StrideExec, StrideSelection};

/// Per-frame parameters shared by every stride in the frame.
#[derive(Debug, Clone)]
pub struct StrideParams {
    pub entity_ctx: Option<String>,
    pub entity_affect: Option<Affect>,
    pub goal_embedding: Option<Vec<f64>>,
    pub alpha_tick: f64,
    pub dt: f64,
    pub gates_enabled: bool,
    pub wm_headroom: f64,
    pub task_mode: Option<TaskMode>,
    pub safe_mode_selective: bool,
}

#[derive(Debug, Clone)]
pub struct StrideOutcome {
    pub link_id: String,
    pub src: String,
    pub dst: String,
    pub delta_e: f64,
    pub retained: f64,
    pub tier: Tier,
    pub phi: f64,
    pub weight_delta: f64,
}

/// Execute one stride from `src_id`. Returns None when the source has no
/// transferable energy or no node-to-node candidates.
pub fn execute_stride(
    graph: &mut Graph,
    state: &mut DiffusionState,
    strengthener: &mut Strengthener,
    src_id: &str,
    params: &StrideParams,
    cfg: &Config,
    emitter: &mut Emitter,
    frame_id: u64,
) -> Option<StrideOutcome> {
    let (avail, src_theta, candidates) = {
        let src = graph.get_node(src_id)?;
        let avail = src.energy + state.staged(src_id);
        let candidates: Vec<String> = src
            .outgoing
            .iter()
            .filter(|lid| {
                graph
                    .get_link(lid)
                    .map(|l| matches!(l.target, Endpoint::Node(_)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        (avail, src.theta, candidates)
    };
    if avail <= cfg.energy_floor || candidates.is_empty() {
        return None;
    }

    let entity_ctx = params.entity_ctx.as_deref();
    let plan = fanout::plan(
        candidates.len(),
        params.wm_headroom,
        params.task_mode,
        params.safe_mode_selective,
        cfg,
    );
    emitter.emit(
        frame_id,
        &Event::StrideSelection(StrideSelection {
            src_node: src_id.to_string(),
            strategy: plan.strategy.as_str().to_string(),
            top_k: plan.top_k,
            structure_would_suggest: plan.structure_would_suggest.as_str().to_string(),
            outdegree: candidates.len(),
            wm_headroom: params.wm_headroom,
        }),
    );

    let pruned = prune_by_weight(graph, candidates, entity_ctx, &plan);

    // Full cost only on the pruned set.
    let mut scored: Vec<(String, CostBreakdown)> = Vec::new();
    for lid in &pruned {
        let Some(link) = graph.get_link(lid) else {
            continue;
        };
        let breakdown = link_cost(
            graph,
            link,
            entity_ctx,
            params.entity_affect.as_ref(),
            params.goal_embedding.as_deref(),
            params.gates_enabled,
            cfg,
        );
        scored.push((lid.clone(), breakdown));
    }
    if scored.is_empty() {
        return None;
    }
    let best_idx = scored
        .iter()
        .enumerate()
        .min_by(|(_, (_, a)), (_, (_, b))| {
            a.total_cost.partial_cmp(&b.total_cost).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    // One-hot by default; the optional split spreads the transfer across
    // the scored set by softmax of -cost/T.
    let shares: Vec<f64> = if cfg.topk_split_enabled && scored.len() > 1 {
        let negcosts: Vec<f64> = scored.iter().map(|(_, b)| -b.total_cost).collect();
        crate::stats::softmax(&negcosts, cfg.topk_split_temperature)
    } else {
        let mut one_hot = vec![0.0; scored.len()];
        one_hot[best_idx] = 1.0;
        one_hot
    };

    let best_lw = graph
        .get_link(&scored[best_idx].0)?
        .effective_log_weight(entity_ctx);
    let delta_total = (avail * best_lw.exp() * params.alpha_tick * params.dt).min(avail);
    if delta_total <= 0.0 {
        return None;
    }

    let mut remaining = avail;
    let mut primary: Option<StrideOutcome> = None;
    for (i, ((link_id, breakdown), share)) in scored.iter().zip(shares.iter()).enumerate() {
        let delta_e = delta_total * share;
        if delta_e <= 0.0 {
            continue;
        }
        let (dst_id, emotion_mag) = {
            let Some(link) = graph.get_link(link_id) else {
                continue;
            };
            (
                link.target.id().to_string(),
                link.emotion.map(|e| e.magnitude()).unwrap_or(0.0),
            )
        };
        let (dst_theta, stickiness) = {
            let Some(dst) = graph.get_node(&dst_id) else {
                continue;
            };
            let s = if dst.consolidated { 1.0 } else { dst.node_type.stickiness() };
            (dst.theta, s.clamp(0.1, 1.0))
        };
        let retained = stickiness * delta_e;

        let dst_pre =
            graph.get_node(&dst_id).map(|n| n.energy).unwrap_or(0.0) + state.staged(&dst_id);
        state.stage(src_id, &dst_id, delta_e, retained, link_id, entity_ctx);
        let dst_post = dst_pre + retained;
        remaining -= delta_e;

        let tier = classify(
            remaining >= src_theta,
            dst_pre >= dst_theta,
            dst_post >= dst_theta,
        );
        let phi = stride_utility(retained, dst_pre, dst_theta);
        let z_phi = strengthener.observe_phi(phi);
        let weight_delta = {
            let Some(link) = graph.get_link_mut(link_id) else {
                continue;
            };
            strengthener.strengthen(link, delta_e, tier, z_phi, emotion_mag, cfg)
        };

        if i == best_idx {
            emitter.emit(
                frame_id,
                &Event::Stride(StrideExec {
                    src_node: src_id.to_string(),
                    dst_node: dst_id.clone(),
                    link_id: link_id.clone(),
                    phi,
                    ease: breakdown.ease,
                    ease_cost: breakdown.ease_cost,
                    goal_affinity: breakdown.goal_affinity,
                    res_mult: breakdown.res_mult,
                    res_score: breakdown.res_score,
                    comp_mult: breakdown.comp_mult,
                    emotion_mult: breakdown.emotion_mult,
                    base_cost: breakdown.base_cost,
                    total_cost: breakdown.total_cost,
                    reason: tier.reason().to_string(),
                    delta_e,
                    stickiness,
                    retained_delta_e: retained,
                    chosen: true,
                    tier: Some(tier.as_str().to_string()),
                    tier_scale: Some(tier.scale()),
                    stride_utility_zscore: Some(z_phi),
                }),
            );
            primary = Some(StrideOutcome {
                link_id: link_id.clone(),
                src: src_id.to_string(),
                dst: dst_id,
                delta_e,
                retained,
                tier,
                phi,
                weight_delta,
            });
        }
    }
    primary
}

/// Quick heuristic prune: keep the `top_k` heaviest links before full cost
/// scoring.
fn prune_by_weight(
    graph: &Graph,
    mut candidates: Vec<String>,
    entity_ctx: Option<&str>,
    plan: &FanoutPlan,
) -> Vec<String> {
    candidates.sort_by(|a, b| {
        let wa = graph.get_link(a).map(|l| l.effective_log_weight(entity_ctx)).unwrap_or(f64::MIN);
        let wb = graph.get_link(b).map(|l| l.effective_log_weight(entity_ctx)).unwrap_or(f64::MIN);
        wb.partial_cmp(&wa).unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates.truncate(plan.top_k.max(1));
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Link, LinkType, Node, NodeType, Scope};

    fn params() -> StrideParams {
        StrideParams {
            entity_ctx: None,
            entity_affect: None,
            goal_embedding: None,
            alpha_tick: 0.1,
            dt: 1.0,
            gates_enabled: false,
            wm_headroom: 1.0,
            task_mode: None,
            safe_mode_selective: false,
        }
    }

    fn star(weights: &[f64]) -> Graph {
        let mut g = Graph::new();
        let mut src = Node::new("src", NodeType::Concept, Scope::Personal, "src");
        src.energy = 1.0;
        src.theta = 0.5;
        g.add_node(src).unwrap();
        for (i, w) in weights.iter().enumerate() {
            let id = format!("t{}", i);
            let mut n = Node::new(&id, NodeType::Concept, Scope::Personal, &id);
            n.theta = 1.0;
            g.add_node(n).unwrap();
            let mut l = Link::between_nodes(&format!("l{}", i), "src", &id, LinkType::Association);
            l.log_weight = *w;
            g.add_link(l).unwrap();
        }
        g
    }

    #[test]
    fn picks_heaviest_link() {
        let mut g = star(&[0.1, 0.9, 0.4]);
        let mut st = DiffusionState::new();
        st.refresh_frontier(&g);
        let mut strength = Strengthener::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let out = execute_stride(&mut g, &mut st, &mut strength, "src", &params(), &Config::from_env(), &mut em, 1)
            .unwrap();
        assert_eq!(out.link_id, "l1");
        assert_eq!(out.dst, "t1");
    }

    #[test]
    fn delta_follows_transfer_law() {
        let mut g = star(&[0.5]);
        let mut st = DiffusionState::new();
        st.refresh_frontier(&g);
        let mut strength = Strengthener::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let out = execute_stride(&mut g, &mut st, &mut strength, "src", &params(), &Config::from_env(), &mut em, 1)
            .unwrap();
        let expected = 1.0 * 0.5f64.exp() * 0.1 * 1.0;
        assert!((out.delta_e - expected).abs() < 1e-12);
        // Concept targets are fully sticky.
        assert!((out.retained - expected).abs() < 1e-12);
        assert!(st.residual().abs() < 1e-12);
    }

    #[test]
    fn delta_clamped_to_available_energy() {
        let mut g = star(&[2.0]);
        g.get_node_mut("src").unwrap().energy = 0.05;
        let mut st = DiffusionState::new();
        st.refresh_frontier(&g);
        let mut strength = Strengthener::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let out = execute_stride(&mut g, &mut st, &mut strength, "src", &params(), &Config::from_env(), &mut em, 1)
            .unwrap();
        assert!(out.delta_e <= 0.05 + 1e-12);
    }

    #[test]
    fn exhausted_source_declines() {
        let mut g = star(&[0.5]);
        g.get_node_mut("src").unwrap().energy = 0.0;
        let mut st = DiffusionState::new();
        st.refresh_frontier(&g);
        let mut strength = Strengthener::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        assert!(execute_stride(&mut g, &mut st, &mut strength, "src", &params(), &Config::from_env(), &mut em, 1)
            .is_none());
    }

    #[test]
    fn stride_event_carries_breakdown() {
        let mut g = star(&[0.5]);
        let mut st = DiffusionState::new();
        st.refresh_frontier(&g);
        let mut strength = Strengthener::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        execute_stride(&mut g, &mut st, &mut strength, "src", &params(), &Config::from_env(), &mut em, 7).unwrap();
        let strides = em.captured_named("stride.exec");
        assert_eq!(strides.len(), 1);
        let d = &strides[0]["data"];
        assert_eq!(d["src_node"], "src");
        assert_eq!(d["chosen"], true);
        assert!(d["ease"].as_f64().unwrap() > 1.0);
        assert!(d["tier"].is_string());
    }

    #[test]
    fn split_mode_spreads_transfer() {
        let mut cfg = Config::from_env();
        cfg.topk_split_enabled = true;
        let mut g = star(&[0.5, 0.4]);
        let mut st = DiffusionState::new();
        st.refresh_frontier(&g);
        let mut strength = Strengthener::new();
        let mut em = Emitter::memory("t", 256, 0.0);
        let out = execute_stride(&mut g, &mut st, &mut strength, "src", &params(), &cfg, &mut em, 1)
            .unwrap();
        // Primary outcome follows the cheapest link; both targets received.
        assert_eq!(out.dst, "t0");
        st.commit(&mut g, &mut em, 1);
        assert!(g.get_node("t0").unwrap().energy > 0.0);
        assert!(g.get_node("t1").unwrap().energy > 0.0);
        assert!(g.get_node("t0").unwrap().energy > g.get_node("t1").unwrap().energy);
    }

    #[test]
    fn overlay_context_steers_selection() {
        let mut g = star(&[0.5, 0.5]);
        g.get_link_mut("l0")
            .unwrap()
            .log_weight_overlays
            .insert("entity_fn_ctx".into(), 1.0);
        let mut st = DiffusionState::new();
        st.refresh_frontier(&g);
        let mut strength = Strengthener::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let mut p = params();
        p.entity_ctx = Some("entity_fn_ctx".into());
        let out = execute_stride(&mut g, &mut st, &mut strength, "src", &p, &Config::from_env(), &mut em, 1)
            .unwrap();
        assert_eq!(out.link_id, "l0");
    }
}
