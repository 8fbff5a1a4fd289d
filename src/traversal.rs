//! Two-scale traversal: hunger-scored entity selection, boundary strides
//! across RELATES_TO, and within-entity stride execution.
//!
//! Between-entity movement asks which neighborhood is hungriest for
//! attention; within-entity movement is plain stride execution over the
//! chosen entity's members.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::diffusion::stride::{execute_stride, StrideOutcome, StrideParams};
use crate::diffusion::DiffusionState;
use crate::graph::{Endpoint, Graph, Link, LinkType};
use crate::stats::{cosine, ema_step, softmax};
use crate::strengthen::Strengthener;
use crate::telemetry::Emitter;

#[derive(Debug, Clone)]
pub struct HungerScore {
    pub entity_id: String,
    pub goal_fit: f64,
    pub integration: f64,
    pub completeness: f64,
    pub ease: f64,
    pub novelty: f64,
    pub total: f64,
}

pub struct Traversal {
    pub current_entity: Option<String>,
    rng: StdRng,
}

impl Traversal {
    pub fn new() -> Self {
        Self {
            current_entity: None,
            rng: StdRng::seed_from_u64(0x747261),
        }
    }

    /// Score every candidate entity on the five hungers.
    pub fn score_candidates(
        &self,
        graph: &Graph,
        goal_embedding: Option<&[f64]>,
        cfg: &Config,
    ) -> Vec<HungerScore> {
        let current = self.current_entity.as_deref();
        let current_centroid = current
            .and_then(|id| graph.get_entity(id))
            .and_then(|e| e.centroid_embedding.clone());

        // Ease normalizer: strongest RELATES_TO edge out of the current entity.
        let mut max_ease = 0.0f64;
        let eases: std::collections::HashMap<String, f64> = match current.and_then(|id| graph.get_entity(id)) {
            Some(entity) => entity
                .relates_out
                .iter()
                .filter_map(|lid| graph.get_link(lid))
                .map(|l| {
                    let e = l.log_weight.exp();
                    max_ease = max_ease.max(e);
                    (l.target.id().to_string(), e)
                })
                .collect(),
            None => Default::default(),
        };

        graph
            .entities()
            .filter(|e| Some(e.id.as_str()) != current)
            .map(|entity| {
                let goal_fit = match (goal_embedding, entity.centroid_embedding.as_ref()) {
                    (Some(goal), Some(centroid)) => (cosine(centroid, goal) + 1.0) / 2.0,
                    _ => 0.5,
                };
                let integration = match (current_centroid.as_ref(), entity.centroid_embedding.as_ref()) {
                    (Some(cur), Some(cand)) => 1.0 - (cosine(cur, cand) + 1.0) / 2.0,
                    _ => 0.5,
                };
                let members = graph.entity_members(&entity.id);
                let active = members
                    .iter()
                    .filter(|(id, _)| graph.get_node(id).map(|n| n.is_active()).unwrap_or(false))
                    .count();
                let completeness = if members.is_empty() {
                    1.0
                } else {
                    1.0 - active as f64 / members.len() as f64
                };
                let ease = if max_ease > 0.0 {
                    eases.get(&entity.id).copied().unwrap_or(0.0) / max_ease
                } else {
                    0.0
                };
                let novelty = 1.0 - entity.ema_active;

                let w = &cfg.hunger_weights;
                let w_sum: f64 = w.iter().sum();
                let total = (w[0] * goal_fit
                    + w[1] * integration
                    + w[2] * completeness
                    + w[3] * ease
                    + w[4] * novelty)
                    / w_sum.max(1e-9);

                HungerScore {
                    entity_id: entity.id.clone(),
                    goal_fit,
                    integration,
                    completeness,
                    ease,
                    novelty,
                    total,
                }
            })
            .collect()
    }

    /// Pick the next entity: argmax, or a softmax sample when configured.
    pub fn choose_next(
        &mut self,
        graph: &Graph,
        goal_embedding: Option<&[f64]>,
        cfg: &Config,
    ) -> Option<String> {
        let scores = self.score_candidates(graph, goal_embedding, cfg);
        if scores.is_empty() {
            return None;
        }
        if cfg.hunger_softmax_sample {
            let totals: Vec<f64> = scores.iter().map(|s| s.total).collect();
            let probs = softmax(&totals, 0.25);
            let mut roll: f64 = self.rng.gen();
            for (score, p) in scores.iter().zip(probs.iter()) {
                roll -= p;
                if roll <= 0.0 {
                    return Some(score.entity_id.clone());
                }
            }
            return scores.last().map(|s| s.entity_id.clone());
        }
        scores
            .into_iter()
            .max_by(|a, b| a.total.partial_cmp(&b.total).unwrap_or(std::cmp::Ordering::Equal))
            .map(|s| s.entity_id)
    }

    /// Allocate the frame's stride budget across the top-scored entities by
    /// softmax share. The current entity competes in the same pool (scored
    /// as the strongest candidate when the hunger pass excluded it), and
    /// largest-remainder rounding keeps the shares summing to exactly
    /// `budget`.
    pub fn allocate_budget(
        &self,
        scores: &[HungerScore],
        budget: usize,
        top: usize,
    ) -> Vec<(String, usize)> {
        let mut pool: Vec<(String, f64)> = {
            let mut ranked: Vec<&HungerScore> = scores.iter().collect();
            ranked.sort_by(|a, b| {
                b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal)
            });
            ranked.truncate(top.max(1));
            ranked.iter().map(|s| (s.entity_id.clone(), s.total)).collect()
        };
        if let Some(current) = self.current_entity.as_deref() {
            if !pool.iter().any(|(id, _)| id == current) {
                let strongest = pool.iter().map(|(_, t)| *t).fold(0.0, f64::max);
                pool.push((current.to_string(), strongest));
            }
        }
        if pool.is_empty() || budget == 0 {
            return Vec::new();
        }

        let totals: Vec<f64> = pool.iter().map(|(_, t)| *t).collect();
        let shares = softmax(&totals, 0.5);
        let quotas: Vec<f64> = shares.iter().map(|s| s * budget as f64).collect();
        let mut seats: Vec<usize> = quotas.iter().map(|q| q.floor() as usize).collect();
        let mut assigned: usize = seats.iter().sum();
        let mut order: Vec<usize> = (0..pool.len()).collect();
        order.sort_by(|&a, &b| {
            let ra = quotas[a] - quotas[a].floor();
            let rb = quotas[b] - quotas[b].floor();
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut i = 0;
        while assigned < budget && i < order.len() {
            seats[order[i]] += 1;
            assigned += 1;
            i += 1;
        }

        pool.into_iter()
            .zip(seats)
            .map(|((id, _), n)| (id, n))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// One boundary stride from the current entity toward `next_id`, plus
    /// RELATES_TO learning. Moves `current_entity` to `next_id` afterwards.
    pub fn boundary_stride(
        &mut self,
        graph: &mut Graph,
        state: &mut DiffusionState,
        next_id: &str,
        params: &StrideParams,
        cfg: &Config,
    ) -> Option<StrideOutcome> {
        let current_id = self.current_entity.clone()?;
        if current_id == next_id {
            return None;
        }

        // Source: the current entity's hottest member.
        let src = graph
            .entity_members(&current_id)
            .into_iter()
            .filter_map(|(id, _)| graph.get_node(&id).map(|n| (id, n.energy)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        let (src_id, src_energy) = src;
        if src_energy <= cfg.energy_floor {
            self.current_entity = Some(next_id.to_string());
            return None;
        }

        // Target: the member of the next entity with the best gap * ease.
        let dst_id = graph
            .entity_members(next_id)
            .into_iter()
            .filter_map(|(id, _)| {
                let node = graph.get_node(&id)?;
                let gap = (node.theta - node.energy).max(0.0);
                let mean_ease = if node.incoming.is_empty() {
                    1.0
                } else {
                    node.incoming
                        .iter()
                        .filter_map(|lid| graph.get_link(lid))
                        .map(|l| l.log_weight.exp())
                        .sum::<f64>()
                        / node.incoming.len() as f64
                };
                Some((id, gap * mean_ease))
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _)| id)?;

        let relates_id = self.ensure_relates_link(graph, &current_id, next_id);
        let relates_lw = graph.get_link(&relates_id).map(|l| l.log_weight).unwrap_or(0.0);

        let avail = src_energy + state.staged(&src_id);
        let delta_e = (avail * relates_lw.exp() * params.alpha_tick * params.dt).min(avail.max(0.0));
        if delta_e <= 0.0 {
            self.current_entity = Some(next_id.to_string());
            return None;
        }
        let stickiness = graph
            .get_node(&dst_id)
            .map(|n| if n.consolidated { 1.0 } else { n.node_type.stickiness() })
            .unwrap_or(1.0)
            .clamp(0.1, 1.0);
        let retained = stickiness * delta_e;
        state.stage(&src_id, &dst_id, delta_e, retained, &relates_id, Some(&current_id));

        // Learn the boundary: weight, stride count, semantic distance.
        let centroid_dist = {
            let cur = graph.get_entity(&current_id).and_then(|e| e.centroid_embedding.clone());
            let nxt = graph.get_entity(next_id).and_then(|e| e.centroid_embedding.clone());
            match (cur, nxt) {
                (Some(a), Some(b)) => Some(1.0 - (cosine(&a, &b) + 1.0) / 2.0),
                _ => None,
            }
        };
        if let Some(link) = graph.get_link_mut(&relates_id) {
            link.log_weight =
                (link.log_weight + cfg.learning_rate_base * delta_e).min(cfg.weight_ceiling);
            link.boundary_stride_count += 1;
            if let Some(d) = centroid_dist {
                link.semantic_distance = ema_step(link.semantic_distance, d, cfg.ema_alpha);
            }
        }

        self.current_entity = Some(next_id.to_string());
        Some(StrideOutcome {
            link_id: relates_id,
            src: src_id,
            dst: dst_id,
            delta_e,
            retained,
            tier: crate::strengthen::Tier::Weak,
            phi: 0.0,
            weight_delta: cfg.learning_rate_base * delta_e,
        })
    }

    fn ensure_relates_link(&self, graph: &mut Graph, from: &str, to: &str) -> String {
        let existing = graph
            .get_entity(from)
            .map(|e| e.relates_out.clone())
            .unwrap_or_default()
            .into_iter()
            .find(|lid| {
                graph
                    .get_link(lid)
                    .map(|l| l.target.id() == to)
                    .unwrap_or(false)
            });
        if let Some(id) = existing {
            return id;
        }
        let id = format!("rel_{}__{}", from, to);
        let mut link = Link::new(
            &id,
            Endpoint::Entity(from.to_string()),
            Endpoint::Entity(to.to_string()),
            LinkType::RelatesTo,
        );
        link.subentity = Some(from.to_string());
        // Creation can only fail on a duplicate id, which the lookup above
        // already excluded.
        let _ = graph.add_link_lenient(link);
        id
    }

    /// Within-entity stride execution over the chosen entity's active
    /// members, hottest first, until the share is spent.
    #[allow(clippy::too_many_arguments)]
    pub fn within_entity_strides(
        &mut self,
        graph: &mut Graph,
        state: &mut DiffusionState,
        strengthener: &mut Strengthener,
        entity_id: Option<&str>,
        share: usize,
        params: &StrideParams,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) -> usize {
        let mut sources: Vec<(String, f64)> = match entity_id {
            Some(eid) => graph
                .entity_members(eid)
                .into_iter()
                .filter_map(|(id, _)| graph.get_node(&id).map(|n| (id, n.energy)))
                .collect(),
            None => state
                .active
                .iter()
                .filter_map(|id| graph.get_node(id).map(|n| (id.clone(), n.energy)))
                .collect(),
        };
        sources.retain(|(id, _)| state.active.contains(id));
        sources.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut executed = 0usize;
        let mut p = params.clone();
        p.entity_ctx = entity_id.map(|s| s.to_string());
        for (src, _) in sources {
            if executed >= share {
                break;
            }
            if execute_stride(graph, state, strengthener, &src, &p, cfg, emitter, frame_id).is_some()
            {
                executed += 1;
            }
        }
        executed
    }
}

impl Default for Traversal {
    fn default() -> Self {
        Self::new()
    }
}
