//! Entity activation and lifecycle.
//!
//! Entity energy is derived each frame from member surpluses; thresholds
//! come from a rolling cohort of entity energies with quality modulation and
//! a hysteresis band. Quality EMAs feed lifecycle transitions; sustained low
//! quality dissolves the entity and frees its members.

use crate::affect::Affect;
use crate::config::Config;
use crate::graph::{ActivationLevel, Graph, StabilityState};
use crate::stats::{clamp, cosine, ema_step, RollingWindow};
use crate::telemetry::{Emitter, Event, SubentityFlip, SubentityLifecycle};

const THETA_FLOOR: f64 = 1e-3;

#[derive(Debug, Clone, Default)]
pub struct EntityFrameReport {
    pub active_entities: Vec<String>,
    pub dominant: Option<String>,
    pub mean_arousal: f64,
    pub flips: usize,
    pub dissolved: Vec<String>,
}

pub struct EntityRuntime {
    cohort: RollingWindow,
    last_dominant: Option<String>,
}

impl EntityRuntime {
    pub fn new() -> Self {
        Self { cohort: RollingWindow::new(100), last_dominant: None }
    }

    /// Derived energy for one entity: membership-weighted surplus over
    /// member thresholds, memberships normalized to sum to 1.
    pub fn entity_energy(graph: &Graph, entity_id: &str) -> (f64, usize, usize) {
        let members = graph.entity_members(entity_id);
        let total_m: f64 = members.iter().map(|(_, m)| m).sum();
        if members.is_empty() || total_m <= 0.0 {
            return (0.0, 0, 0);
        }
        let mut energy = 0.0;
        let mut active_members = 0usize;
        for (node_id, m) in &members {
            let Some(node) = graph.get_node(node_id) else {
                continue;
            };
            let surplus = (node.energy - node.theta).max(0.0);
            if node.is_active() {
                active_members += 1;
            }
            energy += (m / total_m) * surplus;
        }
        (energy, members.len(), active_members)
    }

    /// Recompute per-entity affect context from members carrying affect.
    pub fn refresh_affect(graph: &mut Graph) {
        let ids = graph.entity_ids();
        for id in ids {
            let members = graph.entity_members(&id);
            let weighted: Vec<(Affect, f64)> = members
                .iter()
                .filter_map(|(node_id, m)| {
                    graph.get_node(node_id).and_then(|n| n.affect).map(|a| (a, *m))
                })
                .collect();
            if let Some(entity) = graph.get_entity_mut(&id) {
                entity.affect = Affect::weighted_mean(&weighted);
            }
        }
    }

    /// Full per-frame entity pass: energies, thresholds, flips, quality,
    /// lifecycle, dissolution.
    pub fn update(
        &mut self,
        graph: &mut Graph,
        controller_multiplier: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) -> EntityFrameReport {
        let mut report = EntityFrameReport::default();
        let ids = graph.entity_ids();
        let mut to_dissolve: Vec<String> = Vec::new();
        let mut arousal_sum = 0.0;
        let mut arousal_n = 0usize;
        let mut best: Option<(String, f64)> = None;

        for id in &ids {
            let (energy, member_count, active_members) = Self::entity_energy(graph, id);
            let coherence = Self::coherence(graph, id);
            // Cohort stats from previously touched entities; the current
            // reading joins the window afterwards.
            let cohort_mean = self.cohort.mean();
            let cohort_std = self.cohort.std();
            self.cohort.push(energy);

            let Some(entity) = graph.get_entity_mut(id) else {
                continue;
            };
            entity.frames_since_creation += 1;

            let quality = entity.quality_score();
            let quality_mod = clamp(1.1 - 0.2 * quality, 0.9, 1.1);
            let hysteresis = if entity.active {
                1.0 - cfg.entity_hysteresis
            } else {
                1.0 + cfg.entity_hysteresis
            };
            let theta = ((cohort_mean + 0.25 * cohort_std) * quality_mod * hysteresis
                * controller_multiplier)
                .max(THETA_FLOOR);

            let was_active = entity.active;
            let is_active = energy >= theta;
            entity.energy_runtime = energy;
            entity.threshold_runtime = theta;
            entity.activation_level_runtime = ActivationLevel::from_ratio(energy / theta.max(1e-9));
            entity.active = is_active;

            entity.ema_active = ema_step(entity.ema_active, is_active as u8 as f64, cfg.ema_alpha);
            if let Some(c) = coherence {
                entity.coherence_ema = ema_step(entity.coherence_ema, c, cfg.ema_alpha);
            }

            if was_active != is_active {
                entity.identity_flip_count += 1;
                report.flips += 1;
                emitter.emit(
                    frame_id,
                    &Event::SubentityFlip(SubentityFlip {
                        entity_id: id.clone(),
                        flip_direction: if is_active { "activate" } else { "deactivate" }.into(),
                        energy,
                        threshold: theta,
                        activation_level: entity.activation_level_runtime.as_str().into(),
                        member_count,
                        active_members,
                    }),
                );
            }

            if is_active {
                report.active_entities.push(id.clone());
                if let Some(a) = entity.affect {
                    arousal_sum += a.arousal.abs();
                    arousal_n += 1;
                }
                if best.as_ref().map(|(_, e)| energy > *e).unwrap_or(true) {
                    best = Some((id.clone(), energy));
                }
            }

            // Lifecycle from quality streaks.
            if quality >= cfg.entity_promote_quality {
                entity.promote_streak += 1;
                entity.demote_streak = 0;
            } else if quality <= cfg.entity_demote_quality {
                entity.demote_streak += 1;
                entity.promote_streak = 0;
            } else {
                entity.promote_streak = 0;
                entity.demote_streak = 0;
            }

            let mut transition: Option<(StabilityState, &str, &str)> = None;
            if entity.promote_streak >= cfg.entity_promote_streak {
                match entity.stability_state {
                    StabilityState::Candidate => {
                        transition = Some((StabilityState::Provisional, "promotion", "sustained_quality"));
                    }
                    StabilityState::Provisional => {
                        transition = Some((StabilityState::Mature, "promotion", "sustained_quality"));
                    }
                    _ => {}
                }
            } else if entity.demote_streak >= cfg.entity_demote_streak {
                match entity.stability_state {
                    StabilityState::Mature => {
                        transition = Some((StabilityState::Provisional, "demotion", "sustained_low_quality"));
                    }
                    StabilityState::Provisional => {
                        transition = Some((StabilityState::Candidate, "demotion", "sustained_low_quality"));
                    }
                    StabilityState::Candidate => {
                        transition = Some((StabilityState::Dissolved, "dissolution", "sustained_low_quality"));
                    }
                    StabilityState::Dissolved => {}
                }
            }

            if let Some((next, trigger, reason)) = transition {
                let old = entity.stability_state;
                entity.stability_state = next;
                entity.promote_streak = 0;
                entity.demote_streak = 0;
                emitter.emit(
                    frame_id,
                    &Event::SubentityLifecycle(SubentityLifecycle {
                        entity_id: id.clone(),
                        old_state: old.as_str().into(),
                        new_state: next.as_str().into(),
                        quality_score: quality,
                        trigger: trigger.into(),
                        reason: reason.into(),
                    }),
                );
                if next == StabilityState::Dissolved {
                    to_dissolve.push(id.clone());
                }
            }
        }

        for id in to_dissolve {
            if graph.remove_entity(&id).is_ok() {
                report.dissolved.push(id);
            }
        }

        report.mean_arousal = if arousal_n > 0 { arousal_sum / arousal_n as f64 } else { 0.0 };

        // Dominant-identity bookkeeping: the new dominant remembers who it
        // displaced.
        report.dominant = best.map(|(id, _)| id);
        if report.dominant != self.last_dominant {
            if let Some(new_id) = &report.dominant {
                if let Some(e) = graph.get_entity_mut(new_id) {
                    e.previous_dominant_identity = self.last_dominant.clone();
                }
            }
            self.last_dominant = report.dominant.clone();
        }
        report
    }

    /// Mean similarity of member embeddings to the entity centroid.
    fn coherence(graph: &Graph, entity_id: &str) -> Option<f64> {
        let entity = graph.get_entity(entity_id)?;
        let centroid = entity.centroid_embedding.as_ref()?;
        let members = graph.entity_members(entity_id);
        let sims: Vec<f64> = members
            .iter()
            .filter_map(|(node_id, _)| {
                graph
                    .get_node(node_id)
                    .and_then(|n| n.embedding.as_ref())
                    .map(|emb| (cosine(emb, centroid) + 1.0) / 2.0)
            })
            .collect();
        if sims.is_empty() {
            return None;
        }
        Some(sims.iter().sum::<f64>() / sims.len() as f64)
    }
}

impl Default for EntityRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Endpoint, Entity, EntityKind, Link, LinkType, Node, NodeType, Scope};

    fn member_link(id: &str, node: &str, entity: &str, weight: f64) -> Link {
        let mut l = Link::new(
            id,
            Endpoint::Node(node.into()),
            Endpoint::Entity(entity.into()),
            LinkType::BelongsTo,
        );
        l.membership_weight = weight;
        l
    }

    fn node_with(id: &str, energy: f64, theta: f64) -> Node {
        let mut n = Node::new(id, NodeType::Concept, Scope::Personal, id);
        n.energy = energy;
        n.theta = theta;
        n
    }

    #[test]
    fn entity_energy_is_weighted_surplus() {
        let mut g = Graph::new();
        g.add_node(node_with("a", 2.0, 1.0)).unwrap();
        g.add_node(node_with("b", 0.5, 1.0)).unwrap();
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional)).unwrap();
        g.add_link(member_link("m1", "a", "entity_fn_x", 0.6)).unwrap();
        g.add_link(member_link("m2", "b", "entity_fn_x", 0.2)).unwrap();
        let (energy, count, active) = EntityRuntime::entity_energy(&g, "entity_fn_x");
        // Normalized memberships 0.75/0.25; only a has surplus (1.0).
        assert!((energy - 0.75).abs() < 1e-12);
        assert_eq!(count, 2);
        assert_eq!(active, 1);
    }

    #[test]
    fn adding_active_member_increases_energy() {
        let mut g = Graph::new();
        g.add_node(node_with("a", 0.2, 1.0)).unwrap();
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional)).unwrap();
        g.add_link(member_link("m1", "a", "entity_fn_x", 0.5)).unwrap();
        let (before, _, _) = EntityRuntime::entity_energy(&g, "entity_fn_x");
        g.add_node(node_with("b", 3.0, 1.0)).unwrap();
        g.add_link(member_link("m2", "b", "entity_fn_x", 0.5)).unwrap();
        let (after, _, _) = EntityRuntime::entity_energy(&g, "entity_fn_x");
        assert!(after > before);
    }

    #[test]
    fn empty_entity_has_zero_energy() {
        let mut g = Graph::new();
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional)).unwrap();
        assert_eq!(EntityRuntime::entity_energy(&g, "entity_fn_x").0, 0.0);
    }

    #[test]
    fn flip_emits_event() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        g.add_node(node_with("a", 5.0, 1.0)).unwrap();
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional)).unwrap();
        g.add_link(member_link("m1", "a", "entity_fn_x", 1.0)).unwrap();
        let mut rt = EntityRuntime::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let report = rt.update(&mut g, 1.0, &cfg, &mut em, 1);
        assert_eq!(report.active_entities, vec!["entity_fn_x".to_string()]);
        let flips = em.captured_named("subentity.flip");
        assert_eq!(flips.len(), 1);
        assert_eq!(flips[0]["data"]["flip_direction"], "activate");
    }

    #[test]
    fn dissolution_frees_members() {
        let mut cfg = Config::from_env();
        cfg.entity_demote_streak = 2;
        let mut g = Graph::new();
        g.add_node(node_with("a", 0.0, 1.0)).unwrap();
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional)).unwrap();
        g.add_link(member_link("m1", "a", "entity_fn_x", 1.0)).unwrap();
        let mut rt = EntityRuntime::new();
        let mut em = Emitter::memory("t", 1024, 1.0);
        // Cold quality EMAs score near zero, driving demotion each frame.
        let mut dissolved = false;
        for f in 0..10 {
            let report = rt.update(&mut g, 1.0, &cfg, &mut em, f);
            if !report.dissolved.is_empty() {
                dissolved = true;
                break;
            }
        }
        assert!(dissolved);
        assert_eq!(g.entity_count(), 0);
        assert!(g.get_node("a").unwrap().memberships.is_empty());
        let events = em.captured_named("subentity.lifecycle");
        assert!(events
            .iter()
            .any(|e| e["data"]["trigger"] == "dissolution"));
    }

    #[test]
    fn affect_context_derived_from_members() {
        let mut g = Graph::new();
        let mut a = node_with("a", 2.0, 1.0);
        a.affect = Some(Affect::new(0.5, 0.8));
        g.add_node(a).unwrap();
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional)).unwrap();
        g.add_link(member_link("m1", "a", "entity_fn_x", 1.0)).unwrap();
        EntityRuntime::refresh_affect(&mut g);
        let affect = g.get_entity("entity_fn_x").unwrap().affect.unwrap();
        assert!((affect.valence - 0.5).abs() < 1e-12);
        assert!((affect.arousal - 0.8).abs() < 1e-12);
    }
}
