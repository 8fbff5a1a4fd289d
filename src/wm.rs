//! Entity-first working-memory selection under a token budget.
//!
//! Active entities compete on energy-per-token with a diversity bonus; a
//! cold graph falls back to the top entities by energy so downstream
//! consumers always get context.

use crate::config::Config;
use crate::graph::Graph;
use crate::stats::{cosine, ema_step};
use crate::telemetry::{Emitter, Event, TokenShare, WmEmit};

#[derive(Debug, Clone, Default)]
pub struct WmSelection {
    pub entities: Vec<String>,
    pub token_shares: Vec<(String, f64)>,
    pub nodes: Vec<String>,
    pub tokens_used: f64,
    pub headroom: f64,
}

pub struct WorkingMemory {
    pub last_selection: WmSelection,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self { last_selection: WmSelection { headroom: 1.0, ..Default::default() } }
    }

    pub fn headroom(&self) -> f64 {
        self.last_selection.headroom
    }

    fn token_cost(member_count: usize) -> f64 {
        50.0 + 10.0 * member_count.min(5) as f64
    }

    pub fn select(
        &mut self,
        graph: &mut Graph,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) -> WmSelection {
        let mut candidates: Vec<String> = graph
            .entities()
            .filter(|e| e.active)
            .map(|e| e.id.clone())
            .collect();

        // Cold-start fallback: top entities by derived energy.
        if candidates.is_empty() {
            let mut all: Vec<(String, f64)> = graph
                .entities()
                .map(|e| (e.id.clone(), e.energy_runtime))
                .collect();
            all.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            candidates = all
                .into_iter()
                .take(cfg.wm_max_entities)
                .map(|(id, _)| id)
                .collect();
        }

        let mut selected: Vec<String> = Vec::new();
        let mut shares: Vec<(String, f64)> = Vec::new();
        let mut used = 0.0;

        while selected.len() < cfg.wm_max_entities {
            let mut best: Option<(String, f64, f64)> = None;
            for id in &candidates {
                if selected.contains(id) {
                    continue;
                }
                let Some(entity) = graph.get_entity(id) else {
                    continue;
                };
                let members = graph.entity_members(id);
                let cost = Self::token_cost(members.len());
                if used + cost > cfg.wm_token_budget {
                    continue;
                }
                let diversity = match entity.centroid_embedding.as_ref() {
                    Some(centroid) => {
                        let max_sim = selected
                            .iter()
                            .filter_map(|sid| graph.get_entity(sid))
                            .filter_map(|s| s.centroid_embedding.as_ref())
                            .map(|c| cosine(c, centroid))
                            .fold(f64::NEG_INFINITY, f64::max);
                        if max_sim.is_finite() {
                            cfg.wm_diversity_bonus * (1.0 - max_sim)
                        } else {
                            0.0
                        }
                    }
                    None => 0.0,
                };
                let score = entity.energy_runtime / cost + diversity;
                if best.as_ref().map(|(_, s, _)| score > *s).unwrap_or(true) {
                    best = Some((id.clone(), score, cost));
                }
            }
            let Some((id, _, cost)) = best else {
                break;
            };
            used += cost;
            shares.push((id.clone(), cost));
            selected.push(id);
        }

        // WM-presence EMAs: selected entities observe 1, the rest observe 0.
        let selected_set: std::collections::HashSet<&String> = selected.iter().collect();
        let ids = graph.entity_ids();
        for id in &ids {
            let hit = selected_set.contains(id);
            if let Some(e) = graph.get_entity_mut(id) {
                e.ema_wm_presence = ema_step(e.ema_wm_presence, hit as u8 as f64, cfg.ema_alpha);
            }
        }

        // Top members by energy for each selected entity.
        let mut nodes: Vec<String> = Vec::new();
        for id in &selected {
            let mut members: Vec<(String, f64)> = graph
                .entity_members(id)
                .into_iter()
                .filter_map(|(nid, _)| graph.get_node(&nid).map(|n| (nid, n.energy)))
                .collect();
            members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (nid, _) in members.into_iter().take(cfg.wm_top_members) {
                if !nodes.contains(&nid) {
                    nodes.push(nid.clone());
                    if let Some(n) = graph.get_node_mut(&nid) {
                        n.ema_wm_presence = ema_step(n.ema_wm_presence, 1.0, cfg.ema_alpha);
                    }
                }
            }
        }

        let selection = WmSelection {
            entities: selected.clone(),
            token_shares: shares.clone(),
            nodes: nodes.clone(),
            tokens_used: used,
            headroom: (1.0 - used / cfg.wm_token_budget.max(1e-9)).max(0.0),
        };

        emitter.emit(
            frame_id,
            &Event::Wm(WmEmit {
                mode: "entity_first".to_string(),
                selected_entities: selected,
                entity_token_shares: shares
                    .into_iter()
                    .map(|(id, tokens)| TokenShare { id, tokens })
                    .collect(),
                selected_nodes: nodes,
                token_budget_used: used,
            }),
        );

        self.last_selection = selection.clone();
        selection
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Endpoint, Entity, EntityKind, Link, LinkType, Node, NodeType, Scope};

    fn build(g: &mut Graph, eid: &str, energy: f64, members: usize, active: bool) {
        let mut e = Entity::new(eid, eid, EntityKind::Functional);
        e.energy_runtime = energy;
        e.active = active;
        g.add_entity(e).unwrap();
        for i in 0..members {
            let nid = format!("{}_{}", eid, i);
            let mut n = Node::new(&nid, NodeType::Concept, Scope::Personal, &nid);
            n.energy = energy / members.max(1) as f64;
            g.add_node(n).unwrap();
            let mut l = Link::new(
                &format!("m_{}", nid),
                Endpoint::Node(nid.clone()),
                Endpoint::Entity(eid.to_string()),
                LinkType::BelongsTo,
            );
            l.membership_weight = 0.5;
            g.add_link(l).unwrap();
        }
    }

    #[test]
    fn selects_active_entities_by_score() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        build(&mut g, "entity_fn_a", 5.0, 3, true);
        build(&mut g, "entity_fn_b", 1.0, 3, true);
        build(&mut g, "entity_fn_c", 9.0, 3, false);
        let mut wm = WorkingMemory::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let sel = wm.select(&mut g, &cfg, &mut em, 1);
        assert_eq!(sel.entities[0], "entity_fn_a");
        assert!(sel.entities.contains(&"entity_fn_b".to_string()));
        assert!(!sel.entities.contains(&"entity_fn_c".to_string()), "inactive stays out");
    }

    #[test]
    fn cold_start_falls_back_to_top_energy() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        for i in 0..9 {
            build(&mut g, &format!("entity_fn_{}", i), i as f64, 1, false);
        }
        let mut wm = WorkingMemory::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let sel = wm.select(&mut g, &cfg, &mut em, 1);
        assert!(!sel.entities.is_empty());
        assert!(sel.entities.len() <= cfg.wm_max_entities);
        assert!(sel.entities.contains(&"entity_fn_8".to_string()));
    }

    #[test]
    fn budget_caps_selection() {
        let mut cfg = Config::from_env();
        cfg.wm_token_budget = 130.0; // room for two 60-token entities only
        let mut g = Graph::new();
        for i in 0..5 {
            build(&mut g, &format!("entity_fn_{}", i), 5.0 - i as f64, 1, true);
        }
        let mut wm = WorkingMemory::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let sel = wm.select(&mut g, &cfg, &mut em, 1);
        assert_eq!(sel.entities.len(), 2);
        assert!(sel.tokens_used <= 130.0);
        assert!(wm.headroom() < 0.1);
    }

    #[test]
    fn wm_event_carries_shares_and_nodes() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        build(&mut g, "entity_fn_a", 5.0, 7, true);
        let mut wm = WorkingMemory::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        let sel = wm.select(&mut g, &cfg, &mut em, 3);
        assert_eq!(sel.nodes.len(), cfg.wm_top_members);
        let events = em.captured_named("wm.emit");
        assert_eq!(events.len(), 1);
        let d = &events[0]["data"];
        assert_eq!(d["mode"], "entity_first");
        assert_eq!(d["entity_token_shares"][0]["tokens"], 100.0);
    }

    #[test]
    fn presence_ema_rises_for_selected() {
        let cfg = Config::from_env();
        let mut g = Graph::new();
        build(&mut g, "entity_fn_a", 5.0, 1, true);
        let mut wm = WorkingMemory::new();
        let mut em = Emitter::memory("t", 256, 1.0);
        wm.select(&mut g, &cfg, &mut em, 1);
        assert!(g.get_entity("entity_fn_a").unwrap().ema_wm_presence > 0.0);
        assert!(g.get_node("entity_fn_a_0").unwrap().ema_wm_presence > 0.0);
    }
}
