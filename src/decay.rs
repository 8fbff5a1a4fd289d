//! Dual-clock decay: fast exponential activation decay every frame, slow
//! weight decay on a fixed frame cadence.
//!
//! Activation decay rate comes from the criticality controller when one is
//! running; weight decay is deliberately independent of the controller.

use crate::config::Config;
use crate::graph::{Graph, NodeType};
use crate::telemetry::{DecayTick, EnergyTotals, Event, WeightDecayCounts};

#[derive(Debug, Clone, Copy)]
pub struct DecayReport {
    pub nodes_decayed: usize,
    pub energy_before: f64,
    pub energy_after: f64,
    pub energy_lost: f64,
}

pub struct DecayEngine {
    /// Seconds accumulated since the last weight-decay pass.
    weight_clock_s: f64,
    frames_since_weight_decay: u64,
}

impl DecayEngine {
    pub fn new() -> Self {
        Self { weight_clock_s: 0.0, frames_since_weight_decay: 0 }
    }

    /// Apply activation decay to every node carrying energy.
    ///
    /// `rate_override` is the controller's effective rate; when absent each
    /// node decays at `base * type_multiplier`.
    pub fn apply_activation(
        &mut self,
        graph: &mut Graph,
        dt: f64,
        rate_override: Option<f64>,
        cfg: &Config,
    ) -> DecayReport {
        let mut nodes_decayed = 0usize;
        let mut before = 0.0;
        let mut after = 0.0;

        // Consolidation and resistance need read-only context gathered first.
        let modulators: Vec<(String, f64, f64)> = if cfg.consolidation_enabled || cfg.resistance_enabled {
            graph
                .nodes()
                .map(|n| {
                    let c = if cfg.consolidation_enabled {
                        consolidation_total(graph, &n.id, cfg)
                    } else {
                        0.0
                    };
                    let r = if cfg.resistance_enabled {
                        resistance(graph, &n.id, cfg)
                    } else {
                        1.0
                    };
                    (n.id.clone(), c, r)
                })
                .collect()
        } else {
            Vec::new()
        };
        let lookup: std::collections::HashMap<&str, (f64, f64)> = modulators
            .iter()
            .map(|(id, c, r)| (id.as_str(), (*c, *r)))
            .collect();

        for node in graph.nodes_mut() {
            before += node.energy;
            if node.energy <= 0.0 {
                after += node.energy;
                continue;
            }
            let base_rate = match rate_override {
                Some(r) => r.clamp(cfg.emact_decay_min, cfg.emact_decay_max),
                None => cfg.emact_decay_base * node.node_type.decay_multiplier(),
            };
            let (c_total, r_i) = lookup.get(node.id.as_str()).copied().unwrap_or((0.0, 1.0));
            let rate = base_rate / r_i;
            let mut factor = (-rate * dt).exp();
            if c_total > 0.0 {
                // Consolidated content decays on a stretched clock.
                factor = factor.powf(1.0 / (1.0 + c_total));
            }
            node.energy *= factor;
            nodes_decayed += 1;
            after += node.energy;
        }

        DecayReport {
            nodes_decayed,
            energy_before: before,
            energy_after: after,
            energy_lost: before - after,
        }
    }

    /// Weight decay on the slow clock. Returns counts when a pass ran.
    pub fn maybe_weight_decay(
        &mut self,
        graph: &mut Graph,
        dt: f64,
        cfg: &Config,
    ) -> Option<(usize, usize, f64)> {
        self.weight_clock_s += dt;
        self.frames_since_weight_decay += 1;
        if self.frames_since_weight_decay < cfg.weight_decay_every_frames {
            return None;
        }
        let elapsed = self.weight_clock_s;
        self.weight_clock_s = 0.0;
        self.frames_since_weight_decay = 0;

        let mut delta_w = 0.0;
        let mut node_count = 0usize;
        for node in graph.nodes_mut() {
            let step = cfg.weight_decay_base * node.node_type.weight_decay_multiplier() * elapsed;
            let next = (node.log_weight - step).max(cfg.weight_floor);
            delta_w += node.log_weight - next;
            node.log_weight = next;
            node_count += 1;
        }
        let mut link_count = 0usize;
        for link in graph.links_mut() {
            let step = cfg.weight_decay_base * elapsed;
            let next = (link.log_weight - step).max(cfg.weight_floor);
            delta_w += link.log_weight - next;
            link.log_weight = next;
            link_count += 1;
        }
        Some((node_count, link_count, delta_w))
    }

    /// One full decay pass plus the `decay.tick` event.
    pub fn run(
        &mut self,
        graph: &mut Graph,
        dt: f64,
        rate_override: Option<f64>,
        cfg: &Config,
        emitter: &mut crate::telemetry::Emitter,
        frame_id: u64,
    ) -> DecayReport {
        let report = self.apply_activation(graph, dt, rate_override, cfg);
        let weight = self.maybe_weight_decay(graph, dt, cfg);
        let (w_nodes, w_links, delta_w) = weight.unwrap_or((0, 0, 0.0));

        let half_lives = half_life_estimates(rate_override, cfg);
        emitter.emit(
            frame_id,
            &Event::Decay(DecayTick {
                delta_e: report.energy_after - report.energy_before,
                delta_w: -delta_w,
                nodes_decayed: report.nodes_decayed,
                energy: EnergyTotals {
                    before: report.energy_before,
                    after: report.energy_after,
                    lost: report.energy_lost,
                },
                weight_decay: WeightDecayCounts { nodes: w_nodes, links: w_links },
                half_lives_activation: Some(half_lives),
                auc_activation: report.energy_after * dt,
            }),
        );
        report
    }
}

impl Default for DecayEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Consolidation score in [0, C_MAX] from three triggers: retrieval EMA,
/// high affect magnitude, an active outgoing goal link.
fn consolidation_total(graph: &Graph, node_id: &str, cfg: &Config) -> f64 {
    let Some(node) = graph.get_node(node_id) else {
        return 0.0;
    };
    let mut c: f64 = 0.0;
    if node.ema_wm_presence > 0.5 {
        c += 0.3;
    }
    if node.affect.map(|a| a.magnitude() > 0.7).unwrap_or(false) {
        c += 0.3;
    }
    let goal_active = node.outgoing.iter().any(|lid| {
        graph
            .get_link(lid)
            .filter(|l| l.link_type == crate::graph::LinkType::Goal)
            .and_then(|l| graph.get_node(l.target.id()))
            .map(|t| t.is_active())
            .unwrap_or(false)
    });
    if goal_active {
        c += 0.2;
    }
    c.min(cfg.consolidation_max)
}

/// Resistance in [1, R_MAX] from degree centrality, cross-entity bridging,
/// and type class.
fn resistance(graph: &Graph, node_id: &str, cfg: &Config) -> f64 {
    let Some(node) = graph.get_node(node_id) else {
        return 1.0;
    };
    let degree = (node.outgoing.len() + node.incoming.len()) as f64;
    let centrality = (degree / 10.0).min(1.0);
    let bridging = if node.memberships.len() > 1 { 0.5 } else { 0.0 };
    let type_class = match node.node_type {
        NodeType::Value | NodeType::Memory => 0.5,
        _ => 0.0,
    };
    (1.0 + centrality + bridging + type_class).min(cfg.resistance_max)
}

fn half_life_estimates(rate_override: Option<f64>, cfg: &Config) -> Vec<(String, f64)> {
    const TYPES: [NodeType; 6] = [
        NodeType::Concept,
        NodeType::Memory,
        NodeType::Task,
        NodeType::Goal,
        NodeType::Value,
        NodeType::Percept,
    ];
    TYPES
        .iter()
        .map(|t| {
            let rate = match rate_override {
                Some(r) => r.clamp(cfg.emact_decay_min, cfg.emact_decay_max),
                None => cfg.emact_decay_base * t.decay_multiplier(),
            };
            (t.as_str().to_string(), std::f64::consts::LN_2 / rate.max(1e-12))
        })
        .collect()
}
