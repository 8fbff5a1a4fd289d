//! Stride-based diffusion runtime.
//!
//! Per-frame discipline: compute the frontier once, stage every transfer as
//! a delta, commit all deltas atomically, and only then let decay run. The
//! staged-delta residual (plus accounted stickiness dissipation) is the
//! conservation signal the tripwire watches.

pub mod cost;
pub mod fanout;
pub mod stride;

use std::collections::{HashMap, HashSet};

use crate::graph::{Endpoint, Graph};
use crate::telemetry::{Emitter, Event, LinkFlow, LinkFlowSummary, NodeFlip};

#[derive(Debug, Clone, Copy)]
pub struct CommitReport {
    /// Sum of staged deltas plus accounted dissipation; near zero when the
    /// frame conserved mass.
    pub residual: f64,
    pub dissipated: f64,
    pub committed_nodes: usize,
    pub flips_up: usize,
    pub flips_down: usize,
}

#[derive(Debug, Default)]
pub struct DiffusionState {
    pub active: HashSet<String>,
    pub shadow: HashSet<String>,
    delta_e: HashMap<String, f64>,
    dissipated: f64,
    pub strides_executed: u64,
    pub stride_budget: usize,
    flows: HashMap<String, (u64, HashSet<String>)>,
}

impl DiffusionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute active/shadow from thresholds. Staged state is reset; the
    /// receiving-node rule extends `active` as strides stage within the
    /// frame.
    pub fn refresh_frontier(&mut self, graph: &Graph) {
        self.active.clear();
        self.shadow.clear();
        self.delta_e.clear();
        self.dissipated = 0.0;
        self.strides_executed = 0;
        self.flows.clear();

        for node in graph.nodes() {
            if node.is_active() {
                self.active.insert(node.id.clone());
            }
        }
        for id in &self.active {
            let Some(node) = graph.get_node(id) else {
                continue;
            };
            for lid in &node.outgoing {
                let Some(link) = graph.get_link(lid) else {
                    continue;
                };
                if let Endpoint::Node(dst) = &link.target {
                    if !self.active.contains(dst) {
                        self.shadow.insert(dst.clone());
                    }
                }
            }
        }
    }

    /// Stage one transfer. The source loses the full delta; the target
    /// retains the sticky share; the difference is accounted dissipation.
    pub fn stage(&mut self, src: &str, dst: &str, delta: f64, retained: f64, link_id: &str, entity_ctx: Option<&str>) {
        *self.delta_e.entry(src.to_string()).or_insert(0.0) -= delta;
        *self.delta_e.entry(dst.to_string()).or_insert(0.0) += retained;
        self.dissipated += delta - retained;
        self.strides_executed += 1;

        // Receivers join the frontier for the rest of the frame.
        self.shadow.remove(dst);
        self.active.insert(dst.to_string());

        let entry = self.flows.entry(link_id.to_string()).or_insert_with(|| (0, HashSet::new()));
        entry.0 += 1;
        if let Some(e) = entity_ctx {
            entry.1.insert(e.to_string());
        }
    }

    /// Staged delta currently pending for a node (0 when untouched).
    pub fn staged(&self, id: &str) -> f64 {
        self.delta_e.get(id).copied().unwrap_or(0.0)
    }

    /// Conservation residual of the staged frame.
    pub fn residual(&self) -> f64 {
        self.delta_e.values().sum::<f64>() + self.dissipated
    }

    /// Apply all staged deltas atomically, emit node flips, clear staging.
    pub fn commit(&mut self, graph: &mut Graph, emitter: &mut Emitter, frame_id: u64) -> CommitReport {
        let residual = self.residual();
        let dissipated = self.dissipated;
        let mut flips_up = 0usize;
        let mut flips_down = 0usize;
        let mut committed = 0usize;

        for (id, d) in self.delta_e.drain() {
            let Some(node) = graph.get_node_mut(&id) else {
                continue;
            };
            let e_pre = node.energy;
            node.energy = (node.energy + d).max(0.0);
            committed += 1;
            let was_active = e_pre >= node.theta;
            let is_active = node.energy >= node.theta;
            if was_active != is_active {
                if is_active {
                    flips_up += 1;
                } else {
                    flips_down += 1;
                }
                let flip = NodeFlip {
                    node: id.clone(),
                    e_pre,
                    e_post: node.energy,
                    theta: node.theta,
                };
                emitter.emit(frame_id, &Event::NodeFlip(flip));
            }
        }
        self.dissipated = 0.0;

        if !self.flows.is_empty() {
            let mut flows: Vec<LinkFlow> = self
                .flows
                .drain()
                .map(|(link_id, (count, entities))| {
                    let mut entity_ids: Vec<String> = entities.into_iter().collect();
                    entity_ids.sort();
                    LinkFlow { link_id, count, entity_ids }
                })
                .collect();
            flows.sort_by(|a, b| a.link_id.cmp(&b.link_id));
            emitter.emit(frame_id, &Event::LinkFlowSummary(LinkFlowSummary { flows }));
        }

        CommitReport {
            residual,
            dissipated,
            committed_nodes: committed,
            flips_up,
            flips_down,
        }
    }
}
