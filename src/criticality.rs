//! Criticality controller: keeps the propagation operator near rho = 1.
//!
//! A cheap branching-ratio proxy runs every frame; a power-iteration
//! estimate of the spectral radius runs on a slower cadence. A P-controller
//! trims the effective decay rate (and optionally the diffusion share) to
//! hold the edge-of-chaos band.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::Config;
use crate::graph::{Endpoint, Graph};
use crate::stats::{cosine, RollingWindow};
use crate::telemetry::{BeforeAfter, CriticalityState, Emitter, Event, RhoReading};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyState {
    Subcritical,
    Critical,
    Supercritical,
}

impl SafetyState {
    pub fn from_rho(rho: f64) -> Self {
        if rho < 0.9 {
            SafetyState::Subcritical
        } else if rho <= 1.1 {
            SafetyState::Critical
        } else {
            SafetyState::Supercritical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyState::Subcritical => "subcritical",
            SafetyState::Critical => "critical",
            SafetyState::Supercritical => "supercritical",
        }
    }
}

/// Joint (rho, coherence) regime read, available when the coherence metric
/// is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CognitiveMode {
    Subcritical,
    Flow,
    GenerativeOverflow,
    ChaoticRacing,
}

impl CognitiveMode {
    pub fn classify(rho: f64, coherence: f64) -> Self {
        if rho < 0.9 {
            CognitiveMode::Subcritical
        } else if rho <= 1.1 {
            CognitiveMode::Flow
        } else if coherence >= 0.5 {
            CognitiveMode::GenerativeOverflow
        } else {
            CognitiveMode::ChaoticRacing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CognitiveMode::Subcritical => "subcritical",
            CognitiveMode::Flow => "flow",
            CognitiveMode::GenerativeOverflow => "generative_overflow",
            CognitiveMode::ChaoticRacing => "chaotic_racing",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlOutput {
    pub rho: f64,
    pub proxy: f64,
    pub threshold_multiplier: f64,
    pub effective_decay: f64,
    pub alpha: f64,
    pub safety_state: SafetyState,
    pub coherence: f64,
    pub mode: Option<CognitiveMode>,
}

pub struct CriticalityController {
    /// Effective activation-decay rate lever handed to the decay engine.
    pub delta: f64,
    /// Diffusion share lever (dual-lever mode only).
    pub alpha: f64,
    rho_global: f64,
    proxy: f64,
    rho_window: RollingWindow,
    delta_window: RollingWindow,
    frames: u64,
    rng: StdRng,
    safety_state: SafetyState,
    prev_frontier_centroid: Option<Vec<f64>>,
    coherence: f64,
}

impl CriticalityController {
    pub fn new(cfg: &Config) -> Self {
        Self {
            delta: cfg.emact_decay_base,
            alpha: cfg.alpha_tick,
            rho_global: 1.0,
            proxy: 1.0,
            rho_window: RollingWindow::new(30),
            delta_window: RollingWindow::new(20),
            frames: 0,
            rng: StdRng::seed_from_u64(0x6e6f65),
            safety_state: SafetyState::Critical,
            prev_frontier_centroid: None,
            coherence: 0.0,
        }
    }

    pub fn rho(&self) -> f64 {
        self.rho_global
    }

    pub fn safety_state(&self) -> SafetyState {
        self.safety_state
    }

    pub fn coherence(&self) -> f64 {
        self.coherence
    }

    /// One controller step. Estimates rho, trims the decay lever, classifies
    /// the safety band, and emits `criticality.state`.
    pub fn control(
        &mut self,
        graph: &Graph,
        active: &HashSet<String>,
        shadow: &HashSet<String>,
        dt: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) -> ControlOutput {
        self.frames += 1;

        self.proxy = branching_proxy(graph, active);

        let power_frame = cfg.power_iteration_every_frames > 0
            && self.frames % cfg.power_iteration_every_frames == 0;
        if power_frame {
            if let Some(rho) = self.power_iteration(graph, active, shadow, dt, cfg) {
                self.rho_global = rho;
            }
        } else {
            // Proxy-mixed estimate between power iterations.
            let decay_factor = (-self.delta * dt).exp();
            let mix = (1.0 - self.alpha) + self.alpha * self.proxy.min(2.0);
            self.rho_global = decay_factor * mix;
        }
        self.rho_window.push(self.rho_global);

        // P-controller on the decay lever; multiplicative so the rate lever
        // stays scale-free across its admissible range.
        let err = self.rho_global - cfg.rho_target;
        let controller_output = cfg.controller_kp * err;
        let delta_before = self.delta;
        self.delta = (self.delta * (1.0 + controller_output))
            .clamp(cfg.emact_decay_min, cfg.emact_decay_max);
        self.delta_window.push(self.delta);

        let alpha_before = self.alpha;
        if cfg.controller_alpha_lever {
            self.alpha = (self.alpha * (1.0 - 0.5 * controller_output)).clamp(0.01, 0.5);
        }

        self.safety_state = SafetyState::from_rho(self.rho_global);
        let threshold_multiplier = (1.0 + 0.5 * err).clamp(0.9, 1.1);

        if cfg.coherence_enabled {
            self.coherence = self.update_coherence(graph, active);
        }

        let oscillation_index = if self.delta_window.mean().abs() > 1e-12 {
            self.delta_window.std() / self.delta_window.mean().abs()
        } else {
            0.0
        };

        emitter.emit(
            frame_id,
            &Event::Criticality(CriticalityState {
                rho: RhoReading {
                    global: self.rho_global,
                    proxy_branching: self.proxy,
                    var_window: self.rho_window.variance(),
                },
                safety_state: self.safety_state.as_str().to_string(),
                delta: BeforeAfter { before: delta_before, after: self.delta },
                alpha: BeforeAfter { before: alpha_before, after: self.alpha },
                controller_output,
                oscillation_index,
                threshold_multiplier,
            }),
        );

        ControlOutput {
            rho: self.rho_global,
            proxy: self.proxy,
            threshold_multiplier,
            effective_decay: self.delta,
            alpha: self.alpha,
            safety_state: self.safety_state,
            coherence: self.coherence,
            mode: cfg
                .coherence_enabled
                .then(|| CognitiveMode::classify(self.rho_global, self.coherence)),
        }
    }

    /// Power iteration on the effective propagation operator restricted to
    /// the frontier subgraph: x' = exp(-delta dt) ((1-alpha) x + alpha P^T x)
    /// with P row-stochastic from exp(log_weight).
    fn power_iteration(
        &mut self,
        graph: &Graph,
        active: &HashSet<String>,
        shadow: &HashSet<String>,
        dt: f64,
        cfg: &Config,
    ) -> Option<f64> {
        let ids: Vec<&String> = active.iter().chain(shadow.iter()).collect();
        if ids.is_empty() {
            return None;
        }
        let index: HashMap<&str, usize> =
            ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let n = ids.len();

        // Row-stochastic transition rows over the subgraph.
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        for (i, id) in ids.iter().enumerate() {
            let Some(node) = graph.get_node(id.as_str()) else {
                continue;
            };
            let mut total = 0.0;
            let mut out: Vec<(usize, f64)> = Vec::new();
            for lid in &node.outgoing {
                let Some(link) = graph.get_link(lid) else {
                    continue;
                };
                if let Endpoint::Node(dst) = &link.target {
                    if let Some(&j) = index.get(dst.as_str()) {
                        let w = link.log_weight.exp();
                        out.push((j, w));
                        total += w;
                    }
                }
            }
            if total > 0.0 {
                rows[i] = out.into_iter().map(|(j, w)| (j, w / total)).collect();
            }
        }

        let decay_factor = (-self.delta * dt).exp();
        let mut x: Vec<f64> = (0..n).map(|_| self.rng.gen_range(0.1..1.0)).collect();
        let mut rho = 0.0;
        for _ in 0..cfg.power_iteration_steps {
            let mut y = vec![0.0f64; n];
            for (i, row) in rows.iter().enumerate() {
                for &(j, p) in row {
                    y[j] += self.alpha * p * x[i];
                }
            }
            for i in 0..n {
                y[i] = decay_factor * ((1.0 - self.alpha) * x[i] + y[i]);
            }
            let norm: f64 = y.iter().map(|v| v * v).sum::<f64>().sqrt();
            if norm < 1e-12 {
                return Some(0.0);
            }
            rho = norm / x.iter().map(|v| v * v).sum::<f64>().sqrt();
            for i in 0..n {
                x[i] = y[i] / norm;
            }
        }
        Some(rho)
    }

    /// Frontier-centroid similarity across frames, EMA-smoothed into [0, 1].
    fn update_coherence(&mut self, graph: &Graph, active: &HashSet<String>) -> f64 {
        let mut centroid: Option<Vec<f64>> = None;
        let mut count = 0usize;
        for id in active {
            let Some(emb) = graph.get_node(id).and_then(|n| n.embedding.as_ref()) else {
                continue;
            };
            match &mut centroid {
                None => centroid = Some(emb.clone()),
                Some(c) => {
                    for (ci, ei) in c.iter_mut().zip(emb.iter()) {
                        *ci += ei;
                    }
                }
            }
            count += 1;
        }
        if let Some(c) = &mut centroid {
            for ci in c.iter_mut() {
                *ci /= count.max(1) as f64;
            }
        }
        let sim = match (&self.prev_frontier_centroid, &centroid) {
            (Some(prev), Some(cur)) => (cosine(prev, cur) + 1.0) / 2.0,
            _ => 0.0,
        };
        if centroid.is_some() {
            self.prev_frontier_centroid = centroid;
        }
        self.coherence = 0.2 * sim + 0.8 * self.coherence;
        self.coherence
    }
}

fn branching_proxy(graph: &Graph, active: &HashSet<String>) -> f64 {
    let mut out_active = 0usize;
    let mut in_active = 0usize;
    for id in active {
        if let Some(node) = graph.get_node(id) {
            out_active += node.outgoing.len();
            in_active += node.incoming.len();
        }
    }
    if in_active == 0 {
        return if out_active == 0 { 1.0 } else { out_active as f64 };
    }
    out_active as f64 / in_active as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Link, LinkType, Node, NodeType, Scope};

    fn ring(n: usize) -> (Graph, HashSet<String>) {
        let mut g = Graph::new();
        for i in 0..n {
            let mut node = Node::new(&format!("n{}", i), NodeType::Concept, Scope::Personal, "n");
            node.energy = 2.0;
            node.theta = 1.0;
            g.add_node(node).unwrap();
        }
        for i in 0..n {
            let l = Link::between_nodes(
                &format!("l{}", i),
                &format!("n{}", i),
                &format!("n{}", (i + 1) % n),
                LinkType::Association,
            );
            g.add_link(l).unwrap();
        }
        let active: HashSet<String> = (0..n).map(|i| format!("n{}", i)).collect();
        (g, active)
    }

    #[test]
    fn safety_bands() {
        assert_eq!(SafetyState::from_rho(0.5), SafetyState::Subcritical);
        assert_eq!(SafetyState::from_rho(1.0), SafetyState::Critical);
        assert_eq!(SafetyState::from_rho(1.5), SafetyState::Supercritical);
    }

    #[test]
    fn ring_proxy_is_balanced() {
        let (g, active) = ring(5);
        assert!((branching_proxy(&g, &active) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn power_iteration_near_one_on_ring() {
        // A ring with uniform weights is a permutation operator; with tiny
        // decay the effective spectral radius sits just under 1.
        let cfg = Config::from_env();
        let (g, active) = ring(6);
        let mut c = CriticalityController::new(&cfg);
        let rho = c
            .power_iteration(&g, &active, &HashSet::new(), 1.0, &cfg)
            .unwrap();
        assert!(rho > 0.9 && rho < 1.05, "rho={}", rho);
    }

    #[test]
    fn controller_raises_decay_when_supercritical() {
        let mut cfg = Config::from_env();
        cfg.power_iteration_every_frames = 0;
        let (g, active) = ring(4);
        let mut c = CriticalityController::new(&cfg);
        c.rho_global = 1.0;
        c.proxy = 1.0;
        // Force a hot reading and step the controller directly.
        let mut em = Emitter::memory("t", 64, 1.0);
        c.delta = 1e-4;
        c.rho_global = 1.3;
        let before = c.delta;
        // control() recomputes rho from the proxy path; pin it by zeroing dt.
        let out = c.control(&g, &active, &HashSet::new(), 0.0, &cfg, &mut em, 1);
        assert!(out.effective_decay >= before, "decay should not shrink under heat");
    }

    #[test]
    fn mode_classifier_partitions_rho_coherence() {
        assert_eq!(CognitiveMode::classify(0.5, 0.9), CognitiveMode::Subcritical);
        assert_eq!(CognitiveMode::classify(1.0, 0.2), CognitiveMode::Flow);
        assert_eq!(CognitiveMode::classify(1.3, 0.8), CognitiveMode::GenerativeOverflow);
        assert_eq!(CognitiveMode::classify(1.3, 0.1), CognitiveMode::ChaoticRacing);
    }

    #[test]
    fn empty_frontier_yields_no_estimate() {
        let cfg = Config::from_env();
        let g = Graph::new();
        let mut c = CriticalityController::new(&cfg);
        assert!(c
            .power_iteration(&g, &HashSet::new(), &HashSet::new(), 1.0, &cfg)
            .is_none());
    }
}
