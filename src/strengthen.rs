//! Three-tier Hebbian link strengthening, applied at stride time.
//!
//! Credit depends on what the stride actually did: co-activation of both
//! endpoints earns full credit, pushing the target over threshold earns
//! causal credit, background transport earns a trickle. A z-score filter on
//! stride utility keeps noise strides from accreting weight.

use crate::config::Config;
use crate::graph::Link;
use crate::stats::RollingWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Strong,
    Medium,
    Weak,
}

impl Tier {
    pub fn scale(&self) -> f64 {
        match self {
            Tier::Strong => 1.0,
            Tier::Medium => 0.6,
            Tier::Weak => 0.3,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Tier::Strong => "co_activation",
            Tier::Medium => "causal",
            Tier::Weak => "background",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Strong => "strong",
            Tier::Medium => "medium",
            Tier::Weak => "weak",
        }
    }
}

/// Post-stride endpoint states decide the tier. Strong wins over causal when
/// both apply.
pub fn classify(src_active_post: bool, dst_active_pre: bool, dst_active_post: bool) -> Tier {
    if src_active_post && dst_active_post {
        Tier::Strong
    } else if dst_active_post && !dst_active_pre {
        Tier::Medium
    } else {
        Tier::Weak
    }
}

/// Stride utility: fraction of the target's activation gap the stride
/// closed, or throughput per threshold once the target is already over.
pub fn stride_utility(retained: f64, dst_energy_pre: f64, dst_theta: f64) -> f64 {
    let gap = dst_theta - dst_energy_pre;
    if gap > 0.0 {
        (retained / gap.max(1e-9)).min(1.0)
    } else {
        retained / dst_theta.max(1e-9)
    }
}

pub struct Strengthener {
    phi_cohort: RollingWindow,
}

impl Strengthener {
    pub fn new() -> Self {
        Self { phi_cohort: RollingWindow::new(200) }
    }

    /// Z-score a utility observation against the cohort, then absorb it.
    /// Until the cohort is warm, strides score neutral.
    pub fn observe_phi(&mut self, phi: f64) -> f64 {
        let z = if self.phi_cohort.len() >= 5 {
            self.phi_cohort.z_score(phi)
        } else {
            0.0
        };
        self.phi_cohort.push(phi);
        z
    }

    /// Apply the tiered update to a link. Returns the log-weight delta
    /// actually written (zero for noise-filtered strides).
    pub fn strengthen(
        &self,
        link: &mut Link,
        delta_e: f64,
        tier: Tier,
        z_phi: f64,
        emotion_magnitude: f64,
        cfg: &Config,
    ) -> f64 {
        if z_phi < cfg.strengthen_z_skip {
            return 0.0;
        }
        let m_affect = if cfg.strengthen_affect_enabled {
            1.0 + cfg.strengthen_affect_kappa * emotion_magnitude.tanh()
        } else {
            1.0
        };
        let delta =
            cfg.learning_rate_base * delta_e * tier.scale() * z_phi.max(0.0) * m_affect;
        let before = link.log_weight;
        link.log_weight = (link.log_weight + delta).min(cfg.weight_ceiling);
        link.precedence_count += 1;
        link.ema_phi = crate::stats::ema_step(link.ema_phi, z_phi.max(0.0), cfg.ema_alpha);
        link.log_weight - before
    }
}

impl Default for Strengthener {
    fn default() -> Self {
        Self::new()
    }
}
