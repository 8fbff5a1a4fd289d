//! Subentities: weighted neighborhoods with derived energy and a lifecycle.
//!
//! Entity energy is never stored durably; it is recomputed every frame from
//! member surpluses. Everything else here is bookkeeping for activation,
//! quality, and lifecycle transitions.

use serde::{Deserialize, Serialize};

use crate::affect::Affect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Functional,
    Semantic,
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "functional" => Some(EntityKind::Functional),
            "semantic" => Some(EntityKind::Semantic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Functional => "functional",
            EntityKind::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityState {
    Candidate,
    Provisional,
    Mature,
    Dissolved,
}

impl StabilityState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "candidate" => Some(StabilityState::Candidate),
            "provisional" => Some(StabilityState::Provisional),
            "mature" => Some(StabilityState::Mature),
            "dissolved" => Some(StabilityState::Dissolved),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StabilityState::Candidate => "candidate",
            StabilityState::Provisional => "provisional",
            StabilityState::Mature => "mature",
            StabilityState::Dissolved => "dissolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationLevel {
    Dominant,
    Strong,
    Moderate,
    Weak,
    Absent,
}

impl ActivationLevel {
    /// Classify from the energy/threshold ratio.
    pub fn from_ratio(ratio: f64) -> Self {
        if ratio >= 2.0 {
            ActivationLevel::Dominant
        } else if ratio >= 1.5 {
            ActivationLevel::Strong
        } else if ratio >= 1.0 {
            ActivationLevel::Moderate
        } else if ratio >= 0.5 {
            ActivationLevel::Weak
        } else {
            ActivationLevel::Absent
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationLevel::Dominant => "dominant",
            ActivationLevel::Strong => "strong",
            ActivationLevel::Moderate => "moderate",
            ActivationLevel::Weak => "weak",
            ActivationLevel::Absent => "absent",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub kind: EntityKind,
    pub color: Option<String>,
    pub centroid_embedding: Option<Vec<f64>>,

    // Derived per frame; never persisted as truth.
    pub energy_runtime: f64,
    pub threshold_runtime: f64,
    pub activation_level_runtime: ActivationLevel,
    pub active: bool,

    // Quality EMAs; geometric mean = quality_score.
    pub ema_active: f64,
    pub coherence_ema: f64,
    pub ema_wm_presence: f64,
    pub ema_trace_seats: f64,
    pub ema_formation_quality: f64,

    pub stability_state: StabilityState,
    pub promote_streak: u64,
    pub demote_streak: u64,
    pub frames_since_creation: u64,

    /// Per-frame affect context, derived from members carrying affect.
    pub affect: Option<Affect>,

    // Identity-multiplicity tracking.
    pub identity_flip_count: u64,
    pub previous_dominant_identity: Option<String>,

    /// BELONGS_TO link ids for members, rebuilt by the container.
    #[serde(skip)]
    pub member_links: Vec<String>,
    /// RELATES_TO link ids, outgoing / incoming.
    #[serde(skip)]
    pub relates_out: Vec<String>,
    #[serde(skip)]
    pub relates_in: Vec<String>,
}

impl Entity {
    pub fn new(id: &str, name: &str, kind: EntityKind) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            color: None,
            centroid_embedding: None,
            energy_runtime: 0.0,
            threshold_runtime: 0.0,
            activation_level_runtime: ActivationLevel::Absent,
            active: false,
            ema_active: 0.0,
            coherence_ema: 0.0,
            ema_wm_presence: 0.0,
            ema_trace_seats: 0.0,
            ema_formation_quality: 0.0,
            stability_state: StabilityState::Candidate,
            promote_streak: 0,
            demote_streak: 0,
            frames_since_creation: 0,
            affect: None,
            identity_flip_count: 0,
            previous_dominant_identity: None,
            member_links: Vec::new(),
            relates_out: Vec::new(),
            relates_in: Vec::new(),
        }
    }

    /// Geometric mean of the five quality EMAs, each floored at a small
    /// epsilon so a single cold accumulator does not zero the score.
    pub fn quality_score(&self) -> f64 {
        const EPS: f64 = 1e-3;
        let parts = [
            self.ema_active.max(EPS),
            self.coherence_ema.max(EPS),
            self.ema_wm_presence.max(EPS),
            self.ema_trace_seats.max(EPS),
            self.ema_formation_quality.max(EPS),
        ];
        (parts.iter().map(|p| p.ln()).sum::<f64>() / parts.len() as f64).exp()
    }
}
