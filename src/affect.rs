//! Two-dimensional affect vectors (valence, arousal).
//!
//! Affect is transport-only on links and derived per frame on entities; it
//! modulates thresholds, link costs, and learning, never energy directly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Affect {
    pub valence: f64,
    pub arousal: f64,
}

impl Affect {
    pub fn new(valence: f64, arousal: f64) -> Self {
        Self { valence, arousal }
    }

    pub fn zero() -> Self {
        Self { valence: 0.0, arousal: 0.0 }
    }

    pub fn magnitude(&self) -> f64 {
        (self.valence * self.valence + self.arousal * self.arousal).sqrt()
    }

    /// Cosine between two affect vectors; 0 when either is (near) zero.
    pub fn cos(&self, other: &Affect) -> f64 {
        let na = self.magnitude();
        let nb = other.magnitude();
        if na < 1e-9 || nb < 1e-9 {
            return 0.0;
        }
        (self.valence * other.valence + self.arousal * other.arousal) / (na * nb)
    }

    /// Membership-weighted mean of member affects; None when nothing carries affect.
    pub fn weighted_mean(items: &[(Affect, f64)]) -> Option<Affect> {
        let mut v = 0.0;
        let mut a = 0.0;
        let mut w_sum = 0.0;
        for (affect, w) in items {
            v += affect.valence * w;
            a += affect.arousal * w;
            w_sum += w;
        }
        if w_sum < 1e-9 {
            return None;
        }
        Some(Affect::new(v / w_sum, a / w_sum))
    }
}
