//! Adaptive tick scheduler: three competing interval factors, EMA smoothing,
//! and a hard physics dt cap.
//!
//! The scheduler and the criticality controller deliberately run on
//! different clocks; this module only decides when the next frame fires and
//! how much simulated time the physics is allowed to see.

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickReason {
    Stimulus,
    Activation,
    ArousalFloor,
}

impl TickReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickReason::Stimulus => "stimulus",
            TickReason::Activation => "activation",
            TickReason::ArousalFloor => "arousal_floor",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TickPlan {
    /// Raw three-factor minimum.
    pub interval_next_s: f64,
    /// EMA-smoothed interval actually slept.
    pub interval_smoothed_s: f64,
    pub reason: TickReason,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    pub dt_s: f64,
    pub was_capped: bool,
}

pub struct TickScheduler {
    last_stimulus_s: f64,
    last_frame_s: Option<f64>,
    interval_ema_s: Option<f64>,
    pub last_plan: Option<TickPlan>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self {
            last_stimulus_s: f64::NEG_INFINITY,
            last_frame_s: None,
            interval_ema_s: None,
            last_plan: None,
        }
    }

    /// Stimulus arrival only records the clock; injection happens elsewhere.
    pub fn on_stimulus(&mut self, now_s: f64) {
        self.last_stimulus_s = now_s;
    }

    pub fn time_since_stimulus(&self, now_s: f64) -> f64 {
        now_s - self.last_stimulus_s
    }

    /// Pick the next inter-frame interval from the three factors.
    pub fn plan(
        &mut self,
        now_s: f64,
        total_active_energy: f64,
        mean_arousal: f64,
        cfg: &Config,
    ) -> TickPlan {
        let min_s = cfg.min_interval_ms as f64 / 1000.0;
        let max_s = cfg.max_interval_s;

        let interval_stimulus = (now_s - self.last_stimulus_s).clamp(min_s, max_s);
        let interval_activation = activation_interval(total_active_energy, min_s, max_s);
        let interval_arousal = arousal_interval(mean_arousal, min_s, max_s);

        let (interval_next, reason) = [
            (interval_stimulus, TickReason::Stimulus),
            (interval_activation, TickReason::Activation),
            (interval_arousal, TickReason::ArousalFloor),
        ]
        .into_iter()
        .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap();

        let smoothed = match self.interval_ema_s {
            Some(prev) => cfg.ema_beta * interval_next + (1.0 - cfg.ema_beta) * prev,
            None => interval_next,
        };
        self.interval_ema_s = Some(smoothed);

        let plan = TickPlan {
            interval_next_s: interval_next,
            interval_smoothed_s: smoothed,
            reason,
        };
        self.last_plan = Some(plan);
        plan
    }

    /// Start a frame: physics dt is wall-clock elapsed, capped.
    pub fn begin_frame(&mut self, now_s: f64, dt_cap_s: f64, cfg: &Config) -> FrameClock {
        let elapsed = match self.last_frame_s {
            Some(prev) => (now_s - prev).max(0.0),
            None => cfg.min_interval_ms as f64 / 1000.0,
        };
        self.last_frame_s = Some(now_s);
        FrameClock {
            dt_s: elapsed.min(dt_cap_s),
            was_capped: elapsed > dt_cap_s,
        }
    }
}

impl Default for TickScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// High total activation ticks fast; a quiet graph coasts at the max
/// interval, log-interpolated in between.
fn activation_interval(total_active_energy: f64, min_s: f64, max_s: f64) -> f64 {
    if total_active_energy >= 10.0 {
        min_s
    } else if total_active_energy <= 1.0 {
        max_s
    } else {
        let fraction = total_active_energy.ln() / 10f64.ln();
        max_s * (min_s / max_s).powf(fraction)
    }
}

/// Arousal keeps a floor on responsiveness: hot affect halves the reaction
/// time budget, calm affect releases it.
fn arousal_interval(mean_arousal: f64, min_s: f64, max_s: f64) -> f64 {
    if mean_arousal > 0.7 {
        2.0 * min_s
    } else if mean_arousal < 0.3 {
        max_s
    } else {
        let t = (0.7 - mean_arousal) / 0.4;
        2.0 * min_s + t * (max_s - 2.0 * min_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stimulus_wins_right_after_arrival() {
        let cfg = Config::from_env();
        let mut s = TickScheduler::new();
        s.on_stimulus(100.0);
        let plan = s.plan(100.05, 0.0, 0.0, &cfg);
        assert_eq!(plan.reason, TickReason::Stimulus);
        assert!((plan.interval_next_s - 0.1).abs() < 1e-12);
    }

    #[test]
    fn activation_wins_on_hot_graph() {
        let cfg = Config::from_env();
        let mut s = TickScheduler::new();
        let plan = s.plan(1000.0, 50.0, 0.0, &cfg);
        assert_eq!(plan.reason, TickReason::Activation);
        assert!((plan.interval_next_s - 0.1).abs() < 1e-12);
    }

    #[test]
    fn arousal_floor_wins_under_high_affect() {
        let cfg = Config::from_env();
        let mut s = TickScheduler::new();
        let plan = s.plan(1000.0, 0.5, 0.9, &cfg);
        assert_eq!(plan.reason, TickReason::ArousalFloor);
        assert!((plan.interval_next_s - 0.2).abs() < 1e-12);
    }

    #[test]
    fn interval_is_three_factor_minimum() {
        let cfg = Config::from_env();
        let mut s = TickScheduler::new();
        s.on_stimulus(0.0);
        for (t, energy, arousal) in [
            (5.0, 3.0, 0.5),
            (0.2, 0.0, 0.0),
            (30.0, 12.0, 0.8),
            (100.0, 1.5, 0.31),
        ] {
            let plan = s.plan(t, energy, arousal, &cfg);
            let min_s = cfg.min_interval_ms as f64 / 1000.0;
            let stim = (t - 0.0f64).clamp(min_s, cfg.max_interval_s);
            let act = activation_interval(energy, min_s, cfg.max_interval_s);
            let aro = arousal_interval(arousal, min_s, cfg.max_interval_s);
            let expected = stim.min(act).min(aro);
            assert!((plan.interval_next_s - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn activation_interpolation_is_monotone() {
        let min_s = 0.1;
        let max_s = 60.0;
        let mut prev = activation_interval(1.0, min_s, max_s);
        for e in [2.0, 3.0, 5.0, 8.0, 9.9] {
            let cur = activation_interval(e, min_s, max_s);
            assert!(cur < prev, "interval must shrink as energy grows");
            prev = cur;
        }
    }

    #[test]
    fn ema_smoothing_tracks_plans() {
        let mut cfg = Config::from_env();
        cfg.ema_beta = 0.3;
        let mut s = TickScheduler::new();
        let p1 = s.plan(0.0, 0.0, 0.0, &cfg);
        assert!((p1.interval_smoothed_s - p1.interval_next_s).abs() < 1e-12);
        s.on_stimulus(100.0);
        let p2 = s.plan(100.0, 0.0, 0.0, &cfg);
        let expected = 0.3 * p2.interval_next_s + 0.7 * p1.interval_smoothed_s;
        assert!((p2.interval_smoothed_s - expected).abs() < 1e-12);
    }

    #[test]
    fn dt_capped_after_long_sleep() {
        let cfg = Config::from_env();
        let mut s = TickScheduler::new();
        s.begin_frame(0.0, cfg.dt_cap_s, &cfg);
        let clock = s.begin_frame(42.0, cfg.dt_cap_s, &cfg);
        assert!(clock.was_capped);
        assert!((clock.dt_s - cfg.dt_cap_s).abs() < 1e-12);
    }

    #[test]
    fn dt_uncapped_within_budget() {
        let cfg = Config::from_env();
        let mut s = TickScheduler::new();
        s.begin_frame(0.0, cfg.dt_cap_s, &cfg);
        let clock = s.begin_frame(2.0, cfg.dt_cap_s, &cfg);
        assert!(!clock.was_capped);
        assert!((clock.dt_s - 2.0).abs() < 1e-12);
    }
}
