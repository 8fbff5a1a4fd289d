//! Tripwires and Safe Mode.
//!
//! Four counted violation classes inside a rolling window; past the
//! threshold the engine enters a bounded-override degraded state. Safe Mode
//! is diagnostic: it reduces risk surface and keeps the loop alive.

use std::collections::VecDeque;

use crate::config::Config;
use crate::telemetry::{Emitter, Event, SafeModeEnter, SafeModeExit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripwireKind {
    Conservation,
    Criticality,
    Frontier,
    Observability,
}

impl TripwireKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripwireKind::Conservation => "conservation",
            TripwireKind::Criticality => "criticality_band",
            TripwireKind::Frontier => "frontier",
            TripwireKind::Observability => "observability",
        }
    }
}

/// Override table applied while Safe Mode is active.
#[derive(Debug, Clone, Copy)]
pub struct SafeModeOverrides {
    pub alpha_scale: f64,
    pub dt_cap_s: f64,
    pub disable_enrichments: bool,
    pub force_selective_fanout: bool,
    pub sample_rate: f64,
}

impl SafeModeOverrides {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            alpha_scale: cfg.safe_mode_alpha_scale,
            dt_cap_s: cfg.safe_mode_dt_cap_s,
            disable_enrichments: true,
            force_selective_fanout: true,
            sample_rate: 1.0,
        }
    }

    pub fn describe(&self) -> Vec<String> {
        vec![
            format!("alpha_tick_scale={}", self.alpha_scale),
            format!("dt_cap_s={}", self.dt_cap_s),
            "emotion_gates=off".to_string(),
            "enrichments=off".to_string(),
            "fanout_strategy=selective".to_string(),
            format!("sample_rate={}", self.sample_rate),
        ]
    }
}

pub struct SafeMode {
    violations: VecDeque<(f64, TripwireKind)>,
    pub active: bool,
    entered_at: f64,
    last_violation_at: f64,
    crit_streak: u64,
    frontier_streak: u64,
    missing_events_streak: u64,
    overrides: SafeModeOverrides,
}

impl SafeMode {
    pub fn new(cfg: &Config) -> Self {
        Self {
            violations: VecDeque::new(),
            active: false,
            entered_at: 0.0,
            last_violation_at: f64::NEG_INFINITY,
            crit_streak: 0,
            frontier_streak: 0,
            missing_events_streak: 0,
            overrides: SafeModeOverrides::from_config(cfg),
        }
    }

    pub fn overrides(&self) -> Option<&SafeModeOverrides> {
        if self.active {
            Some(&self.overrides)
        } else {
            None
        }
    }

    /// Record one violation. Emits `safe_mode.enter` on the transition.
    pub fn record_violation(
        &mut self,
        kind: TripwireKind,
        reason: &str,
        now_s: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) -> bool {
        self.last_violation_at = now_s;
        self.violations.push_back((now_s, kind));
        self.prune(now_s, cfg);

        if !self.active && self.violations.len() >= cfg.safe_mode_violation_threshold {
            self.active = true;
            self.entered_at = now_s;
            emitter.emit(
                frame_id,
                &Event::SafeModeEnter(SafeModeEnter {
                    reason: reason.to_string(),
                    tripwire: kind.as_str().to_string(),
                    overrides_applied: self.overrides.describe(),
                    timestamp: now_s,
                }),
            );
            return true;
        }
        false
    }

    fn prune(&mut self, now_s: f64, cfg: &Config) {
        while let Some(&(t, _)) = self.violations.front() {
            if now_s - t > cfg.safe_mode_violation_window_s {
                self.violations.pop_front();
            } else {
                break;
            }
        }
    }

    /// Per-frame conservation check against the staged-delta residual.
    pub fn check_conservation(
        &mut self,
        residual: f64,
        now_s: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) {
        if residual.abs() > cfg.tripwire_conservation_epsilon {
            let reason = format!("conservation residual {:.6} > epsilon", residual);
            self.record_violation(TripwireKind::Conservation, &reason, now_s, cfg, emitter, frame_id);
        }
    }

    /// Consecutive-frame band check on rho.
    pub fn observe_rho(
        &mut self,
        rho: f64,
        now_s: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) {
        if rho < cfg.tripwire_rho_low || rho > cfg.tripwire_rho_high {
            self.crit_streak += 1;
            if self.crit_streak >= cfg.tripwire_criticality_frames {
                self.crit_streak = 0;
                let reason = format!("rho {:.3} outside band for {} frames", rho, cfg.tripwire_criticality_frames);
                self.record_violation(TripwireKind::Criticality, &reason, now_s, cfg, emitter, frame_id);
            }
        } else {
            self.crit_streak = 0;
        }
    }

    /// Consecutive-frame frontier-size check.
    pub fn observe_frontier(
        &mut self,
        active: usize,
        total: usize,
        now_s: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) {
        let pct = if total > 0 { active as f64 / total as f64 } else { 0.0 };
        if pct > cfg.tripwire_frontier_pct {
            self.frontier_streak += 1;
            if self.frontier_streak >= cfg.tripwire_frontier_frames {
                self.frontier_streak = 0;
                let reason = format!("frontier {:.1}% of graph for {} frames", pct * 100.0, cfg.tripwire_frontier_frames);
                self.record_violation(TripwireKind::Frontier, &reason, now_s, cfg, emitter, frame_id);
            }
        } else {
            self.frontier_streak = 0;
        }
    }

    /// Heartbeat accounting; a run of missed `tick_frame.v1` emissions is a
    /// violation.
    pub fn observe_heartbeat(
        &mut self,
        emitted: bool,
        now_s: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) {
        if emitted {
            self.missing_events_streak = 0;
            return;
        }
        self.missing_events_streak += 1;
        if self.missing_events_streak >= cfg.tripwire_missing_events_frames {
            self.missing_events_streak = 0;
            self.record_violation(
                TripwireKind::Observability,
                "tick_frame.v1 missing",
                now_s,
                cfg,
                emitter,
                frame_id,
            );
        }
    }

    /// End-of-frame upkeep: exit Safe Mode after a full quiet window.
    pub fn tick(&mut self, now_s: f64, cfg: &Config, emitter: &mut Emitter, frame_id: u64) {
        self.prune(now_s, cfg);
        if self.active && now_s - self.last_violation_at >= cfg.safe_mode_violation_window_s {
            let duration = now_s - self.entered_at;
            self.active = false;
            self.violations.clear();
            emitter.emit(
                frame_id,
                &Event::SafeModeExit(SafeModeExit {
                    reason: "sustained_compliance".to_string(),
                    duration_s: duration,
                    timestamp: now_s,
                }),
            );
        }
    }
}
