//! Typed per-frame events and the buffered JSONL emitter.
//!
//! Every event goes out wrapped in an envelope carrying `v`, `agent_id`,
//! `frame_id`, and `t_ms`; consumers order by `(agent_id, frame_id)`. The
//! `tick_frame.v1` heartbeat is mandatory and never sampled; `stride.exec`
//! is sampled at a configurable rate. On buffer overflow the oldest records
//! are dropped and counted in `sampled_out_count`.

use std::collections::VecDeque;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct EntityData {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub color: Option<String>,
    pub energy: f64,
    pub theta: f64,
    pub active: bool,
    pub members_count: usize,
    pub coherence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_valence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_arousal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_magnitude: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickFrame {
    pub entities: Vec<EntityData>,
    pub nodes_active: usize,
    pub nodes_total: usize,
    pub strides_executed: u64,
    pub stride_budget: usize,
    pub rho: f64,
    pub coherence: f64,
    pub tick_duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RhoReading {
    pub global: f64,
    pub proxy_branching: f64,
    pub var_window: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BeforeAfter {
    pub before: f64,
    pub after: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CriticalityState {
    pub rho: RhoReading,
    pub safety_state: String,
    pub delta: BeforeAfter,
    pub alpha: BeforeAfter,
    pub controller_output: f64,
    pub oscillation_index: f64,
    pub threshold_multiplier: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnergyTotals {
    pub before: f64,
    pub after: f64,
    pub lost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightDecayCounts {
    pub nodes: usize,
    pub links: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecayTick {
    pub delta_e: f64,
    pub delta_w: f64,
    pub nodes_decayed: usize,
    pub energy: EnergyTotals,
    pub weight_decay: WeightDecayCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub half_lives_activation: Option<Vec<(String, f64)>>,
    pub auc_activation: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubentityFlip {
    pub entity_id: String,
    pub flip_direction: String,
    pub energy: f64,
    pub threshold: f64,
    pub activation_level: String,
    pub member_count: usize,
    pub active_members: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubentityLifecycle {
    pub entity_id: String,
    pub old_state: String,
    pub new_state: String,
    pub quality_score: f64,
    pub trigger: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeFlip {
    pub node: String,
    pub e_pre: f64,
    pub e_post: f64,
    pub theta: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkFlow {
    pub link_id: String,
    pub count: u64,
    pub entity_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkFlowSummary {
    pub flows: Vec<LinkFlow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenShare {
    pub id: String,
    pub tokens: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WmEmit {
    pub mode: String,
    pub selected_entities: Vec<String>,
    pub entity_token_shares: Vec<TokenShare>,
    pub selected_nodes: Vec<String>,
    pub token_budget_used: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrideExec {
    pub src_node: String,
    pub dst_node: String,
    pub link_id: String,
    pub phi: f64,
    pub ease: f64,
    pub ease_cost: f64,
    pub goal_affinity: f64,
    pub res_mult: f64,
    pub res_score: f64,
    pub comp_mult: f64,
    pub emotion_mult: f64,
    pub base_cost: f64,
    pub total_cost: f64,
    pub reason: String,
    pub delta_e: f64,
    pub stickiness: f64,
    pub retained_delta_e: f64,
    pub chosen: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stride_utility_zscore: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayDelta {
    pub entity: String,
    pub delta: f64,
    pub overlay_after: f64,
    pub membership_weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceSignals {
    pub z_rein: f64,
    pub z_form: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceUpdate {
    pub item_id: String,
    pub item_type: String,
    pub log_weight_before: f64,
    pub log_weight_after: f64,
    pub signals: TraceSignals,
    pub eta: f64,
    pub local_overlays: Vec<OverlayDelta>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightsUpdatedTrace {
    pub source: String,
    pub updates: Vec<TraceUpdate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafeModeEnter {
    pub reason: String,
    pub tripwire: String,
    pub overrides_applied: Vec<String>,
    pub timestamp: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SafeModeExit {
    pub reason: String,
    pub duration_s: f64,
    pub timestamp: f64,
}

/// Fanout planning snapshot carried on sampled stride selection events.
#[derive(Debug, Clone, Serialize)]
pub struct StrideSelection {
    pub src_node: String,
    pub strategy: String,
    pub top_k: usize,
    pub structure_would_suggest: String,
    pub outdegree: usize,
    pub wm_headroom: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Event {
    TickFrame(TickFrame),
    Criticality(CriticalityState),
    Decay(DecayTick),
    SubentityFlip(SubentityFlip),
    SubentityLifecycle(SubentityLifecycle),
    NodeFlip(NodeFlip),
    LinkFlowSummary(LinkFlowSummary),
    Wm(WmEmit),
    Stride(StrideExec),
    StrideSelection(StrideSelection),
    WeightsTrace(WeightsUpdatedTrace),
    SafeModeEnter(SafeModeEnter),
    SafeModeExit(SafeModeExit),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::TickFrame(_) => "tick_frame.v1",
            Event::Criticality(_) => "criticality.state",
            Event::Decay(_) => "decay.tick",
            Event::SubentityFlip(_) => "subentity.flip",
            Event::SubentityLifecycle(_) => "subentity.lifecycle",
            Event::NodeFlip(_) => "node.flip",
            Event::LinkFlowSummary(_) => "link.flow.summary",
            Event::Wm(_) => "wm.emit",
            Event::Stride(_) => "stride.exec",
            Event::StrideSelection(_) => "stride.selection",
            Event::WeightsTrace(_) => "weights.updated.trace",
            Event::SafeModeEnter(_) => "safe_mode.enter",
            Event::SafeModeExit(_) => "safe_mode.exit",
        }
    }

    /// Sampled events may be dropped by rate; mandatory ones never are.
    fn sampled(&self) -> bool {
        matches!(
            self,
            Event::Stride(_) | Event::StrideSelection(_) | Event::NodeFlip(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Emitter
// ---------------------------------------------------------------------------

enum Sink {
    /// JSONL file under the run directory.
    File(BufWriter<File>),
    /// In-memory capture, for tests and embedding.
    Memory(Vec<Value>),
    /// Swallow everything (benchmarks).
    Null,
}

pub struct Emitter {
    agent_id: String,
    sink: Sink,
    buffer: VecDeque<Value>,
    buffer_cap: usize,
    sample_rate: f64,
    sample_seq: u64,
    last_flush_s: f64,
    flush_interval_s: f64,
    pub sampled_out_count: u64,
    pub emit_failures: u64,
}

impl Emitter {
    /// File-backed emitter writing `events.jsonl` under `dir`.
    pub fn to_dir(agent_id: &str, dir: &str, buffer_cap: usize, sample_rate: f64, flush_interval_s: f64) -> anyhow::Result<Self> {
        let mut path = PathBuf::from(dir);
        create_dir_all(&path)?;
        path.push("events.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            agent_id: agent_id.to_string(),
            sink: Sink::File(BufWriter::new(file)),
            buffer: VecDeque::new(),
            buffer_cap,
            sample_rate,
            sample_seq: 0,
            last_flush_s: 0.0,
            flush_interval_s,
            sampled_out_count: 0,
            emit_failures: 0,
        })
    }

    pub fn memory(agent_id: &str, buffer_cap: usize, sample_rate: f64) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            sink: Sink::Memory(Vec::new()),
            buffer: VecDeque::new(),
            buffer_cap,
            sample_rate,
            sample_seq: 0,
            last_flush_s: 0.0,
            flush_interval_s: f64::INFINITY,
            sampled_out_count: 0,
            emit_failures: 0,
        }
    }

    pub fn null(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            sink: Sink::Null,
            buffer: VecDeque::new(),
            buffer_cap: 64,
            sample_rate: 0.0,
            sample_seq: 0,
            last_flush_s: 0.0,
            flush_interval_s: f64::INFINITY,
            sampled_out_count: 0,
            emit_failures: 0,
        }
    }

    pub fn set_sample_rate(&mut self, rate: f64) {
        self.sample_rate = rate.clamp(0.0, 1.0);
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Emit one event. Returns true if the record was accepted (mandatory
    /// events that fail to serialize count as emit failures for the
    /// observability tripwire).
    pub fn emit(&mut self, frame_id: u64, event: &Event) -> bool {
        if event.sampled() && !self.sample_hit() {
            self.sampled_out_count += 1;
            return true;
        }
        let data = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(_) => {
                self.emit_failures += 1;
                return false;
            }
        };
        let record = json!({
            "v": 1,
            "event": event.name(),
            "agent_id": self.agent_id,
            "frame_id": frame_id,
            "t_ms": Utc::now().timestamp_millis(),
            "data": data,
        });
        if self.buffer.len() >= self.buffer_cap {
            self.buffer.pop_front();
            self.sampled_out_count += 1;
        }
        self.buffer.push_back(record);
        true
    }

    /// Deterministic sampling: every k-th sampled event passes, k = 1/rate.
    fn sample_hit(&mut self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        let period = (1.0 / self.sample_rate).round().max(1.0) as u64;
        let hit = self.sample_seq % period == 0;
        self.sample_seq += 1;
        hit
    }

    /// Flush the buffer if the interval elapsed or the buffer is half full.
    pub fn maybe_flush(&mut self, now_s: f64) {
        if now_s - self.last_flush_s >= self.flush_interval_s
            || self.buffer.len() * 2 >= self.buffer_cap
        {
            self.flush(now_s);
        }
    }

    pub fn flush(&mut self, now_s: f64) {
        self.last_flush_s = now_s;
        while let Some(record) = self.buffer.pop_front() {
            match &mut self.sink {
                Sink::File(w) => {
                    if writeln!(w, "{}", record).is_err() {
                        self.emit_failures += 1;
                    }
                }
                Sink::Memory(v) => v.push(record),
                Sink::Null => {}
            }
        }
        if let Sink::File(w) = &mut self.sink {
            let _ = w.flush();
        }
    }

    /// Captured records (memory sink only); flushes first.
    pub fn captured(&mut self) -> Vec<Value> {
        self.flush(self.last_flush_s);
        match &self.sink {
            Sink::Memory(v) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// Captured records with a given event name (memory sink only).
    pub fn captured_named(&mut self, name: &str) -> Vec<Value> {
        self.captured()
            .into_iter()
            .filter(|r| r["event"] == name)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(nodes_total: usize) -> Event {
        Event::TickFrame(TickFrame {
            entities: Vec::new(),
            nodes_active: 0,
            nodes_total,
            strides_executed: 0,
            stride_budget: 32,
            rho: 1.0,
            coherence: 0.0,
            tick_duration_ms: 0.1,
        })
    }

    #[test]
    fn envelope_carries_ordering_keys() {
        let mut em = Emitter::memory("agent-7", 16, 1.0);
        em.emit(42, &tick(3));
        let records = em.captured();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["event"], "tick_frame.v1");
        assert_eq!(records[0]["frame_id"], 42);
        assert_eq!(records[0]["agent_id"], "agent-7");
        assert_eq!(records[0]["v"], 1);
        assert!(records[0]["t_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn stride_events_are_sampled() {
        let mut em = Emitter::memory("a", 1024, 0.5);
        let stride = Event::Stride(StrideExec {
            src_node: "a".into(),
            dst_node: "b".into(),
            link_id: "l".into(),
            phi: 0.0,
            ease: 1.0,
            ease_cost: 1.0,
            goal_affinity: 0.0,
            res_mult: 1.0,
            res_score: 0.0,
            comp_mult: 1.0,
            emotion_mult: 1.0,
            base_cost: 1.0,
            total_cost: 1.0,
            reason: "background".into(),
            delta_e: 0.1,
            stickiness: 1.0,
            retained_delta_e: 0.1,
            chosen: true,
            tier: None,
            tier_scale: None,
            stride_utility_zscore: None,
        });
        for _ in 0..10 {
            em.emit(1, &stride);
        }
        assert_eq!(em.captured_named("stride.exec").len(), 5);
        assert_eq!(em.sampled_out_count, 5);
    }

    #[test]
    fn heartbeat_never_sampled_out() {
        let mut em = Emitter::memory("a", 1024, 0.0);
        for f in 0..5 {
            assert!(em.emit(f, &tick(1)));
        }
        assert_eq!(em.captured_named("tick_frame.v1").len(), 5);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut em = Emitter::memory("a", 4, 1.0);
        for f in 0..8 {
            em.emit(f, &tick(1));
        }
        let records = em.captured();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["frame_id"], 4);
        assert!(em.sampled_out_count >= 4);
    }
}
