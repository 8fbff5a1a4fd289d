//! TRACE-driven weight learning with the dual-view split.
//!
//! TRACE records arrive pre-parsed from an external queue. Seats are
//! apportioned to items by Hamilton largest-remainder, z-scored by rank
//! within (type, scope) cohorts, and applied 20% to the global log-weight,
//! 80% spread across entity overlays in proportion to memberships.

use std::collections::HashMap;

use crate::config::Config;
use crate::graph::Graph;
use crate::stats::{ema_step, rank_z_scores};
use crate::telemetry::{
    Emitter, Event, OverlayDelta, TraceSignals, TraceUpdate, WeightsUpdatedTrace,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceItemKind {
    Node,
    Link,
}

impl TraceItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceItemKind::Node => "node",
            TraceItemKind::Link => "link",
        }
    }
}

/// One reinforced item inside a TRACE record.
#[derive(Debug, Clone)]
pub struct TraceItem {
    pub item_id: String,
    pub kind: TraceItemKind,
    /// Raw reinforcement score; converted to integer seats by apportionment.
    pub raw_seats: f64,
    /// Present when the item was part of a formation.
    pub formation_quality: Option<f64>,
}

/// Externally produced, pre-parsed reinforcement record.
#[derive(Debug, Clone)]
pub struct TraceResult {
    pub trace_id: String,
    pub seat_total: u32,
    pub items: Vec<TraceItem>,
    /// Entity annotations carried by the TRACE text, if any.
    pub entity_annotations: Vec<String>,
}

/// Hamilton largest-remainder apportionment of `total` seats over raw
/// scores. Zero or negative scores get nothing.
pub fn apportion_seats(raw: &[f64], total: u32) -> Vec<u32> {
    let positive: f64 = raw.iter().filter(|&&r| r > 0.0).sum();
    if positive <= 0.0 || total == 0 {
        return vec![0; raw.len()];
    }
    let quotas: Vec<f64> = raw
        .iter()
        .map(|&r| if r > 0.0 { r / positive * total as f64 } else { 0.0 })
        .collect();
    let mut seats: Vec<u32> = quotas.iter().map(|q| q.floor() as u32).collect();
    let mut assigned: u32 = seats.iter().sum();
    let mut order: Vec<usize> = (0..raw.len()).collect();
    order.sort_by(|&a, &b| {
        let ra = quotas[a] - quotas[a].floor();
        let rb = quotas[b] - quotas[b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut i = 0;
    while assigned < total && i < order.len() {
        if raw[order[i]] > 0.0 {
            seats[order[i]] += 1;
            assigned += 1;
        }
        i += 1;
    }
    seats
}

/// Adaptive learning rate: items untouched for a full tau learn at ~0.63.
pub fn adaptive_eta(dt_s: f64, tau_s: f64) -> f64 {
    1.0 - (-dt_s.max(0.0) / tau_s.max(1e-9)).exp()
}

/// Pure dual-view arithmetic for one item. Returns the update descriptor
/// after mutating `log_weight` and `overlays` in place.
#[allow(clippy::too_many_arguments)]
pub fn dual_view_update(
    item_id: &str,
    kind: TraceItemKind,
    log_weight: &mut f64,
    overlays: &mut HashMap<String, f64>,
    z_rein: f64,
    z_form: f64,
    eta: f64,
    context: &[(String, f64)],
    cfg: &Config,
) -> TraceUpdate {
    let z_total = z_rein + z_form;
    let before = *log_weight;
    let global_delta = cfg.trace_alpha_global * eta * z_total;
    *log_weight = (*log_weight + global_delta).clamp(cfg.weight_floor, cfg.weight_ceiling);

    let mut local_overlays = Vec::new();
    for (entity_id, membership) in context {
        if *membership <= 0.0 {
            continue;
        }
        let delta = cfg.trace_alpha_local * eta * z_total * membership;
        let slot = overlays.entry(entity_id.clone()).or_insert(0.0);
        let after = (*slot + delta).clamp(-cfg.overlay_cap, cfg.overlay_cap);
        let applied = after - *slot;
        *slot = after;
        local_overlays.push(OverlayDelta {
            entity: entity_id.clone(),
            delta: applied,
            overlay_after: after,
            membership_weight: *membership,
        });
    }

    TraceUpdate {
        item_id: item_id.to_string(),
        item_type: kind.as_str().to_string(),
        log_weight_before: before,
        log_weight_after: *log_weight,
        signals: TraceSignals { z_rein, z_form },
        eta,
        local_overlays,
    }
}

pub struct TraceLearner;

impl TraceLearner {
    pub fn new() -> Self {
        Self
    }

    /// Entity context by priority: last WM entities, then TRACE
    /// annotations, then the dominant active entity.
    fn entity_context(
        record: &TraceResult,
        wm_entities: &[String],
        dominant: Option<&str>,
    ) -> Vec<String> {
        if !wm_entities.is_empty() {
            return wm_entities.to_vec();
        }
        if !record.entity_annotations.is_empty() {
            return record.entity_annotations.clone();
        }
        dominant.map(|d| vec![d.to_string()]).unwrap_or_default()
    }

    /// Apply one batch of TRACE records. Returns the number of items
    /// updated.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &mut self,
        graph: &mut Graph,
        records: &[TraceResult],
        wm_entities: &[String],
        dominant: Option<&str>,
        now_s: f64,
        cfg: &Config,
        emitter: &mut Emitter,
        frame_id: u64,
    ) -> usize {
        let mut updates: Vec<TraceUpdate> = Vec::new();

        for record in records {
            let raw: Vec<f64> = record.items.iter().map(|i| i.raw_seats).collect();
            let seats = apportion_seats(&raw, record.seat_total);
            let context_ids = Self::entity_context(record, wm_entities, dominant);

            // Refresh per-item EMAs first; cohort z-scores read them.
            for (item, &s) in record.items.iter().zip(seats.iter()) {
                match item.kind {
                    TraceItemKind::Node => {
                        if let Some(node) = graph.get_node_mut(&item.item_id) {
                            node.ema_trace_seats =
                                ema_step(node.ema_trace_seats, s as f64, cfg.ema_alpha);
                            if let Some(q) = item.formation_quality {
                                node.ema_formation_quality =
                                    ema_step(node.ema_formation_quality, q, cfg.ema_alpha);
                            }
                        }
                    }
                    TraceItemKind::Link => {
                        if let Some(link) = graph.get_link_mut(&item.item_id) {
                            link.ema_trace_seats =
                                ema_step(link.ema_trace_seats, s as f64, cfg.ema_alpha);
                            if let Some(q) = item.formation_quality {
                                link.ema_formation_quality =
                                    ema_step(link.ema_formation_quality, q, cfg.ema_alpha);
                            }
                        }
                    }
                }
            }

            // Cohorts keyed by (kind, type, scope).
            let mut cohorts: HashMap<String, Vec<usize>> = HashMap::new();
            for (idx, item) in record.items.iter().enumerate() {
                let key = match item.kind {
                    TraceItemKind::Node => graph
                        .get_node(&item.item_id)
                        .map(|n| format!("node:{}:{}", n.node_type.as_str(), n.scope.as_str())),
                    TraceItemKind::Link => graph
                        .get_link(&item.item_id)
                        .map(|l| format!("link:{}", l.link_type.as_str())),
                };
                if let Some(key) = key {
                    cohorts.entry(key).or_default().push(idx);
                }
            }

            let mut z_rein = vec![0.0f64; record.items.len()];
            let mut z_form = vec![0.0f64; record.items.len()];
            for members in cohorts.values() {
                let seat_vals: Vec<f64> = members.iter().map(|&i| seats[i] as f64).collect();
                for (&i, z) in members.iter().zip(rank_z_scores(&seat_vals)) {
                    z_rein[i] = z;
                }
                let formed: Vec<usize> = members
                    .iter()
                    .copied()
                    .filter(|&i| record.items[i].formation_quality.is_some())
                    .collect();
                if formed.len() > 1 {
                    let q_vals: Vec<f64> = formed
                        .iter()
                        .map(|&i| record.items[i].formation_quality.unwrap_or(0.0))
                        .collect();
                    for (&i, z) in formed.iter().zip(rank_z_scores(&q_vals)) {
                        z_form[i] = z;
                    }
                }
            }

            for (idx, item) in record.items.iter().enumerate() {
                match item.kind {
                    TraceItemKind::Node => {
                        let Some(last_ts) = graph.get_node(&item.item_id).map(|n| n.last_update_ts)
                        else {
                            continue;
                        };
                        let eta = adaptive_eta(now_s - last_ts as f64, cfg.trace_tau_s);
                        let context: Vec<(String, f64)> = context_ids
                            .iter()
                            .map(|e| (e.clone(), graph.membership_weight(&item.item_id, e)))
                            .collect();
                        let Some(node) = graph.get_node_mut(&item.item_id) else {
                            continue;
                        };
                        let update = dual_view_update(
                            &item.item_id,
                            item.kind,
                            &mut node.log_weight,
                            &mut node.log_weight_overlays,
                            z_rein[idx],
                            z_form[idx],
                            eta,
                            &context,
                            cfg,
                        );
                        node.last_update_ts = now_s as u64;
                        updates.push(update);
                    }
                    TraceItemKind::Link => {
                        let Some((last_ts, src, dst)) = graph.get_link(&item.item_id).map(|l| {
                            (
                                l.last_update_ts,
                                l.source.id().to_string(),
                                l.target.id().to_string(),
                            )
                        }) else {
                            continue;
                        };
                        let eta = adaptive_eta(now_s - last_ts as f64, cfg.trace_tau_s);
                        // A link belongs to an entity as much as its weaker
                        // endpoint does.
                        let context: Vec<(String, f64)> = context_ids
                            .iter()
                            .map(|e| {
                                let m = graph
                                    .membership_weight(&src, e)
                                    .min(graph.membership_weight(&dst, e));
                                (e.clone(), m)
                            })
                            .collect();
                        let Some(link) = graph.get_link_mut(&item.item_id) else {
                            continue;
                        };
                        let update = dual_view_update(
                            &item.item_id,
                            item.kind,
                            &mut link.log_weight,
                            &mut link.log_weight_overlays,
                            z_rein[idx],
                            z_form[idx],
                            eta,
                            &context,
                            cfg,
                        );
                        link.last_update_ts = now_s as u64;
                        updates.push(update);
                    }
                }
            }
        }

        let count = updates.len();
        if count > 0 {
            emitter.emit(
                frame_id,
                &Event::WeightsTrace(WeightsUpdatedTrace {
                    source: "trace".to_string(),
                    updates,
                }),
            );
        }
        count
    }
}

impl Default for TraceLearner {
    fn default() -> Self {
        Self::new()
    }
}
