//! Links: typed, weighted conduits. They transport energy, never hold it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::affect::Affect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Association,
    Causal,
    Semantic,
    Goal,
    BelongsTo,
    RelatesTo,
}

impl LinkType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "association" => Some(LinkType::Association),
            "causal" => Some(LinkType::Causal),
            "semantic" => Some(LinkType::Semantic),
            "goal" => Some(LinkType::Goal),
            "belongs_to" => Some(LinkType::BelongsTo),
            "relates_to" => Some(LinkType::RelatesTo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Association => "association",
            LinkType::Causal => "causal",
            LinkType::Semantic => "semantic",
            LinkType::Goal => "goal",
            LinkType::BelongsTo => "belongs_to",
            LinkType::RelatesTo => "relates_to",
        }
    }
}

/// Tagged endpoint union: a link touches either a node or an entity.
/// The kind is stored on the row so reload picks the right table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Endpoint {
    Node(String),
    Entity(String),
}

impl Endpoint {
    pub fn id(&self) -> &str {
        match self {
            Endpoint::Node(id) | Endpoint::Entity(id) => id,
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Endpoint::Node(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub id: String,
    pub vid: u64,
    pub source: Endpoint,
    pub target: Endpoint,
    pub link_type: LinkType,
    /// Entity that created this link, when formed during entity work.
    pub subentity: Option<String>,

    pub log_weight: f64,
    pub log_weight_overlays: HashMap<String, f64>,

    /// Membership weight; meaningful on BELONGS_TO links only.
    pub membership_weight: f64,

    pub ema_trace_seats: f64,
    pub ema_phi: f64,
    pub ema_formation_quality: f64,
    pub precedence_count: u64,
    /// Epoch seconds of the last learning update (drives adaptive eta).
    pub last_update_ts: u64,

    /// Transport-only; carried along strides, never stored as energy.
    pub emotion: Option<Affect>,

    // Entity-boundary bookkeeping (RELATES_TO links).
    pub boundary_stride_count: u64,
    pub semantic_distance: f64,

    pub valid_at: Option<i64>,
    pub invalidated_at: Option<i64>,
    pub created_at: i64,
    pub expired_at: Option<i64>,
}

impl Link {
    pub fn new(id: &str, source: Endpoint, target: Endpoint, link_type: LinkType) -> Self {
        Self {
            id: id.to_string(),
            vid: 1,
            source,
            target,
            link_type,
            subentity: None,
            log_weight: 0.0,
            log_weight_overlays: HashMap::new(),
            membership_weight: 0.0,
            ema_trace_seats: 0.0,
            ema_phi: 0.0,
            ema_formation_quality: 0.0,
            precedence_count: 0,
            last_update_ts: 0,
            emotion: None,
            boundary_stride_count: 0,
            semantic_distance: 0.0,
            valid_at: None,
            invalidated_at: None,
            created_at: 0,
            expired_at: None,
        }
    }

    pub fn between_nodes(id: &str, src: &str, dst: &str, link_type: LinkType) -> Self {
        Self::new(
            id,
            Endpoint::Node(src.to_string()),
            Endpoint::Node(dst.to_string()),
            link_type,
        )
    }

    pub fn effective_log_weight(&self, entity: Option<&str>) -> f64 {
        let overlay = entity
            .and_then(|e| self.log_weight_overlays.get(e))
            .copied()
            .unwrap_or(0.0);
        self.log_weight + overlay
    }
}
