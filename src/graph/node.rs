//! Node: the only carrier of activation energy in the graph.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::affect::Affect;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Concept,
    Memory,
    Task,
    Goal,
    Value,
    Percept,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Concept => "concept",
            NodeType::Memory => "memory",
            NodeType::Task => "task",
            NodeType::Goal => "goal",
            NodeType::Value => "value",
            NodeType::Percept => "percept",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "concept" => Some(NodeType::Concept),
            "memory" => Some(NodeType::Memory),
            "task" => Some(NodeType::Task),
            "goal" => Some(NodeType::Goal),
            "value" => Some(NodeType::Value),
            "percept" => Some(NodeType::Percept),
            _ => None,
        }
    }

    /// Activation-decay multiplier. Memories linger, tasks evaporate.
    pub fn decay_multiplier(&self) -> f64 {
        match self {
            NodeType::Concept => 1.0,
            NodeType::Memory => 0.5,
            NodeType::Task => 5.0,
            NodeType::Goal => 0.8,
            NodeType::Value => 0.3,
            NodeType::Percept => 3.0,
        }
    }

    /// Weight-decay multiplier (slow clock).
    pub fn weight_decay_multiplier(&self) -> f64 {
        match self {
            NodeType::Concept => 1.0,
            NodeType::Memory => 0.5,
            NodeType::Task => 2.0,
            NodeType::Goal => 0.8,
            NodeType::Value => 0.2,
            NodeType::Percept => 1.5,
        }
    }

    /// Base stickiness of incoming energy at a node of this type.
    pub fn stickiness(&self) -> f64 {
        match self {
            NodeType::Concept => 1.0,
            NodeType::Memory => 0.95,
            NodeType::Task => 0.85,
            NodeType::Goal => 0.9,
            NodeType::Value => 1.0,
            NodeType::Percept => 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Personal,
    Organizational,
    Ecosystem,
}

impl Scope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personal" => Some(Scope::Personal),
            "organizational" => Some(Scope::Organizational),
            "ecosystem" => Some(Scope::Ecosystem),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Personal => "personal",
            Scope::Organizational => "organizational",
            Scope::Ecosystem => "ecosystem",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub vid: u64,
    pub node_type: NodeType,
    pub scope: Scope,
    pub name: String,
    pub description: String,
    pub embedding: Option<Vec<f64>>,

    /// Activation energy. The sole runtime state that gates thought spread.
    pub energy: f64,
    /// Adaptive activation threshold, recomputed each frame.
    pub theta: f64,

    /// Global attractor strength (log space).
    pub log_weight: f64,
    /// Sparse per-entity deltas; effective weight = log_weight + overlay.
    pub log_weight_overlays: HashMap<String, f64>,

    pub ema_trace_seats: f64,
    pub ema_wm_presence: f64,
    pub ema_formation_quality: f64,
    /// Epoch seconds of the last learning update (drives adaptive eta).
    pub last_update_ts: u64,

    pub affect: Option<Affect>,
    pub consolidated: bool,

    // Bitemporal fields, read-only to the runtime.
    pub valid_at: Option<i64>,
    pub invalidated_at: Option<i64>,
    pub created_at: i64,
    pub expired_at: Option<i64>,

    /// Outgoing / incoming node-to-node link ids, rebuilt by the container.
    #[serde(skip)]
    pub outgoing: Vec<String>,
    #[serde(skip)]
    pub incoming: Vec<String>,
    /// BELONGS_TO link ids attaching this node to entities.
    #[serde(skip)]
    pub memberships: Vec<String>,
}

impl Node {
    pub fn new(id: &str, node_type: NodeType, scope: Scope, name: &str) -> Self {
        Self {
            id: id.to_string(),
            vid: 1,
            node_type,
            scope,
            name: name.to_string(),
            description: String::new(),
            embedding: None,
            energy: 0.0,
            theta: 1.0,
            log_weight: 0.0,
            log_weight_overlays: HashMap::new(),
            ema_trace_seats: 0.0,
            ema_wm_presence: 0.0,
            ema_formation_quality: 0.0,
            last_update_ts: 0,
            affect: None,
            consolidated: false,
            valid_at: None,
            invalidated_at: None,
            created_at: 0,
            expired_at: None,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            memberships: Vec::new(),
        }
    }

    /// Effective log-weight as seen from an entity context, or globally.
    pub fn effective_log_weight(&self, entity: Option<&str>) -> f64 {
        let overlay = entity
            .and_then(|e| self.log_weight_overlays.get(e))
            .copied()
            .unwrap_or(0.0);
        self.log_weight + overlay
    }

    pub fn is_active(&self) -> bool {
        self.energy >= self.theta
    }
}
