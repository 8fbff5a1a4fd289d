//! SQLite-backed graph store.
//!
//! One table per kind; link endpoints carry an explicit kind column so
//! reload resolves against the right table. Writes are transactional
//! snapshots. A connection is opened per call so the store can be shared
//! across tasks without interior locking.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::affect::Affect;
use crate::graph::{
    Endpoint, Entity, EntityKind, Graph, Link, LinkType, Node, NodeType, Scope, StabilityState,
};

use super::{encode_overlays, parse_energy, parse_overlays, GraphStore};

pub struct SqliteStore {
    path: String,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self> {
        let store = Self { path: path.to_string() };
        store.init()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection> {
        Connection::open(&self.path).context("open sqlite store")
    }

    fn init(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                vid INTEGER NOT NULL,
                node_type TEXT NOT NULL,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                embedding TEXT,
                energy TEXT NOT NULL DEFAULT '0',
                theta REAL NOT NULL DEFAULT 1.0,
                log_weight REAL NOT NULL DEFAULT 0.0,
                log_weight_overlays TEXT,
                ema_trace_seats REAL NOT NULL DEFAULT 0.0,
                ema_wm_presence REAL NOT NULL DEFAULT 0.0,
                ema_formation_quality REAL NOT NULL DEFAULT 0.0,
                last_update_ts INTEGER NOT NULL DEFAULT 0,
                valence REAL,
                arousal REAL,
                consolidated INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS links (
                id TEXT PRIMARY KEY,
                vid INTEGER NOT NULL,
                source_kind TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                target_id TEXT NOT NULL,
                link_type TEXT NOT NULL,
                subentity TEXT,
                log_weight REAL NOT NULL DEFAULT 0.0,
                log_weight_overlays TEXT,
                membership_weight REAL NOT NULL DEFAULT 0.0,
                ema_trace_seats REAL NOT NULL DEFAULT 0.0,
                ema_phi REAL NOT NULL DEFAULT 0.0,
                ema_formation_quality REAL NOT NULL DEFAULT 0.0,
                precedence_count INTEGER NOT NULL DEFAULT 0,
                last_update_ts INTEGER NOT NULL DEFAULT 0,
                boundary_stride_count INTEGER NOT NULL DEFAULT 0,
                semantic_distance REAL NOT NULL DEFAULT 0.0,
                created_at INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                color TEXT,
                centroid_embedding TEXT,
                stability_state TEXT NOT NULL DEFAULT 'candidate',
                ema_active REAL NOT NULL DEFAULT 0.0,
                coherence_ema REAL NOT NULL DEFAULT 0.0,
                ema_wm_presence REAL NOT NULL DEFAULT 0.0,
                ema_trace_seats REAL NOT NULL DEFAULT 0.0,
                ema_formation_quality REAL NOT NULL DEFAULT 0.0,
                frames_since_creation INTEGER NOT NULL DEFAULT 0
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Seed a graph into the store (bootstrap fixture / test helper).
    pub fn save_graph(&self, graph: &Graph) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for node in graph.nodes() {
            tx.execute(
                "INSERT OR REPLACE INTO nodes
                 (id, vid, node_type, scope, name, description, embedding, energy, theta,
                  log_weight, log_weight_overlays, ema_trace_seats, ema_wm_presence,
                  ema_formation_quality, last_update_ts, valence, arousal, consolidated, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                params![
                    node.id,
                    node.vid as i64,
                    node.node_type.as_str(),
                    node.scope.as_str(),
                    node.name,
                    node.description,
                    node.embedding.as_ref().map(|e| serde_json::to_string(e).unwrap_or_default()),
                    format!("{{\"default\": {}}}", node.energy),
                    node.theta,
                    node.log_weight,
                    encode_overlays(&node.log_weight_overlays),
                    node.ema_trace_seats,
                    node.ema_wm_presence,
                    node.ema_formation_quality,
                    node.last_update_ts as i64,
                    node.affect.map(|a| a.valence),
                    node.affect.map(|a| a.arousal),
                    node.consolidated as i64,
                    node.created_at,
                ],
            )?;
        }
        for link in graph.links() {
            let (source_kind, target_kind) = (
                endpoint_kind(&link.source),
                endpoint_kind(&link.target),
            );
            tx.execute(
                "INSERT OR REPLACE INTO links
                 (id, vid, source_kind, source_id, target_kind, target_id, link_type, subentity,
                  log_weight, log_weight_overlays, membership_weight, ema_trace_seats, ema_phi,
                  ema_formation_quality, precedence_count, last_update_ts,
                  boundary_stride_count, semantic_distance, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                params![
                    link.id,
                    link.vid as i64,
                    source_kind,
                    link.source.id(),
                    target_kind,
                    link.target.id(),
                    link.link_type.as_str(),
                    link.subentity,
                    link.log_weight,
                    encode_overlays(&link.log_weight_overlays),
                    link.membership_weight,
                    link.ema_trace_seats,
                    link.ema_phi,
                    link.ema_formation_quality,
                    link.precedence_count as i64,
                    link.last_update_ts as i64,
                    link.boundary_stride_count as i64,
                    link.semantic_distance,
                    link.created_at,
                ],
            )?;
        }
        for entity in graph.entities() {
            tx.execute(
                "INSERT OR REPLACE INTO entities
                 (id, name, kind, color, centroid_embedding, stability_state, ema_active,
                  coherence_ema, ema_wm_presence, ema_trace_seats, ema_formation_quality,
                  frames_since_creation)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    entity.id,
                    entity.name,
                    entity.kind.as_str(),
                    entity.color,
                    entity
                        .centroid_embedding
                        .as_ref()
                        .map(|e| serde_json::to_string(e).unwrap_or_default()),
                    entity.stability_state.as_str(),
                    entity.ema_active,
                    entity.coherence_ema,
                    entity.ema_wm_presence,
                    entity.ema_trace_seats,
                    entity.ema_formation_quality,
                    entity.frames_since_creation as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn endpoint_kind(ep: &Endpoint) -> &'static str {
    match ep {
        Endpoint::Node(_) => "node",
        Endpoint::Entity(_) => "entity",
    }
}

fn endpoint_from(kind: &str, id: String) -> Result<Endpoint> {
    match kind {
        "node" => Ok(Endpoint::Node(id)),
        "entity" => Ok(Endpoint::Entity(id)),
        other => Err(anyhow!("unknown endpoint kind: {}", other)),
    }
}

fn embedding_from(raw: Option<String>) -> Option<Vec<f64>> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

#[async_trait]
impl GraphStore for SqliteStore {
    async fn load_graph(&self, _graph_id: &str) -> Result<Graph> {
        let conn = self.open()?;
        let mut graph = Graph::new();

        let mut stmt = conn.prepare(
            "SELECT id, name, kind, color, centroid_embedding, stability_state, ema_active,
                    coherence_ema, ema_wm_presence, ema_trace_seats, ema_formation_quality,
                    frames_since_creation
             FROM entities",
        )?;
        let entities = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let color: Option<String> = row.get(3)?;
            let centroid: Option<String> = row.get(4)?;
            let state: String = row.get(5)?;
            let mut e = Entity::new(&id, &name, EntityKind::parse(&kind).unwrap_or(EntityKind::Functional));
            e.color = color;
            e.centroid_embedding = embedding_from(centroid);
            e.stability_state = StabilityState::parse(&state).unwrap_or(StabilityState::Candidate);
            e.ema_active = row.get(6)?;
            e.coherence_ema = row.get(7)?;
            e.ema_wm_presence = row.get(8)?;
            e.ema_trace_seats = row.get(9)?;
            e.ema_formation_quality = row.get(10)?;
            e.frames_since_creation = row.get::<_, i64>(11)? as u64;
            Ok(e)
        })?;
        for entity in entities {
            graph.add_entity(entity?)?;
        }

        let mut stmt = conn.prepare(
            "SELECT id, vid, node_type, scope, name, description, embedding, energy, theta,
                    log_weight, log_weight_overlays, ema_trace_seats, ema_wm_presence,
                    ema_formation_quality, last_update_ts, valence, arousal, consolidated,
                    created_at
             FROM nodes",
        )?;
        let nodes = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let node_type: String = row.get(2)?;
            let scope: String = row.get(3)?;
            let name: String = row.get(4)?;
            let mut n = Node::new(
                &id,
                NodeType::parse(&node_type).unwrap_or(NodeType::Concept),
                Scope::parse(&scope).unwrap_or(Scope::Personal),
                &name,
            );
            n.vid = row.get::<_, i64>(1)? as u64;
            n.description = row.get(5)?;
            n.embedding = embedding_from(row.get(6)?);
            let energy_raw: String = row.get(7)?;
            n.energy = parse_energy(&energy_raw);
            n.theta = row.get(8)?;
            n.log_weight = row.get(9)?;
            let overlays: Option<String> = row.get(10)?;
            n.log_weight_overlays = parse_overlays(overlays.as_deref());
            n.ema_trace_seats = row.get(11)?;
            n.ema_wm_presence = row.get(12)?;
            n.ema_formation_quality = row.get(13)?;
            n.last_update_ts = row.get::<_, i64>(14)? as u64;
            let valence: Option<f64> = row.get(15)?;
            let arousal: Option<f64> = row.get(16)?;
            if let (Some(v), Some(a)) = (valence, arousal) {
                n.affect = Some(Affect::new(v, a));
            }
            n.consolidated = row.get::<_, i64>(17)? != 0;
            n.created_at = row.get(18)?;
            Ok(n)
        })?;
        for node in nodes {
            graph.add_node(node?)?;
        }

        let mut stmt = conn.prepare(
            "SELECT id, vid, source_kind, source_id, target_kind, target_id, link_type,
                    subentity, log_weight, log_weight_overlays, membership_weight,
                    ema_trace_seats, ema_phi, ema_formation_quality, precedence_count,
                    last_update_ts, boundary_stride_count, semantic_distance, created_at
             FROM links",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, f64>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, f64>(10)?,
                row.get::<_, f64>(11)?,
                row.get::<_, f64>(12)?,
                row.get::<_, f64>(13)?,
                row.get::<_, i64>(14)?,
                row.get::<_, i64>(15)?,
                row.get::<_, i64>(16)?,
                row.get::<_, f64>(17)?,
                row.get::<_, i64>(18)?,
            ))
        })?;
        for row in rows {
            let (
                id,
                vid,
                source_kind,
                source_id,
                target_kind,
                target_id,
                link_type,
                subentity,
                log_weight,
                overlays,
                membership_weight,
                ema_trace_seats,
                ema_phi,
                ema_formation_quality,
                precedence_count,
                last_update_ts,
                boundary_stride_count,
                semantic_distance,
                created_at,
            ) = row?;
            let mut link = Link::new(
                &id,
                endpoint_from(&source_kind, source_id)?,
                endpoint_from(&target_kind, target_id)?,
                LinkType::parse(&link_type).ok_or_else(|| anyhow!("bad link type: {}", link_type))?,
            );
            link.vid = vid as u64;
            link.subentity = subentity;
            link.log_weight = log_weight;
            link.log_weight_overlays = parse_overlays(overlays.as_deref());
            link.membership_weight = membership_weight;
            link.ema_trace_seats = ema_trace_seats;
            link.ema_phi = ema_phi;
            link.ema_formation_quality = ema_formation_quality;
            link.precedence_count = precedence_count as u64;
            link.last_update_ts = last_update_ts as u64;
            link.boundary_stride_count = boundary_stride_count as u64;
            link.semantic_distance = semantic_distance;
            link.created_at = created_at;
            // Duplicate rows in a legacy store are skipped, not fatal.
            graph.add_link_lenient(link)?;
        }

        Ok(graph)
    }

    async fn update_node_energy(&self, node: &Node) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE nodes SET energy = ?1, theta = ?2, log_weight = ?3,
                    log_weight_overlays = ?4, last_update_ts = ?5
             WHERE id = ?6",
            params![
                format!("{{\"default\": {}}}", node.energy),
                node.theta,
                node.log_weight,
                encode_overlays(&node.log_weight_overlays),
                node.last_update_ts as i64,
                node.id,
            ],
        )?;
        Ok(())
    }

    async fn update_link_weight(&self, link: &Link) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE links SET log_weight = ?1, log_weight_overlays = ?2,
                    membership_weight = ?3, boundary_stride_count = ?4,
                    semantic_distance = ?5, last_update_ts = ?6
             WHERE id = ?7",
            params![
                link.log_weight,
                encode_overlays(&link.log_weight_overlays),
                link.membership_weight,
                link.boundary_stride_count as i64,
                link.semantic_distance,
                link.last_update_ts as i64,
                link.id,
            ],
        )?;
        Ok(())
    }

    async fn persist_subentities(&self, graph: &Graph) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for entity in graph.entities() {
            tx.execute(
                "INSERT OR REPLACE INTO entities
                 (id, name, kind, color, centroid_embedding, stability_state, ema_active,
                  coherence_ema, ema_wm_presence, ema_trace_seats, ema_formation_quality,
                  frames_since_creation)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                params![
                    entity.id,
                    entity.name,
                    entity.kind.as_str(),
                    entity.color,
                    entity
                        .centroid_embedding
                        .as_ref()
                        .map(|e| serde_json::to_string(e).unwrap_or_default()),
                    entity.stability_state.as_str(),
                    entity.ema_active,
                    entity.coherence_ema,
                    entity.ema_wm_presence,
                    entity.ema_trace_seats,
                    entity.ema_formation_quality,
                    entity.frames_since_creation as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
