//! In-memory graph container: nodes, links, entities, adjacency.
//!
//! Mutations only; no dynamics live here. The container exclusively owns all
//! instances and resolves link endpoints by id. Adjacency lists on nodes and
//! entities are rebuilt as links are added and removed.

pub mod entity;
pub mod link;
pub mod node;

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};

pub use entity::{ActivationLevel, Entity, EntityKind, StabilityState};
pub use link::{Endpoint, Link, LinkType};
pub use node::{Node, NodeType, Scope};

#[derive(Debug, Default, Clone)]
pub struct Graph {
    nodes: HashMap<String, Node>,
    links: HashMap<String, Link>,
    entities: HashMap<String, Entity>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // -- nodes --------------------------------------------------------------

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            bail!("duplicate node id: {}", node.id);
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Remove a node and cascade every incident link (including memberships).
    pub fn remove_node(&mut self, id: &str) -> Result<Node> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| anyhow!("unknown node id: {}", id))?;
        let incident: Vec<String> = self
            .links
            .values()
            .filter(|l| l.source.id() == id || l.target.id() == id)
            .map(|l| l.id.clone())
            .collect();
        for link_id in incident {
            let _ = self.remove_link(&link_id);
        }
        Ok(node)
    }

    pub fn get_nodes_by_type(&self, node_type: NodeType) -> Vec<&Node> {
        self.nodes.values().filter(|n| n.node_type == node_type).collect()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // -- entities -----------------------------------------------------------

    pub fn add_entity(&mut self, entity: Entity) -> Result<()> {
        if self.entities.contains_key(&entity.id) {
            bail!("duplicate entity id: {}", entity.id);
        }
        self.entities.insert(entity.id.clone(), entity);
        Ok(())
    }

    pub fn get_entity(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn get_entity_mut(&mut self, id: &str) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    /// Remove an entity; its BELONGS_TO and RELATES_TO links are dropped and
    /// member nodes return to the free pool.
    pub fn remove_entity(&mut self, id: &str) -> Result<Entity> {
        let entity = self
            .entities
            .remove(id)
            .ok_or_else(|| anyhow!("unknown entity id: {}", id))?;
        let incident: Vec<String> = self
            .links
            .values()
            .filter(|l| l.source.id() == id || l.target.id() == id)
            .map(|l| l.id.clone())
            .collect();
        for link_id in incident {
            let _ = self.remove_link(&link_id);
        }
        Ok(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn entities_mut(&mut self) -> impl Iterator<Item = &mut Entity> {
        self.entities.values_mut()
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // -- links --------------------------------------------------------------

    /// Add a link, resolving both endpoints and wiring adjacency.
    ///
    /// Duplicate link ids error; loaders that must tolerate duplicates call
    /// [`Graph::add_link_lenient`] instead.
    pub fn add_link(&mut self, link: Link) -> Result<()> {
        if self.links.contains_key(&link.id) {
            bail!("duplicate link id: {}", link.id);
        }
        self.resolve_endpoint(&link.source)?;
        self.resolve_endpoint(&link.target)?;

        match (&link.source, &link.target, link.link_type) {
            (Endpoint::Node(src), Endpoint::Node(dst), _) => {
                if let Some(n) = self.nodes.get_mut(src) {
                    n.outgoing.push(link.id.clone());
                }
                if let Some(n) = self.nodes.get_mut(dst) {
                    n.incoming.push(link.id.clone());
                }
            }
            (Endpoint::Node(src), Endpoint::Entity(dst), LinkType::BelongsTo) => {
                if let Some(n) = self.nodes.get_mut(src) {
                    n.memberships.push(link.id.clone());
                }
                if let Some(e) = self.entities.get_mut(dst) {
                    e.member_links.push(link.id.clone());
                }
            }
            (Endpoint::Entity(src), Endpoint::Entity(dst), LinkType::RelatesTo) => {
                if let Some(e) = self.entities.get_mut(src) {
                    e.relates_out.push(link.id.clone());
                }
                if let Some(e) = self.entities.get_mut(dst) {
                    e.relates_in.push(link.id.clone());
                }
            }
            _ => bail!(
                "link {} has endpoint shape incompatible with type {:?}",
                link.id,
                link.link_type
            ),
        }

        self.links.insert(link.id.clone(), link);
        Ok(())
    }

    /// Loader variant: a duplicate link id is logged and skipped, not an error.
    pub fn add_link_lenient(&mut self, link: Link) -> Result<bool> {
        if self.links.contains_key(&link.id) {
            return Ok(false);
        }
        self.add_link(link)?;
        Ok(true)
    }

    pub fn get_link(&self, id: &str) -> Option<&Link> {
        self.links.get(id)
    }

    pub fn get_link_mut(&mut self, id: &str) -> Option<&mut Link> {
        self.links.get_mut(id)
    }

    pub fn remove_link(&mut self, id: &str) -> Result<Link> {
        let link = self
            .links
            .remove(id)
            .ok_or_else(|| anyhow!("unknown link id: {}", id))?;
        let drop_id = |v: &mut Vec<String>| v.retain(|x| x != id);
        match (&link.source, &link.target) {
            (Endpoint::Node(src), Endpoint::Node(dst)) => {
                if let Some(n) = self.nodes.get_mut(src) {
                    drop_id(&mut n.outgoing);
                }
                if let Some(n) = self.nodes.get_mut(dst) {
                    drop_id(&mut n.incoming);
                }
            }
            (Endpoint::Node(src), Endpoint::Entity(dst)) => {
                if let Some(n) = self.nodes.get_mut(src) {
                    drop_id(&mut n.memberships);
                }
                if let Some(e) = self.entities.get_mut(dst) {
                    drop_id(&mut e.member_links);
                }
            }
            (Endpoint::Entity(src), Endpoint::Entity(dst)) => {
                if let Some(e) = self.entities.get_mut(src) {
                    drop_id(&mut e.relates_out);
                }
                if let Some(e) = self.entities.get_mut(dst) {
                    drop_id(&mut e.relates_in);
                }
            }
            _ => {}
        }
        Ok(link)
    }

    pub fn get_links_by_type(&self, link_type: LinkType) -> Vec<&Link> {
        self.links.values().filter(|l| l.link_type == link_type).collect()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = &mut Link> {
        self.links.values_mut()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    fn resolve_endpoint(&self, ep: &Endpoint) -> Result<()> {
        let ok = match ep {
            Endpoint::Node(id) => self.nodes.contains_key(id),
            Endpoint::Entity(id) => self.entities.contains_key(id),
        };
        if ok {
            Ok(())
        } else {
            Err(anyhow!("missing endpoint: {:?}", ep))
        }
    }

    // -- derived queries ----------------------------------------------------

    /// Members of an entity as (node_id, membership_weight), unnormalized.
    pub fn entity_members(&self, entity_id: &str) -> Vec<(String, f64)> {
        let Some(entity) = self.entities.get(entity_id) else {
            return Vec::new();
        };
        entity
            .member_links
            .iter()
            .filter_map(|lid| self.links.get(lid))
            .map(|l| (l.source.id().to_string(), l.membership_weight))
            .collect()
    }

    /// Membership weight of a node in an entity (0 when not a member).
    pub fn membership_weight(&self, node_id: &str, entity_id: &str) -> f64 {
        let Some(node) = self.nodes.get(node_id) else {
            return 0.0;
        };
        node.memberships
            .iter()
            .filter_map(|lid| self.links.get(lid))
            .find(|l| l.target.id() == entity_id)
            .map(|l| l.membership_weight)
            .unwrap_or(0.0)
    }

    /// Total activation energy across all nodes.
    pub fn total_energy(&self) -> f64 {
        self.nodes.values().map(|n| n.energy).sum()
    }

    /// Deterministic digest over node energies and weights, for replay
    /// validation and the status line.
    pub fn state_hash(&self) -> String {
        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort();
        let mut hasher = Sha256::new();
        for id in ids {
            let n = &self.nodes[id];
            hasher.update(id.as_bytes());
            hasher.update(n.energy.to_bits().to_le_bytes());
            hasher.update(n.log_weight.to_bits().to_le_bytes());
        }
        let mut lids: Vec<&String> = self.links.keys().collect();
        lids.sort();
        for id in lids {
            let l = &self.links[id];
            hasher.update(id.as_bytes());
            hasher.update(l.log_weight.to_bits().to_le_bytes());
        }
        hex::encode(&hasher.finalize()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concept(id: &str) -> Node {
        Node::new(id, NodeType::Concept, Scope::Personal, id)
    }

    fn graph_with_nodes(ids: &[&str]) -> Graph {
        let mut g = Graph::new();
        for id in ids {
            g.add_node(concept(id)).unwrap();
        }
        g
    }

    #[test]
    fn duplicate_node_id_errors() {
        let mut g = graph_with_nodes(&["a"]);
        assert!(g.add_node(concept("a")).is_err());
    }

    #[test]
    fn add_link_requires_endpoints() {
        let mut g = graph_with_nodes(&["a"]);
        let l = Link::between_nodes("l1", "a", "missing", LinkType::Association);
        assert!(g.add_link(l).is_err());
    }

    #[test]
    fn add_link_wires_adjacency() {
        let mut g = graph_with_nodes(&["a", "b"]);
        g.add_link(Link::between_nodes("l1", "a", "b", LinkType::Association))
            .unwrap();
        assert_eq!(g.get_node("a").unwrap().outgoing, vec!["l1"]);
        assert_eq!(g.get_node("b").unwrap().incoming, vec!["l1"]);
    }

    #[test]
    fn lenient_add_skips_duplicates() {
        let mut g = graph_with_nodes(&["a", "b"]);
        let l = Link::between_nodes("l1", "a", "b", LinkType::Association);
        assert!(g.add_link_lenient(l.clone()).unwrap());
        assert!(!g.add_link_lenient(l).unwrap());
        assert_eq!(g.link_count(), 1);
        assert_eq!(g.get_node("a").unwrap().outgoing.len(), 1);
    }

    #[test]
    fn remove_node_cascades_links() {
        let mut g = graph_with_nodes(&["a", "b", "c"]);
        g.add_link(Link::between_nodes("l1", "a", "b", LinkType::Association))
            .unwrap();
        g.add_link(Link::between_nodes("l2", "b", "c", LinkType::Association))
            .unwrap();
        g.remove_node("b").unwrap();
        assert_eq!(g.link_count(), 0);
        assert!(g.get_node("a").unwrap().outgoing.is_empty());
        assert!(g.get_node("c").unwrap().incoming.is_empty());
    }

    #[test]
    fn belongs_to_wires_membership() {
        let mut g = graph_with_nodes(&["a"]);
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional))
            .unwrap();
        let mut l = Link::new(
            "m1",
            Endpoint::Node("a".into()),
            Endpoint::Entity("entity_fn_x".into()),
            LinkType::BelongsTo,
        );
        l.membership_weight = 0.7;
        g.add_link(l).unwrap();
        assert_eq!(g.entity_members("entity_fn_x"), vec![("a".to_string(), 0.7)]);
        assert!((g.membership_weight("a", "entity_fn_x") - 0.7).abs() < 1e-12);
    }

    #[test]
    fn entity_removal_drops_memberships() {
        let mut g = graph_with_nodes(&["a"]);
        g.add_entity(Entity::new("entity_fn_x", "x", EntityKind::Functional))
            .unwrap();
        let mut l = Link::new(
            "m1",
            Endpoint::Node("a".into()),
            Endpoint::Entity("entity_fn_x".into()),
            LinkType::BelongsTo,
        );
        l.membership_weight = 0.7;
        g.add_link(l).unwrap();
        g.remove_entity("entity_fn_x").unwrap();
        assert_eq!(g.link_count(), 0);
        assert!(g.get_node("a").unwrap().memberships.is_empty());
    }

    #[test]
    fn shape_mismatch_rejected() {
        let mut g = graph_with_nodes(&["a", "b"]);
        // BELONGS_TO must be node -> entity.
        let l = Link::between_nodes("l1", "a", "b", LinkType::BelongsTo);
        assert!(g.add_link(l).is_err());
    }

    #[test]
    fn state_hash_tracks_energy() {
        let mut g = graph_with_nodes(&["a", "b"]);
        let h0 = g.state_hash();
        g.get_node_mut("a").unwrap().energy = 0.5;
        let h1 = g.state_hash();
        assert_ne!(h0, h1);
        g.get_node_mut("a").unwrap().energy = 0.0;
        assert_eq!(g.state_hash(), h0);
    }
}
