//! Smoke: many frames over a clustered synthetic graph, checking the
//! invariants that make the runtime trustworthy end to end.

use noetic::config::Config;
use noetic::engine::{Engine, Stimulus};
use noetic::graph::{Endpoint, Entity, EntityKind, Graph, Link, LinkType, Node, NodeType, Scope};
use noetic::telemetry::Emitter;

fn clustered_graph() -> Graph {
    let mut g = Graph::new();
    let types = [NodeType::Concept, NodeType::Memory, NodeType::Goal];
    for c in 0..3 {
        for i in 0..6 {
            let id = format!("n{}_{}", c, i);
            let mut n = Node::new(&id, types[i % 3], Scope::Personal, &id);
            n.embedding = Some(vec![
                (c as f64 * 2.0).cos() + i as f64 * 0.01,
                (c as f64 * 2.0).sin(),
            ]);
            if i == 0 {
                n.energy = 3.0;
            }
            g.add_node(n).unwrap();
        }
        for i in 0..6 {
            let mut l = Link::between_nodes(
                &format!("l{}_{}", c, i),
                &format!("n{}_{}", c, i),
                &format!("n{}_{}", c, (i + 1) % 6),
                LinkType::Association,
            );
            l.log_weight = 0.4;
            g.add_link(l).unwrap();
        }
        let eid = format!("entity_fn_c{}", c);
        let mut e = Entity::new(&eid, &eid, EntityKind::Functional);
        e.centroid_embedding = Some(vec![(c as f64 * 2.0).cos(), (c as f64 * 2.0).sin()]);
        g.add_entity(e).unwrap();
        for i in 0..6 {
            let mut l = Link::new(
                &format!("m{}_{}", c, i),
                Endpoint::Node(format!("n{}_{}", c, i)),
                Endpoint::Entity(eid.clone()),
                LinkType::BelongsTo,
            );
            l.membership_weight = 0.5;
            g.add_link(l).unwrap();
        }
    }
    // Cross-cluster bridges.
    for c in 0..3 {
        let mut l = Link::between_nodes(
            &format!("bridge{}", c),
            &format!("n{}_0", c),
            &format!("n{}_0", (c + 1) % 3),
            LinkType::Semantic,
        );
        l.log_weight = -0.2;
        g.add_link(l).unwrap();
    }
    g
}

#[test]
fn fifty_frames_hold_all_invariants() {
    let cfg = Config::from_env();
    let weight_floor = cfg.weight_floor;
    let weight_ceiling = cfg.weight_ceiling;
    let mut engine = Engine::new(cfg, clustered_graph(), Emitter::memory("smoke", 65536, 0.2));

    let mut prev_total = engine.graph.total_energy();
    for f in 0..50 {
        let report = engine.run_frame(f as f64, 1.0, false);
        assert!(report.conservation_residual.abs() < 1e-6);
        // Energy never appears from nowhere: no stimuli, so the total can
        // only shrink (decay + stickiness dissipation).
        let total = engine.graph.total_energy();
        assert!(total <= prev_total + 1e-9, "frame {}: {} > {}", f, total, prev_total);
        prev_total = total;
        for node in engine.graph.nodes() {
            assert!(node.energy >= 0.0);
            assert!(node.log_weight >= weight_floor && node.log_weight <= weight_ceiling);
        }
    }
    assert!(!engine.in_safe_mode(), "healthy run must not trip safe mode");

    let heartbeats = engine.emitter.captured_named("tick_frame.v1");
    assert_eq!(heartbeats.len(), 50, "heartbeat every frame, never sampled");
    // Frame ids are monotone for consumer ordering.
    for (i, hb) in heartbeats.iter().enumerate() {
        assert_eq!(hb["frame_id"], i as u64);
    }
    // The controller reported every frame too.
    assert_eq!(engine.emitter.captured_named("criticality.state").len(), 50);
    assert_eq!(engine.emitter.captured_named("decay.tick").len(), 50);
    assert_eq!(engine.emitter.captured_named("wm.emit").len(), 50);
}

#[test]
fn stimulus_wakes_the_graph() {
    let cfg = Config::from_env();
    let mut engine = Engine::new(cfg, clustered_graph(), Emitter::memory("smoke", 16384, 0.0));
    let tx = engine.stimulus_sender(16);

    // Let the hot spots drain well below threshold.
    for f in 0..5 {
        engine.run_frame(f as f64, 1.0, false);
    }
    tx.try_send(Stimulus { node_id: "n1_3".into(), energy: 6.0 }).unwrap();
    engine.drain_stimuli(6.0);
    let report = engine.run_frame(6.0, 1.0, false);
    assert!(report.nodes_active >= 1);
    assert!(engine.graph.get_node("n1_3").unwrap().energy > 1.0);
    assert!((engine.scheduler_mut().time_since_stimulus(6.0)).abs() < 1e-9);
}

#[test]
fn entity_activity_flows_into_heartbeat() {
    let cfg = Config::from_env();
    let mut engine = Engine::new(cfg, clustered_graph(), Emitter::memory("smoke", 16384, 0.0));
    engine.run_frame(0.0, 1.0, false);
    let hb = engine.emitter.captured_named("tick_frame.v1");
    let entities = hb[0]["data"]["entities"].as_array().unwrap();
    assert_eq!(entities.len(), 3);
    for e in entities {
        assert!(e["members_count"].as_u64().unwrap() == 6);
        assert!(e["theta"].as_f64().unwrap() >= 0.0);
    }
}
