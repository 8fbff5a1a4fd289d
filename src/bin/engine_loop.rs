//! Single-agent engine loop over a synthetic graph.
//!
//! Builds a small ring-of-clusters graph, seeds functional entities from the
//! YAML config when present, injects a burst of stimuli, and runs the frame
//! loop until the kill file appears.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use noetic::bootstrap;
use noetic::config::Config;
use noetic::engine::{Engine, Stimulus};
use noetic::graph::{Graph, Link, LinkType, Node, NodeType, Scope};
use noetic::telemetry::Emitter;

fn synthetic_graph(clusters: usize, per_cluster: usize) -> Result<Graph> {
    let mut g = Graph::new();
    let mut rng = StdRng::seed_from_u64(7);
    let types = [NodeType::Concept, NodeType::Memory, NodeType::Task, NodeType::Goal];

    for c in 0..clusters {
        let angle = c as f64 / clusters as f64 * std::f64::consts::TAU;
        for i in 0..per_cluster {
            let id = format!("n{}_{}", c, i);
            let node_type = types[rng.gen_range(0..types.len())];
            let mut n = Node::new(&id, node_type, Scope::Personal, &id);
            n.description = format!("cluster {} member {}", c, i);
            n.embedding = Some(vec![
                angle.cos() + rng.gen_range(-0.1..0.1),
                angle.sin() + rng.gen_range(-0.1..0.1),
            ]);
            g.add_node(n)?;
        }
        // Dense intra-cluster ring plus a chord.
        for i in 0..per_cluster {
            let src = format!("n{}_{}", c, i);
            let dst = format!("n{}_{}", c, (i + 1) % per_cluster);
            let mut l = Link::between_nodes(&format!("l{}_{}", c, i), &src, &dst, LinkType::Association);
            l.log_weight = rng.gen_range(0.2..0.8);
            g.add_link(l)?;
        }
    }
    // Sparse bridges between neighboring clusters.
    for c in 0..clusters {
        let src = format!("n{}_0", c);
        let dst = format!("n{}_0", (c + 1) % clusters);
        let mut l = Link::between_nodes(&format!("bridge{}", c), &src, &dst, LinkType::Semantic);
        l.log_weight = -0.5;
        g.add_link(l)?;
    }
    Ok(g)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let clusters = std::env::var("CLUSTERS").ok().and_then(|v| v.parse().ok()).unwrap_or(4);
    let per_cluster = std::env::var("PER_CLUSTER").ok().and_then(|v| v.parse().ok()).unwrap_or(8);

    let mut graph = synthetic_graph(clusters, per_cluster)?;

    let config_path = std::path::Path::new(&cfg.functional_entities_path);
    if config_path.exists() {
        let report = bootstrap::bootstrap_functional_entities(&mut graph, config_path, &cfg)?;
        eprintln!(
            "[bootstrap] functional entities={} belongs_to={}",
            report.entities_created, report.links_created
        );
    }
    let semantic = bootstrap::bootstrap_semantic_entities(&mut graph, clusters, &cfg)?;
    eprintln!(
        "[bootstrap] semantic entities={} belongs_to={}",
        semantic.entities_created, semantic.links_created
    );

    let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/noetic".to_string());
    let emitter = Emitter::to_dir(
        &cfg.agent_id,
        &log_dir,
        cfg.telemetry_buffer_size,
        cfg.stride_sample_rate,
        cfg.telemetry_flush_interval_s,
    )?;

    let mut engine = Engine::new(cfg, graph, emitter);
    let stim_tx = engine.stimulus_sender(256);

    // A burst of stimuli so the loop has something to think about.
    for c in 0..clusters {
        stim_tx
            .send(Stimulus { node_id: format!("n{}_0", c), energy: 2.0 })
            .await
            .ok();
    }

    eprintln!("[start] agent={} log_dir={}", engine.cfg.agent_id, log_dir);
    engine.run().await
}
