mod input;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use indexmap::IndexMap;
use reliability_diamond::{build_unique_diamond_storage, build_unique_diamond_storage_parallel};
use reliability_graph::{GraphIndices, NodeId};
use reliability_propagate::propagate;
use reliability_utils::stdio::get_output_writer;

use crate::input::{read_adjacency_matrix, read_edge_probs_json, read_priors_json};

/// Compute reachability-reliability beliefs for every node of a DAG of
/// information flow, given per-node availability priors and per-edge
/// transmission probabilities.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Path to the CSV adjacency matrix (square, 0/1, no header)
    adjacency: PathBuf,

    /// Path to a `{"node_id": prior}` JSON dictionary. Omitted nodes default to prior 1.0
    #[clap(long)]
    priors: Option<PathBuf>,

    /// Path to a `{"source_id": {"target_id": prob}}` JSON dictionary. Omitted edges default to probability 1.0
    #[clap(long)]
    edge_probs: Option<PathBuf>,

    /// Path to the output. stdout if '-' or if not passed
    output: Option<PathBuf>,

    /// Print beliefs as a JSON object instead of plain `node: belief` lines
    #[clap(long)]
    json: bool,

    /// Build the unique diamond storage with the parallel (bulk-synchronous, per-level) variant
    #[clap(long)]
    parallel: bool,

    /// Also run the Monte-Carlo validator with this many trials and print the largest discrepancy
    #[clap(long)]
    monte_carlo_trials: Option<usize>,

    /// Seed for the Monte-Carlo validator's RNG
    #[clap(long, default_value_t = 0)]
    monte_carlo_seed: u64,
}

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("RELIABILITY_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let start = Instant::now();

    let graph = read_adjacency_matrix(&args.adjacency)?;
    let node_priors = match &args.priors {
        Some(path) => read_priors_json(path)?,
        None => IndexMap::new(),
    };
    let edge_probs = match &args.edge_probs {
        Some(path) => read_edge_probs_json(path)?,
        None => IndexMap::new(),
    };

    tracing::info!(
        nodes = graph.nodes().len(),
        edges = graph.edges().len(),
        "loaded graph"
    );

    let graph_indices = GraphIndices::build(&graph)?;
    tracing::debug!(
        forks = graph_indices.forks.len(),
        joins = graph_indices.joins.len(),
        layers = graph_indices.iteration_sets.len(),
        "built graph indices"
    );

    let storage = if args.parallel {
        build_unique_diamond_storage_parallel(&graph, &graph_indices, &node_priors)?
    } else {
        build_unique_diamond_storage(&graph, &graph_indices, &node_priors)?
    };
    tracing::info!(unique_diamonds = storage.len(), "built unique diamond storage");

    let belief = propagate(&graph_indices, &node_priors, &edge_probs, &storage)?;

    if let Some(trials) = args.monte_carlo_trials {
        let estimate = reliability_montecarlo::simulate(&graph_indices, &node_priors, &edge_probs, trials, args.monte_carlo_seed);
        let mut worst: Option<(NodeId, f64)> = None;
        for (&n, exact) in &belief {
            let Some(&empirical) = estimate.get(&n) else { continue };
            let delta = (exact.get() - empirical).abs();
            if worst.is_none_or(|(_, w)| delta > w) {
                worst = Some((n, delta));
            }
        }
        if let Some((node, delta)) = worst {
            tracing::info!(node = node.0, delta, trials, "monte-carlo validation complete");
        }
    }

    let mut output = get_output_writer(&args.output)?;
    write_beliefs(&mut output, &belief, args.json)?;

    tracing::info!(elapsed = ?start.elapsed(), "finished");
    Ok(())
}

fn write_beliefs(writer: &mut dyn std::io::Write, belief: &IndexMap<NodeId, reliability_value::Scalar>, json: bool) -> eyre::Result<()> {
    use itertools::Itertools;
    let nodes: Vec<NodeId> = belief.keys().copied().sorted().collect();

    if json {
        let map: serde_json::Map<String, serde_json::Value> = nodes
            .iter()
            .map(|n| (n.to_string(), serde_json::json!(belief[n].get())))
            .collect();
        serde_json::to_writer_pretty(&mut *writer, &serde_json::Value::Object(map))?;
        writeln!(writer)?;
    } else {
        for n in &nodes {
            writeln!(writer, "{n}: {}", belief[n].get())?;
        }
    }
    Ok(())
}
