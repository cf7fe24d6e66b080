//! Independent Monte-Carlo sampler (C6): draws realizations of node
//! availability and edge transmission, and reports the empirical fraction of
//! trials in which each node is reached from the sources.
//!
//! This is a validator, not part of the exact inference engine: it never
//! reads a [`reliability_diamond::UniqueDiamondStorage`] and has no notion of
//! diamonds or conditioning. It exists purely to cross-check
//! `reliability_propagate::propagate`'s output (see law L3 in the design
//! docs).

use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reliability_graph::{sorted, Edge, GraphIndices, NodeId};
use reliability_value::Value;

/// Run `trials` independent simulations and return, for each node, the
/// fraction of trials in which it was reached from a source.
///
/// Sampling draws a Bernoulli parameter from each prior/edge probability via
/// [`Value::nominal_scalar`]. For the scalar value kind this is exact; for
/// interval and p-box kinds it is a projection (the interval midpoint, or
/// the p-box's mean-CDF expectation) since neither kind has a single
/// probability to draw from -- callers comparing against those kinds are
/// validating against a projection, not an exact probabilistic check.
pub fn simulate<V: Value>(
    graph_indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    edge_probs: &IndexMap<Edge, V>,
    trials: usize,
    seed: u64,
) -> IndexMap<NodeId, f64> {
    tracing::info!(trials, nodes = graph_indices.sources.len(), "starting monte-carlo simulation");

    let node_p: IndexMap<NodeId, f64> = graph_indices
        .outgoing
        .keys()
        .map(|&n| (n, node_priors.get(&n).map(Value::nominal_scalar).unwrap_or(1.0)))
        .collect();
    let edge_p: IndexMap<Edge, f64> = edge_probs.iter().map(|(&e, p)| (e, p.nominal_scalar())).collect();

    let mut reached_count: IndexMap<NodeId, u64> = node_p.keys().map(|&n| (n, 0u64)).collect();
    let mut rng = StdRng::seed_from_u64(seed);

    for trial in 0..trials {
        let mut reached: IndexMap<NodeId, bool> = IndexMap::new();
        for layer in &graph_indices.iteration_sets {
            for &n in sorted(layer).iter() {
                let available = rng.random_bool(node_p.get(&n).copied().unwrap_or(1.0));
                let is_reached = if graph_indices.sources.contains(&n) {
                    available
                } else {
                    available
                        && graph_indices.parents(n).is_some_and(|parents| {
                            sorted(parents).into_iter().any(|p| {
                                let transmits = rng.random_bool(edge_p.get(&Edge::new(p, n)).copied().unwrap_or(1.0));
                                *reached.get(&p).unwrap_or(&false) && transmits
                            })
                        })
                };
                reached.insert(n, is_reached);
            }
        }
        for (&n, &is_reached) in &reached {
            if is_reached {
                *reached_count.entry(n).or_insert(0) += 1;
            }
        }
        if trial > 0 && trial % 1_000_000 == 0 {
            tracing::debug!(trial, "monte-carlo progress");
        }
    }

    tracing::info!("finished monte-carlo simulation");

    reached_count.into_iter().map(|(n, count)| (n, count as f64 / trials as f64)).collect()
}

/// Wilson-free Chernoff-style bound used by law L3: the largest deviation
/// between an exact belief `p` and an `n`-trial empirical estimate expected
/// with overwhelming probability.
pub fn l3_tolerance(p: f64, trials: usize) -> f64 {
    3.0 * (p * (1.0 - p) / trials as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use reliability_diamond::build_unique_diamond_storage;
    use reliability_graph::Graph;
    use reliability_propagate::propagate;
    use reliability_value::Scalar;

    use super::*;

    fn e(a: u64, b: u64) -> Edge {
        Edge::new(a, b)
    }

    #[test]
    fn minimal_diamond_matches_monte_carlo_scenario_1() {
        let graph = Graph::from_edges([e(1, 2), e(2, 3), e(2, 4), e(3, 5), e(4, 5)], []);
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();
        let edge_probs: IndexMap<Edge, Scalar> = graph.edges().iter().map(|&edge| (edge, Scalar::new(0.9).unwrap())).collect();

        let storage = build_unique_diamond_storage(&graph, &indices, &priors).unwrap();
        let belief = propagate(&indices, &priors, &edge_probs, &storage).unwrap();

        let trials = 200_000;
        let estimate = simulate(&indices, &priors, &edge_probs, trials, 42);

        let exact = belief[&NodeId(5)].get();
        let tolerance = l3_tolerance(exact, trials).max(0.01);
        assert!(
            (estimate[&NodeId(5)] - exact).abs() < tolerance,
            "exact={exact} estimate={} tolerance={tolerance}",
            estimate[&NodeId(5)]
        );
    }

    #[test]
    fn source_belief_matches_its_own_prior() {
        let graph = Graph::from_edges([e(1, 2)], []);
        let indices = GraphIndices::build(&graph).unwrap();
        let mut priors: IndexMap<NodeId, Scalar> = IndexMap::new();
        priors.insert(NodeId(1), Scalar::new(0.7).unwrap());
        let edge_probs: IndexMap<Edge, Scalar> = graph.edges().iter().map(|&edge| (edge, Scalar::one())).collect();

        let estimate = simulate(&indices, &priors, &edge_probs, 50_000, 7);
        assert!((estimate[&NodeId(1)] - 0.7).abs() < 0.02);
    }
}
