use std::cell::RefCell;
use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use reliability_graph::{sorted, CoreError, Edge, GraphIndices, NodeId};
use reliability_value::Value;

use crate::types::{Diamond, DiamondsAtNode};

const FIXED_POINT_ITERATION_CAP: usize = 1000;

/// Per-invocation memoization for the pairwise `ancestors(p) ∩ forks \ irrelevant`
/// lookups that §4.3 steps 2 and 6 repeat for every candidate source; avoids
/// recomputing the same set intersection for a node visited from multiple
/// directions during the fixed-point loop.
struct IdentifyCache<'a> {
    graph_indices: &'a GraphIndices,
    irrelevant: &'a IndexSet<NodeId>,
    fork_ancestors: RefCell<HashMap<NodeId, IndexSet<NodeId>>>,
}

impl<'a> IdentifyCache<'a> {
    fn new(graph_indices: &'a GraphIndices, irrelevant: &'a IndexSet<NodeId>) -> Self {
        Self {
            graph_indices,
            irrelevant,
            fork_ancestors: RefCell::new(HashMap::new()),
        }
    }

    /// `ancestors(p) ∩ forks \ irrelevant`, memoized.
    fn fork_ancestors_of(&self, p: NodeId) -> IndexSet<NodeId> {
        if let Some(cached) = self.fork_ancestors.borrow().get(&p) {
            return cached.clone();
        }
        let result: IndexSet<NodeId> = self
            .graph_indices
            .ancestors_of(p)
            .into_iter()
            .filter(|a| self.graph_indices.forks.contains(a) && !self.irrelevant.contains(a))
            .collect();
        self.fork_ancestors.borrow_mut().insert(p, result.clone());
        result
    }
}

/// Shared-fork-ancestor test of §4.3 step 2 (and its reuse in steps 6/7):
/// a fork `f` is shared if it appears in the fork-ancestor set of at least
/// two of `candidates`, OR if one candidate is itself an ancestor of another
/// (the "parent-as-fork" rule -- easy to miss, see DESIGN.md).
fn find_shared_fork_ancestors(cache: &IdentifyCache, candidates: &IndexSet<NodeId>) -> IndexSet<NodeId> {
    let candidates_sorted = sorted(candidates);
    let mut occurrence_count: HashMap<NodeId, usize> = HashMap::new();
    for &c in &candidates_sorted {
        for fork in cache.fork_ancestors_of(c) {
            *occurrence_count.entry(fork).or_insert(0) += 1;
        }
    }

    let mut shared: IndexSet<NodeId> = occurrence_count
        .into_iter()
        .filter(|&(_, count)| count >= 2)
        .map(|(fork, _)| fork)
        .collect();

    for &a in &candidates_sorted {
        if cache.irrelevant.contains(&a) {
            continue;
        }
        for &b in &candidates_sorted {
            if a != b && cache.graph_indices.ancestors_of(b).contains(&a) {
                shared.insert(a);
            }
        }
    }

    let mut shared_sorted: Vec<NodeId> = shared.into_iter().collect();
    shared_sorted.sort_unstable();
    shared_sorted.into_iter().collect()
}

/// Identify the (at most one) diamond terminating at `join`, per §4.3.
///
/// Returns `None` when `join` has no shared fork ancestor among its parents,
/// or when the resulting candidate conditioning set is empty.
pub fn identify_diamond_at_join<V: Value>(
    join: NodeId,
    graph_indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    excluded_nodes: &IndexSet<NodeId>,
) -> Result<Option<DiamondsAtNode>, CoreError> {
    let Some(parents) = graph_indices.parents(join).cloned() else {
        return Ok(None);
    };
    if parents.len() < 2 {
        return Ok(None);
    }

    // Step 1: irrelevant sources (prior exactly 0 or 1) are never conditioning.
    let mut irrelevant: IndexSet<NodeId> = excluded_nodes.clone();
    for &source in &graph_indices.sources {
        if let Some(prior) = node_priors.get(&source) {
            if prior.is_zero() || prior.is_one() {
                irrelevant.insert(source);
            }
        }
    }

    let cache = IdentifyCache::new(graph_indices, &irrelevant);

    // Step 2: shared fork ancestors among join's parents.
    let shared_forks = find_shared_fork_ancestors(&cache, &parents);
    if shared_forks.is_empty() {
        return Ok(None);
    }

    // Step 3: induce the initial subgraph.
    let mut relevant: IndexSet<NodeId> = shared_forks.clone();
    relevant.insert(join);
    let mut current_edges: IndexSet<Edge> = IndexSet::new();
    for &fork in &shared_forks {
        let path_nodes = graph_indices.descendants_of(fork).intersection(&graph_indices.ancestors_of(join)).copied().collect::<IndexSet<_>>();
        relevant.extend(path_nodes);
    }
    extend_induced_edges(graph_indices, &relevant, &mut current_edges);

    // Step 4: candidate conditioning nodes (no induced incoming edge), minus excluded.
    let mut current_sources = sources_within(&relevant, &current_edges);
    let candidate_conditioning: IndexSet<NodeId> = current_sources
        .difference(excluded_nodes)
        .copied()
        .collect();
    if candidate_conditioning.is_empty() {
        return Ok(None);
    }

    // Steps 5-7: fixed-point enlargement. Two flags are tracked independently
    // per iteration and the loop stops only when *both* are false for that
    // iteration -- collapsing either check into the other can loop forever
    // on pathological inputs (see SPEC_FULL.md §9).
    let mut shared_forks_so_far = shared_forks;
    let mut iterations = 0usize;
    loop {
        iterations += 1;
        if iterations > FIXED_POINT_ITERATION_CAP {
            tracing::error!(join = join.0, iterations, "diamond completeness loop did not converge");
            return Err(CoreError::IterationLimitExceeded(join));
        }

        let mut forks_changed = false;
        let mut edges_changed = false;

        // (a) new shared fork ancestors among the *current* sub-sources, using
        // full-graph ancestors (step 6/7a).
        let new_forks: IndexSet<NodeId> = find_shared_fork_ancestors(&cache, &current_sources)
            .difference(&shared_forks_so_far)
            .copied()
            .collect();
        if !new_forks.is_empty() {
            forks_changed = true;
            for &fork in &new_forks {
                relevant.insert(fork);
                let path_nodes: IndexSet<NodeId> = graph_indices
                    .descendants_of(fork)
                    .intersection(&graph_indices.ancestors_of(join))
                    .copied()
                    .collect();
                relevant.extend(path_nodes);
            }
            shared_forks_so_far.extend(new_forks);
            extend_induced_edges(graph_indices, &relevant, &mut current_edges);
        }

        // (b) ensure every intermediate has *all* of its graph-level incoming
        // edges present, even from nodes outside `relevant` (step 5/7b).
        current_sources = sources_within(&relevant, &current_edges);
        let intermediates: IndexSet<NodeId> = relevant
            .difference(&current_sources)
            .filter(|&&n| n != join)
            .copied()
            .collect();
        for &intermediate in sorted(&intermediates).iter() {
            if let Some(full_parents) = graph_indices.parents(intermediate) {
                for &p in full_parents {
                    let edge = Edge::new(p, intermediate);
                    if current_edges.insert(edge) {
                        edges_changed = true;
                        relevant.insert(p);
                    }
                }
            }
        }

        current_sources = sources_within(&relevant, &current_edges);

        if !forks_changed && !edges_changed {
            break;
        }
    }

    let conditioning_nodes: IndexSet<NodeId> = current_sources.difference(excluded_nodes).copied().collect();
    if conditioning_nodes.is_empty() {
        return Ok(None);
    }

    let mut edgelist: Vec<Edge> = current_edges.into_iter().collect();
    edgelist.sort_unstable();

    let non_diamond_parents: IndexSet<NodeId> = parents.difference(&relevant).copied().collect();

    tracing::debug!(
        join = join.0,
        relevant_nodes = relevant.len(),
        conditioning_nodes = conditioning_nodes.len(),
        "identified diamond"
    );

    let diamond = Diamond {
        relevant_nodes: relevant,
        conditioning_nodes,
        edgelist,
    };

    Ok(Some(DiamondsAtNode {
        diamond,
        non_diamond_parents,
        join_node: join,
    }))
}

/// Filter the full graph's edges to those with both endpoints in `relevant`,
/// folding the result into `current_edges` (monotonic growth; re-derives the
/// induced edge set without discarding edges already pulled in by the
/// intermediate-completeness step).
fn extend_induced_edges(graph_indices: &GraphIndices, relevant: &IndexSet<NodeId>, current_edges: &mut IndexSet<Edge>) {
    for &n in relevant {
        if let Some(children) = graph_indices.children(n) {
            for &c in children {
                if relevant.contains(&c) {
                    current_edges.insert(Edge::new(n, c));
                }
            }
        }
    }
}

/// Nodes in `relevant` with no incoming edge inside `edges` -- the sources of
/// the induced sub-DAG.
fn sources_within(relevant: &IndexSet<NodeId>, edges: &IndexSet<Edge>) -> IndexSet<NodeId> {
    let mut has_incoming: IndexSet<NodeId> = IndexSet::new();
    for edge in edges {
        if relevant.contains(&edge.target) {
            has_incoming.insert(edge.target);
        }
    }
    sorted(relevant)
        .into_iter()
        .filter(|n| !has_incoming.contains(n))
        .collect()
}

/// Identify and group diamonds for every join in `join_nodes`.
///
/// `excluded_nodes` carries the accumulated conditioning nodes of every
/// ancestor diamond along the current recursion path (see C4); a node in
/// `excluded_nodes` can never become a conditioning node of a diamond found
/// here, which is what keeps nested diamond discovery from re-deriving the
/// same dependence an outer diamond already accounts for (invariant I4).
pub fn identify_and_group_diamonds<V: Value>(
    join_nodes: &IndexSet<NodeId>,
    graph_indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    excluded_nodes: &IndexSet<NodeId>,
) -> Result<IndexMap<NodeId, DiamondsAtNode>, CoreError> {
    let mut result = IndexMap::new();
    for &join in sorted(join_nodes).iter() {
        if let Some(diamonds_at_node) = identify_diamond_at_join(join, graph_indices, node_priors, excluded_nodes)? {
            result.insert(join, diamonds_at_node);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use reliability_graph::Graph;
    use reliability_value::Scalar;

    use super::*;

    fn e(a: u64, b: u64) -> Edge {
        Edge::new(a, b)
    }

    fn n(ids: &[u64]) -> IndexSet<NodeId> {
        ids.iter().map(|&i| NodeId(i)).collect()
    }

    #[test]
    fn minimal_diamond_scenario_1() {
        let graph = Graph::from_edges([e(1, 2), e(2, 3), e(2, 4), e(3, 5), e(4, 5)], []);
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();

        let result = identify_and_group_diamonds(&indices.joins, &indices, &priors, &IndexSet::new()).unwrap();
        assert_eq!(result.len(), 1);
        let at_node = &result[&NodeId(5)];
        assert_eq!(at_node.join_node, NodeId(5));
        assert_eq!(at_node.diamond.conditioning_nodes, n(&[2]));
        assert_eq!(at_node.diamond.relevant_nodes, n(&[2, 3, 4, 5]));
        assert!(at_node.non_diamond_parents.is_empty());
    }

    #[test]
    fn parent_as_fork_scenario_3() {
        let graph = Graph::from_edges([e(1, 2), e(1, 3), e(2, 3)], []);
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();

        let result = identify_and_group_diamonds(&indices.joins, &indices, &priors, &IndexSet::new()).unwrap();
        let at_node = &result[&NodeId(3)];
        assert_eq!(at_node.diamond.conditioning_nodes, n(&[1]));
        assert_eq!(at_node.diamond.relevant_nodes, n(&[1, 2, 3]));
    }

    #[test]
    fn irrelevant_source_excluded_scenario_4() {
        let graph = Graph::from_edges([e(1, 2), e(2, 3), e(2, 4), e(3, 5), e(4, 5)], []);
        let indices = GraphIndices::build(&graph).unwrap();
        let mut priors: IndexMap<NodeId, Scalar> = IndexMap::new();
        priors.insert(NodeId(1), Scalar::one());

        // Node 1 has no shared-fork role here (it is a plain source feeding
        // the fork at 2), but it must never be usable as a conditioning node
        // when it is marked irrelevant. The diamond itself is still found at
        // node 2 exactly as in scenario 1.
        let result = identify_and_group_diamonds(&indices.joins, &indices, &priors, &IndexSet::new()).unwrap();
        let at_node = &result[&NodeId(5)];
        assert!(!at_node.diamond.conditioning_nodes.contains(&NodeId(1)));
        assert_eq!(at_node.diamond.conditioning_nodes, n(&[2]));
    }

    #[test]
    fn chained_diamonds_scenario_2() {
        let graph = Graph::from_edges(
            [
                e(1, 2),
                e(2, 3),
                e(2, 4),
                e(3, 5),
                e(4, 5),
                e(5, 6),
                e(5, 8),
                e(6, 7),
                e(8, 9),
                e(7, 10),
                e(9, 10),
            ],
            [],
        );
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();

        let result = identify_and_group_diamonds(&indices.joins, &indices, &priors, &IndexSet::new()).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[&NodeId(5)].diamond.conditioning_nodes, n(&[2]));

        // Both parents of join 10 trace back to fork 2 as well as fork 5 (2
        // is a transitive ancestor of both 7 and 9 through 5), so the
        // shared-fork test of step 2 pulls 2 in as a shared ancestor too --
        // the same merging behavior documented for the two-groups scenario
        // in DESIGN.md. The diamond at 10 conditions on 2, not 5, and its
        // relevant nodes subsume the inner diamond's.
        assert_eq!(result[&NodeId(10)].diamond.conditioning_nodes, n(&[2]));
        assert!(result[&NodeId(10)].diamond.relevant_nodes.is_superset(&n(&[2, 3, 4, 5, 6, 7, 8, 9, 10])));
    }

    #[test]
    fn no_shared_fork_means_no_diamond() {
        // 1 -> 3, 2 -> 3: two independent sources, no shared ancestor.
        let graph = Graph::from_edges([e(1, 3), e(2, 3)], []);
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();
        let result = identify_and_group_diamonds(&indices.joins, &indices, &priors, &IndexSet::new()).unwrap();
        assert!(result.is_empty());
    }
}
