use indexmap::{IndexMap, IndexSet};
use reliability_diamond::{identify_and_group_diamonds, DiamondsAtNode, UniqueDiamondStorage};
use reliability_graph::{sorted, CoreError, Edge, GraphIndices, NodeId};
use reliability_value::Value;

/// Top-level entry point (C5): compute the belief of every node in
/// `graph_indices`, given the already-built [`UniqueDiamondStorage`].
///
/// `unique_diamonds` is assumed to have been built by
/// `reliability_diamond::build_unique_diamond_storage[_parallel]` against
/// the same `graph_indices`; every diamond this function needs to look up
/// for the outer graph's own joins, and every nested diamond it recurses
/// into, must already be present.
pub fn propagate<V: Value>(
    graph_indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    edge_probs: &IndexMap<Edge, V>,
    unique_diamonds: &UniqueDiamondStorage<V>,
) -> Result<IndexMap<NodeId, V>, CoreError> {
    let diamonds_by_join = identify_and_group_diamonds(&graph_indices.joins, graph_indices, node_priors, &IndexSet::new())?
        .into_iter()
        .map(|(join, dan)| (join, vec![dan]))
        .collect::<IndexMap<NodeId, Vec<DiamondsAtNode>>>();

    tracing::info!(nodes = graph_indices.outgoing.len(), diamond_joins = diamonds_by_join.len(), "starting belief propagation");
    let belief = propagate_indices(graph_indices, node_priors, edge_probs, &diamonds_by_join, unique_diamonds)?;
    tracing::info!("finished belief propagation");
    Ok(belief)
}

/// The recursive engine shared by the top-level call and by every
/// conditioning-assignment's sub-propagation. `diamonds_by_join` is either
/// freshly computed (top level) or read straight off a `DiamondComputationData`'s
/// `nested_diamonds` field (recursive calls) -- both shapes are
/// `Map<Node, Vec<DiamondsAtNode>>`, one entry per independent diamond group
/// terminating at that join.
fn propagate_indices<V: Value>(
    indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    edge_probs: &IndexMap<Edge, V>,
    diamonds_by_join: &IndexMap<NodeId, Vec<DiamondsAtNode>>,
    unique_diamonds: &UniqueDiamondStorage<V>,
) -> Result<IndexMap<NodeId, V>, CoreError> {
    let mut belief: IndexMap<NodeId, V> = IndexMap::new();

    for layer in &indices.iteration_sets {
        for &n in sorted(layer).iter() {
            if indices.sources.contains(&n) {
                belief.insert(n, node_priors.get(&n).cloned().unwrap_or_else(V::one));
                continue;
            }

            let groups = diamonds_by_join.get(&n).filter(|g| !g.is_empty());
            let value = if let Some(groups) = groups {
                join_with_diamond_belief(n, groups, indices, node_priors, edge_probs, &belief, unique_diamonds)?
            } else {
                regular_node_belief(n, indices, node_priors, edge_probs, &belief)
            };
            belief.insert(n, value);
        }
    }

    Ok(belief)
}

fn regular_node_belief<V: Value>(
    n: NodeId,
    indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    edge_probs: &IndexMap<Edge, V>,
    belief: &IndexMap<NodeId, V>,
) -> V {
    let mut arrivals = Vec::new();
    if let Some(parents) = indices.parents(n) {
        for &p in sorted(parents).iter() {
            let edge_prob = edge_probs.get(&Edge::new(p, n)).cloned().unwrap_or_else(V::one);
            let parent_belief = belief.get(&p).cloned().expect("parent belief computed in an earlier iteration set");
            arrivals.push(parent_belief.mul(&edge_prob));
        }
    }
    let node_prior = node_priors.get(&n).cloned().unwrap_or_else(V::one);
    node_prior.mul(&reached_by_any(&arrivals))
}

fn join_with_diamond_belief<V: Value>(
    n: NodeId,
    groups: &[DiamondsAtNode],
    indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    edge_probs: &IndexMap<Edge, V>,
    belief: &IndexMap<NodeId, V>,
    unique_diamonds: &UniqueDiamondStorage<V>,
) -> Result<V, CoreError> {
    let mut group_contributions = Vec::with_capacity(groups.len());
    let mut non_diamond_parents: Option<IndexSet<NodeId>> = None;

    for group in groups {
        let contribution = diamond_group_contribution(group, belief, edge_probs, unique_diamonds)?;
        group_contributions.push(contribution);
        non_diamond_parents = Some(match non_diamond_parents {
            None => group.non_diamond_parents.clone(),
            Some(acc) => acc.intersection(&group.non_diamond_parents).copied().collect(),
        });
    }

    // Every disjoint diamond group terminating at n is treated as one
    // independent arrival; the general inclusion-exclusion sum over the 2^g
    // subsets of g groups has the closed form `1 - Π(1 - contribution_g)`
    // for independent arrivals, which is what the rest of this algorithm
    // already uses for combining arrivals at a node.
    let diamond_arrival = reached_by_any(&group_contributions);

    let mut arrivals = vec![diamond_arrival];
    if let Some(parents) = non_diamond_parents {
        for &p in sorted(&parents).iter() {
            let edge_prob = edge_probs.get(&Edge::new(p, n)).cloned().unwrap_or_else(V::one);
            let parent_belief = belief.get(&p).cloned().expect("non-diamond parent belief computed earlier");
            arrivals.push(parent_belief.mul(&edge_prob));
        }
    }

    let node_prior = node_priors.get(&n).cloned().unwrap_or_else(V::one);
    Ok(node_prior.mul(&reached_by_any(&arrivals)))
}

/// `Σ_assign p_assign · q_n^assign` over the `2^k` joint success/failure
/// assignments of a diamond's `k` conditioning nodes (step 4.5.2-4.5.6).
fn diamond_group_contribution<V: Value>(
    group: &DiamondsAtNode,
    outer_belief: &IndexMap<NodeId, V>,
    edge_probs: &IndexMap<Edge, V>,
    unique_diamonds: &UniqueDiamondStorage<V>,
) -> Result<V, CoreError> {
    let hash = group.diamond.hash();
    let data = unique_diamonds
        .get(&hash)
        .expect("every diamond reachable from propagation was built by build_unique_diamond_storage");

    let conditioning = sorted(&group.diamond.conditioning_nodes);
    let assignment_count = 1u64 << conditioning.len();

    let mut total = V::zero();
    for mask in 0..assignment_count {
        let mut conditional_priors = data.sub_node_priors.clone();
        let mut p_assign = V::one();

        for (bit, &c) in conditioning.iter().enumerate() {
            let success = (mask >> bit) & 1 == 1;
            let c_belief = outer_belief.get(&c).cloned().unwrap_or_else(V::one);
            if success {
                conditional_priors.insert(c, V::one());
                p_assign = p_assign.mul(&c_belief);
            } else {
                conditional_priors.insert(c, V::zero());
                p_assign = p_assign.mul(&c_belief.complement());
            }
        }

        // A sub-source that is not a conditioning node only stands for
        // "whatever the outer graph already computed there" -- its `neutral`
        // placeholder from storage-build time is replaced with the real,
        // already-computed outer belief before this sub-DAG is propagated.
        for &source in &data.sub_indices.sources {
            if !group.diamond.conditioning_nodes.contains(&source) {
                if let Some(outer) = outer_belief.get(&source) {
                    conditional_priors.insert(source, outer.clone());
                }
            }
        }

        let sub_belief = propagate_indices(&data.sub_indices, &conditional_priors, edge_probs, &data.nested_diamonds, unique_diamonds)?;
        let q_assign = sub_belief.get(&group.join_node).cloned().unwrap_or_else(V::one);
        total = total.add(&p_assign.mul(&q_assign));
    }

    Ok(total)
}

/// `1 - Π(1 - arrival)`: the probability that at least one of a set of
/// independent Bernoulli arrivals occurs. An empty arrival set never fires.
fn reached_by_any<V: Value>(arrivals: &[V]) -> V {
    let mut none_arrive = V::one();
    for arrival in arrivals {
        none_arrive = none_arrive.mul(&arrival.complement());
    }
    none_arrive.complement()
}
