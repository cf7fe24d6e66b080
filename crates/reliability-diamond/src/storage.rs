use std::sync::Mutex;

use indexmap::{IndexMap, IndexSet};
use rayon::prelude::*;
use reliability_graph::{sorted, CoreError, Edge, Graph, GraphIndices, NodeId};
use reliability_value::Value;

use crate::identify::{identify_and_group_diamonds, identify_diamond_at_join};
use crate::types::{Diamond, DiamondComputationData, DiamondHash, DiamondsAtNode, UniqueDiamondStorage};

/// Per-thread/per-invocation cache size threshold; past this many remembered
/// entries, [`LookupTable::purge_if_over_threshold`] drops everything and
/// lets the next miss rebuild from C3 rather than letting the table grow
/// unbounded over a long recursive discovery run.
const LOOKUP_TABLE_PURGE_THRESHOLD: usize = 10_000;

/// Hybrid lookup table (§4.4 step 5): every `DiamondsAtNode` ever
/// materialised anywhere in this build, keyed by the join node it terminates
/// at. Non-root work items consult this before paying for a full C3 search;
/// a candidate is reusable when its induced edges are a subset of the
/// current sub-DAG's edges and none of its conditioning nodes are already
/// excluded along the current recursion path.
#[derive(Clone, Default)]
struct LookupTable {
    by_join: IndexMap<NodeId, Vec<DiamondsAtNode>>,
    len: usize,
    /// Entries added since this instance was snapshotted from a shared
    /// master (always empty on the master itself); replayed into the
    /// master at merge time so a merge never re-inserts entries the
    /// snapshot already carried a copy of.
    discovered_since_snapshot: Vec<(NodeId, DiamondsAtNode)>,
}

impl LookupTable {
    fn lookup(&self, join: NodeId, current_edges: &IndexSet<Edge>, current_excluded: &IndexSet<NodeId>) -> Option<DiamondsAtNode> {
        self.by_join.get(&join)?.iter().find(|dan| {
            dan.diamond.edgelist.iter().all(|edge| current_edges.contains(edge))
                && dan.diamond.conditioning_nodes.is_disjoint(current_excluded)
        }).cloned()
    }

    fn record(&mut self, join: NodeId, dan: DiamondsAtNode) {
        self.by_join.entry(join).or_default().push(dan.clone());
        self.len += 1;
        self.discovered_since_snapshot.push((join, dan));
        self.purge_if_over_threshold();
    }

    /// Clear the table once it has accumulated more entries than the
    /// threshold; a miss after a purge simply falls back to C3, which is
    /// always correct, just slower, so this is a pure memory/time tradeoff.
    fn purge_if_over_threshold(&mut self) {
        if self.len > LOOKUP_TABLE_PURGE_THRESHOLD {
            tracing::debug!(entries = self.len, "purging diamond lookup table");
            self.by_join.clear();
            self.len = 0;
        }
    }

    /// Deep-copy this table for a new task, with its own empty discovery
    /// log so the task's later merge only replays what it itself found.
    fn snapshot(&self) -> Self {
        Self {
            by_join: self.by_join.clone(),
            len: self.len,
            discovered_since_snapshot: Vec::new(),
        }
    }

    /// Merge a task-local snapshot's new discoveries back into this
    /// (master) table under the caller's lock.
    fn merge_from(&mut self, mut other: LookupTable) {
        for (join, dan) in std::mem::take(&mut other.discovered_since_snapshot) {
            self.record(join, dan);
        }
    }
}

/// Find the nested diamonds at a non-root work item's sub-DAG joins,
/// consulting the hybrid lookup table first and falling back to C3 on a
/// miss, per §4.4 step 5. Root work items skip the table entirely and call
/// C3 directly, since a root's sub-DAG is the whole graph and nothing has
/// been materialised yet that could apply to it.
fn find_nested_diamonds<V: Value>(
    join_nodes: &IndexSet<NodeId>,
    graph_indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
    current_excluded: &IndexSet<NodeId>,
    current_edges: &IndexSet<Edge>,
    lookup_table: &mut LookupTable,
) -> Result<IndexMap<NodeId, DiamondsAtNode>, CoreError> {
    let mut result = IndexMap::new();
    for &join in sorted(join_nodes).iter() {
        if let Some(cached) = lookup_table.lookup(join, current_edges, current_excluded) {
            result.insert(join, cached);
            continue;
        }
        if let Some(dan) = identify_diamond_at_join(join, graph_indices, node_priors, current_excluded)? {
            lookup_table.record(join, dan.clone());
            result.insert(join, dan);
        }
    }
    Ok(result)
}

/// One unit of diamond discovery work: search for diamonds in `indices`
/// (the whole graph for the root task, or one diamond's induced sub-DAG for
/// every task below it), with `excluded_nodes` carrying every ancestor
/// diamond's conditioning nodes along this recursion path so nested
/// diamonds never re-derive an outer dependence (invariant I4).
///
/// `parent_hash` is `None` for the root task and `Some(hash)` for every task
/// spawned to search inside a freshly discovered diamond, identifying which
/// entry's `nested_diamonds` the results of this task belong to.
struct DiscoveryTask<V: Value> {
    graph: Graph,
    indices: GraphIndices,
    node_priors: IndexMap<NodeId, V>,
    excluded_nodes: IndexSet<NodeId>,
    parent_hash: Option<DiamondHash>,
}

fn root_task<V: Value>(graph: &Graph, graph_indices: &GraphIndices, node_priors: &IndexMap<NodeId, V>) -> DiscoveryTask<V> {
    DiscoveryTask {
        graph: graph.clone(),
        indices: graph_indices.clone(),
        node_priors: node_priors.clone(),
        excluded_nodes: IndexSet::new(),
        parent_hash: None,
    }
}

/// Build the sub-priors for a freshly discovered diamond's sub-DAG.
///
/// The join always starts from `one` (propagation computes its real
/// conditional belief); a non-source sub-node inherits its outer prior; a
/// sub-source that is *not* a conditioning node gets the `neutral`
/// placeholder (propagation always substitutes the outer belief before
/// recursing into this sub-DAG, so the placeholder is never actually read --
/// see the `neutral` design note); a sub-source that *is* a conditioning
/// node starts from `one` since the conditioning enumeration assigns it
/// explicitly.
fn sub_node_priors<V: Value>(diamond: &Diamond, sub_indices: &GraphIndices, join: NodeId, node_priors: &IndexMap<NodeId, V>) -> IndexMap<NodeId, V> {
    diamond
        .relevant_nodes
        .iter()
        .map(|&n| {
            let value = if n == join {
                V::one()
            } else if !sub_indices.sources.contains(&n) {
                node_priors.get(&n).cloned().unwrap_or_else(V::one)
            } else if !diamond.conditioning_nodes.contains(&n) {
                V::neutral()
            } else {
                V::one()
            };
            (n, value)
        })
        .collect()
}

fn child_task<V: Value>(task: &DiscoveryTask<V>, hash: DiamondHash, sub_graph: Graph, sub_indices: GraphIndices, priors: IndexMap<NodeId, V>, conditioning_nodes: &IndexSet<NodeId>) -> DiscoveryTask<V> {
    let mut excluded_nodes = task.excluded_nodes.clone();
    excluded_nodes.extend(conditioning_nodes.iter().copied());
    DiscoveryTask {
        graph: sub_graph,
        indices: sub_indices,
        node_priors: priors,
        excluded_nodes,
        parent_hash: Some(hash),
    }
}

/// Build the unique diamond storage (C4): a content-addressed map from
/// diamond hash to its prepared sub-problem, discovered by a LIFO work
/// stack rather than recursion so the discovery order is explicit and the
/// recursion depth is not bounded by the Rust call stack.
///
/// The content hash (`DiamondHash`) deduplicates a structurally identical
/// diamond discovered twice so it is only ever materialised once; the
/// hybrid lookup table (consulted for every non-root work item before a
/// miss falls back to full identification) is the separate mechanism that
/// avoids redoing that identification work in the first place.
pub fn build_unique_diamond_storage<V: Value>(
    graph: &Graph,
    graph_indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
) -> Result<UniqueDiamondStorage<V>, CoreError> {
    let mut result: UniqueDiamondStorage<V> = IndexMap::new();
    let mut lookup_table = LookupTable::default();
    let mut stack: Vec<DiscoveryTask<V>> = vec![root_task(graph, graph_indices, node_priors)];

    while let Some(task) = stack.pop() {
        let found: IndexMap<NodeId, DiamondsAtNode> = if task.parent_hash.is_none() {
            let found = identify_and_group_diamonds(&task.indices.joins, &task.indices, &task.node_priors, &task.excluded_nodes)?;
            for (&join, dan) in &found {
                lookup_table.record(join, dan.clone());
            }
            found
        } else {
            let current_edges: IndexSet<Edge> = task.graph.edges().iter().copied().collect();
            find_nested_diamonds(
                &task.indices.joins,
                &task.indices,
                &task.node_priors,
                &task.excluded_nodes,
                &current_edges,
                &mut lookup_table,
            )?
        };

        for (&join, dan) in &found {
            let hash = dan.diamond.hash();

            if let Some(parent_hash) = task.parent_hash {
                result
                    .get_mut(&parent_hash)
                    .expect("parent diamond must already be recorded before its children are discovered")
                    .nested_diamonds
                    .entry(join)
                    .or_default()
                    .push(dan.clone());
            }

            if result.contains_key(&hash) {
                continue;
            }

            let (sub_graph, sub_indices) = GraphIndices::restrict_to(&task.graph, &dan.diamond.relevant_nodes)?;
            let priors = sub_node_priors(&dan.diamond, &sub_indices, dan.join_node, &task.node_priors);

            result.insert(
                hash,
                DiamondComputationData {
                    diamond: dan.diamond.clone(),
                    sub_indices: sub_indices.clone(),
                    sub_node_priors: priors.clone(),
                    nested_diamonds: IndexMap::new(),
                },
            );

            stack.push(child_task(&task, hash, sub_graph, sub_indices, priors, &dan.diamond.conditioning_nodes));
        }
    }

    tracing::info!(unique_diamonds = result.len(), "built unique diamond storage (sequential)");
    Ok(result)
}

/// Parallel variant of [`build_unique_diamond_storage`].
///
/// Discovery tasks are processed one recursion depth at a time: every task
/// at the current depth is independent (distinct sub-DAGs, or distinct
/// diamonds found at the same depth) so the whole level runs concurrently
/// over a rayon work-stealing pool, synchronising only on the shared,
/// mutex-guarded result map before the next depth's tasks are spawned. Two
/// threads racing to discover the same diamond hash at the same depth both
/// do the (redundant) sub-indices work, but only one insert wins -- the
/// second re-checks under the lock and discards its copy, so the resulting
/// map is identical to the sequential build regardless of scheduling.
///
/// Each task takes its own deep-copied snapshot of the shared hybrid lookup
/// table at task start, consults it locally (no lock held while it runs
/// C3 on a miss), and merges its local discoveries back into the shared
/// master under a second lock once the task completes.
pub fn build_unique_diamond_storage_parallel<V: Value + Send + Sync>(
    graph: &Graph,
    graph_indices: &GraphIndices,
    node_priors: &IndexMap<NodeId, V>,
) -> Result<UniqueDiamondStorage<V>, CoreError> {
    let result: Mutex<UniqueDiamondStorage<V>> = Mutex::new(IndexMap::new());
    let lookup_table: Mutex<LookupTable> = Mutex::new(LookupTable::default());
    let mut frontier: Vec<DiscoveryTask<V>> = vec![root_task(graph, graph_indices, node_priors)];

    while !frontier.is_empty() {
        let outcomes: Vec<Result<Vec<DiscoveryTask<V>>, CoreError>> = frontier
            .into_par_iter()
            .map(|task| process_task_parallel(task, &result, &lookup_table))
            .collect();

        let mut next_frontier = Vec::new();
        for outcome in outcomes {
            next_frontier.extend(outcome?);
        }
        frontier = next_frontier;
    }

    let result = result.into_inner().expect("result mutex should never be poisoned");
    tracing::info!(unique_diamonds = result.len(), "built unique diamond storage (parallel)");
    Ok(result)
}

fn process_task_parallel<V: Value + Send + Sync>(
    task: DiscoveryTask<V>,
    result: &Mutex<UniqueDiamondStorage<V>>,
    lookup_table: &Mutex<LookupTable>,
) -> Result<Vec<DiscoveryTask<V>>, CoreError> {
    let mut local_lookup = lookup_table
        .lock()
        .expect("lookup table mutex should never be poisoned")
        .snapshot();

    let found: IndexMap<NodeId, DiamondsAtNode> = if task.parent_hash.is_none() {
        let found = identify_and_group_diamonds(&task.indices.joins, &task.indices, &task.node_priors, &task.excluded_nodes)?;
        for (&join, dan) in &found {
            local_lookup.record(join, dan.clone());
        }
        found
    } else {
        let current_edges: IndexSet<Edge> = task.graph.edges().iter().copied().collect();
        find_nested_diamonds(
            &task.indices.joins,
            &task.indices,
            &task.node_priors,
            &task.excluded_nodes,
            &current_edges,
            &mut local_lookup,
        )?
    };

    lookup_table
        .lock()
        .expect("lookup table mutex should never be poisoned")
        .merge_from(local_lookup);

    let mut children = Vec::new();

    for (&join, dan) in &found {
        let hash = dan.diamond.hash();

        let already_present = {
            let mut guard = result.lock().expect("result mutex should never be poisoned");
            if let Some(parent_hash) = task.parent_hash {
                if let Some(parent_entry) = guard.get_mut(&parent_hash) {
                    parent_entry.nested_diamonds.entry(join).or_default().push(dan.clone());
                }
            }
            guard.contains_key(&hash)
        };

        if already_present {
            continue;
        }

        let (sub_graph, sub_indices) = GraphIndices::restrict_to(&task.graph, &dan.diamond.relevant_nodes)?;
        let priors = sub_node_priors(&dan.diamond, &sub_indices, dan.join_node, &task.node_priors);

        let newly_inserted = {
            let mut guard = result.lock().expect("result mutex should never be poisoned");
            if guard.contains_key(&hash) {
                false
            } else {
                guard.insert(
                    hash,
                    DiamondComputationData {
                        diamond: dan.diamond.clone(),
                        sub_indices: sub_indices.clone(),
                        sub_node_priors: priors.clone(),
                        nested_diamonds: IndexMap::new(),
                    },
                );
                true
            }
        };

        if newly_inserted {
            children.push(child_task(&task, hash, sub_graph, sub_indices, priors, &dan.diamond.conditioning_nodes));
        }
    }

    Ok(children)
}

#[cfg(test)]
mod tests {
    use reliability_value::Scalar;

    use super::*;

    fn e(a: u64, b: u64) -> reliability_graph::Edge {
        reliability_graph::Edge::new(a, b)
    }

    fn chained_diamonds_graph() -> Graph {
        Graph::from_edges(
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
        )
    }

    #[test]
    fn sequential_storage_finds_both_diamonds_once_each() {
        let graph = chained_diamonds_graph();
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();

        let storage = build_unique_diamond_storage(&graph, &indices, &priors).unwrap();
        assert_eq!(storage.len(), 2);

        let join_nodes: IndexSet<NodeId> = storage.values().map(|data| {
            data.diamond
                .relevant_nodes
                .iter()
                .copied()
                .max()
                .expect("diamond has at least one node")
        }).collect();
        assert!(join_nodes.contains(&NodeId(5)));
        assert!(join_nodes.contains(&NodeId(10)));
    }

    #[test]
    fn storage_never_records_a_conditioning_node_already_excluded_upstream() {
        // Property check for I4 over every fixture already exercised above:
        // wherever nesting does occur, a nested diamond's conditioning set
        // must be disjoint from the diamond that contains it, since
        // `child_task` folds the parent's conditioning nodes into
        // `excluded_nodes` before the nested search runs.
        for graph in [chained_diamonds_graph(), chain_of_diamonds(10)] {
            let indices = GraphIndices::build(&graph).unwrap();
            let priors: IndexMap<NodeId, Scalar> = IndexMap::new();
            let storage = build_unique_diamond_storage(&graph, &indices, &priors).unwrap();
            for data in storage.values() {
                for nested in data.nested_diamonds.values().flatten() {
                    assert!(
                        nested.diamond.conditioning_nodes.is_disjoint(&data.diamond.conditioning_nodes),
                        "nested diamond at {:?} re-derives an ancestor's conditioning node",
                        nested.join_node,
                    );
                }
            }
        }
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let graph = chained_diamonds_graph();
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();

        let sequential = build_unique_diamond_storage(&graph, &indices, &priors).unwrap();
        let parallel = build_unique_diamond_storage_parallel(&graph, &indices, &priors).unwrap();

        let mut sequential_hashes: Vec<DiamondHash> = sequential.keys().copied().collect();
        let mut parallel_hashes: Vec<DiamondHash> = parallel.keys().copied().collect();
        sequential_hashes.sort_unstable();
        parallel_hashes.sort_unstable();
        assert_eq!(sequential_hashes, parallel_hashes);

        for hash in sequential_hashes {
            assert_eq!(sequential[&hash].diamond, parallel[&hash].diamond);
        }
    }

    /// A chain of `k` back-to-back diamonds: each join is the fork of the next
    /// diamond. Used to exercise L2 (sequential/parallel parity) at a scale
    /// where interleaving actually has room to differ.
    fn chain_of_diamonds(k: u64) -> Graph {
        let mut edges = Vec::new();
        let mut fork = 1u64;
        for _ in 0..k {
            let a = fork + 1;
            let b = fork + 2;
            let join = fork + 3;
            edges.push(e(fork, a));
            edges.push(e(fork, b));
            edges.push(e(a, join));
            edges.push(e(b, join));
            fork = join;
        }
        Graph::from_edges(edges, [])
    }

    #[test]
    fn sequential_and_parallel_agree_on_a_long_chain_scenario_6() {
        let graph = chain_of_diamonds(100);
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();

        let sequential = build_unique_diamond_storage(&graph, &indices, &priors).unwrap();
        let parallel = build_unique_diamond_storage_parallel(&graph, &indices, &priors).unwrap();

        assert_eq!(sequential.len(), 100);

        let mut sequential_hashes: Vec<DiamondHash> = sequential.keys().copied().collect();
        let mut parallel_hashes: Vec<DiamondHash> = parallel.keys().copied().collect();
        sequential_hashes.sort_unstable();
        parallel_hashes.sort_unstable();
        assert_eq!(sequential_hashes, parallel_hashes);

        for hash in sequential_hashes {
            assert_eq!(sequential[&hash].diamond, parallel[&hash].diamond);
            assert_eq!(
                sequential[&hash].sub_node_priors.len(),
                parallel[&hash].sub_node_priors.len()
            );
        }
    }

    fn sample_dan(join: u64, edges: &[(u64, u64)], conditioning: &[u64]) -> DiamondsAtNode {
        DiamondsAtNode {
            diamond: Diamond {
                relevant_nodes: edges.iter().flat_map(|&(a, b)| [NodeId(a), NodeId(b)]).collect(),
                conditioning_nodes: conditioning.iter().copied().map(NodeId).collect(),
                edgelist: edges.iter().map(|&(a, b)| e(a, b)).collect(),
            },
            non_diamond_parents: IndexSet::new(),
            join_node: NodeId(join),
        }
    }

    #[test]
    fn lookup_table_hits_on_subset_edges_and_disjoint_conditioning() {
        let mut table = LookupTable::default();
        let dan = sample_dan(5, &[(1, 3), (2, 3), (3, 4), (4, 5)], &[1, 2]);
        table.record(NodeId(5), dan.clone());

        let superset_edges: IndexSet<Edge> = [e(1, 3), e(2, 3), e(3, 4), e(4, 5), e(0, 1)].into_iter().collect();
        let hit = table.lookup(NodeId(5), &superset_edges, &IndexSet::new());
        assert_eq!(hit, Some(dan));

        // A conditioning-node collision must miss even though the edges match.
        let excluded: IndexSet<NodeId> = [NodeId(1)].into_iter().collect();
        assert!(table.lookup(NodeId(5), &superset_edges, &excluded).is_none());

        // A subset of the required edges must miss.
        let too_few_edges: IndexSet<Edge> = [e(1, 3), e(2, 3)].into_iter().collect();
        assert!(table.lookup(NodeId(5), &too_few_edges, &IndexSet::new()).is_none());

        // A different join node must miss even with identical edges.
        assert!(table.lookup(NodeId(6), &superset_edges, &IndexSet::new()).is_none());
    }

    #[test]
    fn lookup_table_snapshot_and_merge_replays_only_new_entries() {
        let mut master = LookupTable::default();
        master.record(NodeId(5), sample_dan(5, &[(1, 3), (2, 3), (3, 5)], &[1, 2]));

        let mut local = master.snapshot();
        assert_eq!(local.by_join.len(), 1);
        local.record(NodeId(10), sample_dan(10, &[(6, 8), (7, 8), (8, 10)], &[6, 7]));

        master.merge_from(local);
        assert_eq!(master.len, 2);
        assert!(master.by_join.contains_key(&NodeId(5)));
        assert!(master.by_join.contains_key(&NodeId(10)));
        // The join-5 entry was only ever recorded once -- the merge must not
        // have replayed the snapshot's own copy of it.
        assert_eq!(master.by_join[&NodeId(5)].len(), 1);
    }

    #[test]
    fn lookup_table_purges_once_over_threshold() {
        let mut table = LookupTable::default();
        for _ in 0..=LOOKUP_TABLE_PURGE_THRESHOLD {
            table.record(NodeId(1), sample_dan(1, &[(2, 1), (3, 1)], &[2, 3]));
        }
        assert!(table.by_join.is_empty());
        assert_eq!(table.len, 0);
    }

    #[test]
    fn no_diamonds_yields_empty_storage() {
        let graph = Graph::from_edges([e(1, 2), e(2, 3)], []);
        let indices = GraphIndices::build(&graph).unwrap();
        let priors: IndexMap<NodeId, Scalar> = IndexMap::new();
        let storage = build_unique_diamond_storage(&graph, &indices, &priors).unwrap();
        assert!(storage.is_empty());
    }
}
