use indexmap::{IndexMap, IndexSet};

use crate::error::CoreError;
use crate::node::{Edge, NodeId};

/// An immutable DAG: the union of every node mentioned by an edge endpoint,
/// plus whatever isolated nodes the caller adds explicitly.
///
/// `Graph` only stores the shape of the DAG. Per-node priors and per-edge
/// transmission probabilities live alongside it in caller-supplied maps (see
/// `reliability-propagate`), not in this type.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: IndexSet<NodeId>,
    edges: Vec<Edge>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from an edge list, plus any isolated nodes that never
    /// appear as an edge endpoint (e.g. nodes declared only in a prior map).
    ///
    /// Duplicate edges (repeated verbatim) are folded into one; a boolean
    /// reachability DAG has no notion of edge multiplicity.
    pub fn from_edges(edges: impl IntoIterator<Item = Edge>, isolated: impl IntoIterator<Item = NodeId>) -> Self {
        let mut nodes = IndexSet::new();
        let mut seen = IndexSet::new();
        let mut deduped = Vec::new();
        for edge in edges {
            nodes.insert(edge.source);
            nodes.insert(edge.target);
            if seen.insert(edge) {
                deduped.push(edge);
            }
        }
        for node in isolated {
            nodes.insert(node);
        }
        Self {
            nodes,
            edges: deduped,
        }
    }

    pub fn nodes(&self) -> &IndexSet<NodeId> {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

/// Derived indices over a [`Graph`]: adjacency, sources/forks/joins, ancestor
/// and descendant closures, and a Kahn-style topological layering.
///
/// Built once per graph (or once per diamond sub-DAG, via [`GraphIndices::restrict_to`])
/// and treated as read-only thereafter.
#[derive(Clone, Debug, Default)]
pub struct GraphIndices {
    pub outgoing: IndexMap<NodeId, IndexSet<NodeId>>,
    pub incoming: IndexMap<NodeId, IndexSet<NodeId>>,
    pub sources: IndexSet<NodeId>,
    pub forks: IndexSet<NodeId>,
    pub joins: IndexSet<NodeId>,
    pub ancestors: IndexMap<NodeId, IndexSet<NodeId>>,
    pub descendants: IndexMap<NodeId, IndexSet<NodeId>>,
    pub iteration_sets: Vec<IndexSet<NodeId>>,
    /// node -> index into `iteration_sets`; convenience inverse of the layering.
    pub layer_of: IndexMap<NodeId, usize>,
}

/// Return the elements of `set` in ascending node-ID order.
///
/// Used everywhere the algorithm needs a reproducible iteration order for
/// floating-point accumulation (see the Determinism requirement in
/// `propagate`), since `IndexSet` otherwise iterates in insertion order.
pub fn sorted(set: &IndexSet<NodeId>) -> Vec<NodeId> {
    let mut v: Vec<NodeId> = set.iter().copied().collect();
    v.sort_unstable();
    v
}

impl GraphIndices {
    pub fn build(graph: &Graph) -> Result<Self, CoreError> {
        let mut outgoing: IndexMap<NodeId, IndexSet<NodeId>> = IndexMap::new();
        let mut incoming: IndexMap<NodeId, IndexSet<NodeId>> = IndexMap::new();

        for &node in graph.nodes() {
            outgoing.entry(node).or_default();
            incoming.entry(node).or_default();
        }

        for edge in graph.edges() {
            if edge.source == edge.target {
                return Err(CoreError::InvalidInputCycle);
            }
            outgoing.entry(edge.source).or_default().insert(edge.target);
            incoming.entry(edge.target).or_default().insert(edge.source);
        }

        let sources: IndexSet<NodeId> = sorted(graph.nodes())
            .into_iter()
            .filter(|n| incoming.get(n).is_none_or(IndexSet::is_empty))
            .collect();
        let forks: IndexSet<NodeId> = sorted(graph.nodes())
            .into_iter()
            .filter(|n| outgoing.get(n).is_some_and(|s| s.len() > 1))
            .collect();
        let joins: IndexSet<NodeId> = sorted(graph.nodes())
            .into_iter()
            .filter(|n| incoming.get(n).is_some_and(|s| s.len() > 1))
            .collect();

        let iteration_sets = topological_layers(graph, &incoming, &outgoing, &sources)?;
        let mut layer_of = IndexMap::new();
        for (level, layer) in iteration_sets.iter().enumerate() {
            for &node in layer {
                layer_of.insert(node, level);
            }
        }

        let ancestors = compute_ancestors(&iteration_sets, &incoming);
        let descendants = compute_descendants(&iteration_sets, &outgoing);

        tracing::debug!(
            nodes = graph.nodes().len(),
            forks = forks.len(),
            joins = joins.len(),
            layers = iteration_sets.len(),
            "built graph indices"
        );

        Ok(Self {
            outgoing,
            incoming,
            sources,
            forks,
            joins,
            ancestors,
            descendants,
            iteration_sets,
            layer_of,
        })
    }

    /// Build fresh indices for the induced subgraph on `keep` (both edge
    /// endpoints must lie in `keep`). Used by the diamond storage builder to
    /// compute sub-indices restricted to a diamond's `relevant_nodes`.
    pub fn restrict_to(graph: &Graph, keep: &IndexSet<NodeId>) -> Result<(Graph, Self), CoreError> {
        let induced_edges: Vec<Edge> = graph
            .edges()
            .iter()
            .filter(|e| keep.contains(&e.source) && keep.contains(&e.target))
            .copied()
            .collect();
        let sub_graph = Graph::from_edges(induced_edges, keep.iter().copied());
        let indices = Self::build(&sub_graph)?;
        Ok((sub_graph, indices))
    }

    pub fn parents(&self, n: NodeId) -> Option<&IndexSet<NodeId>> {
        self.incoming.get(&n)
    }

    pub fn children(&self, n: NodeId) -> Option<&IndexSet<NodeId>> {
        self.outgoing.get(&n)
    }

    pub fn ancestors_of(&self, n: NodeId) -> IndexSet<NodeId> {
        self.ancestors.get(&n).cloned().unwrap_or_default()
    }

    pub fn descendants_of(&self, n: NodeId) -> IndexSet<NodeId> {
        self.descendants.get(&n).cloned().unwrap_or_default()
    }

    pub fn level_of(&self, n: NodeId) -> usize {
        self.layer_of.get(&n).copied().unwrap_or(0)
    }
}

/// Kahn's algorithm: layer 0 is the sources, layer k+1 is every node all of
/// whose parents lie in layers <= k. A node that never gains all of its
/// parents indicates a cycle.
fn topological_layers(
    graph: &Graph,
    incoming: &IndexMap<NodeId, IndexSet<NodeId>>,
    outgoing: &IndexMap<NodeId, IndexSet<NodeId>>,
    sources: &IndexSet<NodeId>,
) -> Result<Vec<IndexSet<NodeId>>, CoreError> {
    let mut remaining: IndexMap<NodeId, usize> = incoming
        .iter()
        .map(|(&n, parents)| (n, parents.len()))
        .collect();

    let mut layers = Vec::new();
    let mut frontier: Vec<NodeId> = sorted(sources);
    let mut assigned = 0usize;

    while !frontier.is_empty() {
        let layer: IndexSet<NodeId> = frontier.iter().copied().collect();
        assigned += layer.len();

        let mut next: IndexSet<NodeId> = IndexSet::new();
        for &node in &frontier {
            if let Some(children) = outgoing.get(&node) {
                for &child in children {
                    let count = remaining.get_mut(&child).expect("child has an entry");
                    *count -= 1;
                    if *count == 0 {
                        next.insert(child);
                    }
                }
            }
        }
        layers.push(layer);
        frontier = sorted(&next);
    }

    if assigned != graph.nodes().len() {
        tracing::error!(assigned, total = graph.nodes().len(), "edge list is not a DAG");
        return Err(CoreError::InvalidInputCycle);
    }

    Ok(layers)
}

fn compute_ancestors(
    iteration_sets: &[IndexSet<NodeId>],
    incoming: &IndexMap<NodeId, IndexSet<NodeId>>,
) -> IndexMap<NodeId, IndexSet<NodeId>> {
    let mut ancestors: IndexMap<NodeId, IndexSet<NodeId>> = IndexMap::new();
    for layer in iteration_sets {
        for &node in layer {
            let mut acc = IndexSet::new();
            if let Some(parents) = incoming.get(&node) {
                for &parent in parents {
                    acc.insert(parent);
                    if let Some(parent_ancestors) = ancestors.get(&parent) {
                        acc.extend(parent_ancestors.iter().copied());
                    }
                }
            }
            ancestors.insert(node, acc);
        }
    }
    ancestors
}

fn compute_descendants(
    iteration_sets: &[IndexSet<NodeId>],
    outgoing: &IndexMap<NodeId, IndexSet<NodeId>>,
) -> IndexMap<NodeId, IndexSet<NodeId>> {
    let mut descendants: IndexMap<NodeId, IndexSet<NodeId>> = IndexMap::new();
    for layer in iteration_sets.iter().rev() {
        for &node in layer {
            let mut acc = IndexSet::new();
            if let Some(children) = outgoing.get(&node) {
                for &child in children {
                    acc.insert(child);
                    if let Some(child_descendants) = descendants.get(&child) {
                        acc.extend(child_descendants.iter().copied());
                    }
                }
            }
            descendants.insert(node, acc);
        }
    }
    descendants
}
