use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use indexmap::{IndexMap, IndexSet};
use reliability_graph::{Edge, GraphIndices, NodeId};
use reliability_value::Value;

/// A maximal diamond sub-DAG between one or more shared fork ancestors (the
/// conditioning nodes) and a join node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diamond {
    pub relevant_nodes: IndexSet<NodeId>,
    pub conditioning_nodes: IndexSet<NodeId>,
    /// Canonical (sorted, deduplicated) induced edge list.
    pub edgelist: Vec<Edge>,
}

impl Diamond {
    pub fn hash(&self) -> DiamondHash {
        diamond_hash(&self.edgelist, &self.conditioning_nodes)
    }
}

/// A diamond together with the join node it terminates at and the parents of
/// that join which are *not* influenced by any shared fork ancestor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiamondsAtNode {
    pub diamond: Diamond,
    pub non_diamond_parents: IndexSet<NodeId>,
    pub join_node: NodeId,
}

pub type DiamondHash = u64;

/// Content hash over `(edgelist, conditioning_nodes)`, canonicalised so that
/// structurally identical diamonds hash identically regardless of discovery
/// order. Uses `DefaultHasher::new()` directly (fixed, non-randomized keys)
/// rather than going through a `HashMap`'s `RandomState`, so the hash is
/// reproducible across processes and runs -- required for L1 determinism and
/// for the hybrid lookup table to be meaningfully content-addressed.
pub fn diamond_hash(edgelist: &[Edge], conditioning_nodes: &IndexSet<NodeId>) -> DiamondHash {
    let mut sorted_edges: Vec<Edge> = edgelist.to_vec();
    sorted_edges.sort_unstable();

    let mut sorted_conditioning: Vec<NodeId> = conditioning_nodes.iter().copied().collect();
    sorted_conditioning.sort_unstable();

    let mut hasher = DefaultHasher::new();
    sorted_edges.hash(&mut hasher);
    sorted_conditioning.hash(&mut hasher);
    hasher.finish()
}

/// A prepared sub-problem for one unique diamond: its own sub-indices, the
/// conditioned sub-priors, and the nested diamonds found within it.
#[derive(Clone, Debug)]
pub struct DiamondComputationData<V: Value> {
    pub diamond: Diamond,
    pub sub_indices: GraphIndices,
    pub sub_node_priors: IndexMap<NodeId, V>,
    /// Nested `DiamondsAtNode` entries, keyed by the join node they terminate
    /// at, found within this diamond's sub-DAG.
    pub nested_diamonds: IndexMap<NodeId, Vec<DiamondsAtNode>>,
}

/// `Map<DiamondHash, DiamondComputationData>`, the output of C4.
pub type UniqueDiamondStorage<V> = IndexMap<DiamondHash, DiamondComputationData<V>>;
