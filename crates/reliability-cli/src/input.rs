use std::collections::BTreeMap;
use std::path::Path;

use eyre::WrapErr;
use indexmap::IndexMap;
use reliability_graph::{Edge, Graph, NodeId};
use reliability_value::Scalar;

/// Read a square 0/1 adjacency matrix from a CSV file (no header): row `i`,
/// column `j` is `1` iff there is an edge from node `i+1` to node `j+1`.
/// Node IDs are 1-based row/column positions, matching the collaborator's
/// CSV adjacency matrix format described in the engine's external
/// interfaces.
pub fn read_adjacency_matrix(path: &Path) -> eyre::Result<Graph> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .wrap_err_with(|| format!("failed to open adjacency matrix: {path:?}"))?;

    let mut edges = Vec::new();
    let mut isolated = Vec::new();
    for (row_index, record) in reader.records().enumerate() {
        let record = record.wrap_err("failed to read adjacency matrix row")?;
        let source = NodeId((row_index + 1) as u64);
        let mut has_any = false;
        for (col_index, cell) in record.iter().enumerate() {
            let flag: u8 = cell
                .trim()
                .parse()
                .wrap_err_with(|| format!("adjacency matrix cell ({row_index}, {col_index}) is not 0/1: {cell:?}"))?;
            if flag != 0 {
                let target = NodeId((col_index + 1) as u64);
                edges.push(Edge::new(source, target));
                has_any = true;
            }
        }
        if !has_any {
            isolated.push(source);
        }
    }
    Ok(Graph::from_edges(edges, isolated))
}

/// Read a `{"node_id": prior}` JSON dictionary. A missing file path means
/// every node has prior `one`, matching the engine's "empty map" contract.
pub fn read_priors_json(path: &Path) -> eyre::Result<IndexMap<NodeId, Scalar>> {
    let raw = std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read priors file: {path:?}"))?;
    let parsed: BTreeMap<String, f64> = serde_json::from_str(&raw).wrap_err("failed to parse priors JSON")?;

    parsed
        .into_iter()
        .map(|(key, value)| {
            let node = parse_node_id(&key)?;
            let scalar = Scalar::new(value).map_err(|e| eyre::eyre!("prior for node {node}: {e}"))?;
            Ok((node, scalar))
        })
        .collect()
}

/// Read a `{"source_id": {"target_id": prob}}` JSON dictionary of per-edge
/// transmission probabilities.
pub fn read_edge_probs_json(path: &Path) -> eyre::Result<IndexMap<Edge, Scalar>> {
    let raw = std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read edge probabilities file: {path:?}"))?;
    let parsed: BTreeMap<String, BTreeMap<String, f64>> =
        serde_json::from_str(&raw).wrap_err("failed to parse edge probabilities JSON")?;

    let mut result = IndexMap::new();
    for (source_key, targets) in parsed {
        let source = parse_node_id(&source_key)?;
        for (target_key, value) in targets {
            let target = parse_node_id(&target_key)?;
            let scalar = Scalar::new(value).map_err(|e| eyre::eyre!("edge ({source}, {target}): {e}"))?;
            result.insert(Edge::new(source, target), scalar);
        }
    }
    Ok(result)
}

fn parse_node_id(key: &str) -> eyre::Result<NodeId> {
    key.trim()
        .parse::<u64>()
        .map(NodeId)
        .wrap_err_with(|| format!("invalid node ID key: {key:?}"))
}
