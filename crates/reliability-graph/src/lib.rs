mod error;
mod graph;
mod node;

pub use error::CoreError;
pub use graph::{sorted, Graph, GraphIndices};
pub use node::{Edge, NodeId};
