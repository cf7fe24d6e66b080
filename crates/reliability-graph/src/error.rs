use std::fmt;

use crate::NodeId;

/// Structural errors raised by the graph index builder and the diamond
/// identifier's fixed-point loops.
///
/// These are the only errors the core engine raises; all of them are fatal
/// and abort the run (see the crate-level docs for the propagation policy).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoreError {
    /// The input edge list is not acyclic, or contains a self-loop.
    InvalidInputCycle,
    /// A probability value kind was constructed with a component outside `[0, 1]`,
    /// or with inverted interval/p-box bounds.
    InvalidInputBadProbability(String),
    /// A C3 fixed-point loop (sub-source closure or recursive completeness) did
    /// not converge within its iteration cap while identifying diamonds at this join.
    IterationLimitExceeded(NodeId),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInputCycle => {
                write!(f, "invalid input: edge list is not a DAG (cycle or self-loop)")
            }
            Self::InvalidInputBadProbability(detail) => {
                write!(f, "invalid input: bad probability value ({detail})")
            }
            Self::IterationLimitExceeded(join_node) => {
                write!(
                    f,
                    "iteration limit exceeded while identifying diamonds at join node {join_node}"
                )
            }
        }
    }
}

impl std::error::Error for CoreError {}
