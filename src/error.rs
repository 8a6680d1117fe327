use crate::ids::{InnerId, TableIndex};
use thiserror::Error;

/// Failures growing the indirection table. These are resource
/// exhaustion, not usage bugs, and propagate to the caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TableError {
    #[error("table limit of {limit} slots exceeded")]
    LimitExceeded { limit: usize },

    #[error("table storage allocation failed")]
    AllocationFailed,
}

/// Malformed or inconsistent serialized-graph input. A snapshot the
/// inner VM hands over is trusted to be self-consistent; anything that
/// fails these checks aborts the pass before any state changes.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error("encoding ends early at word {at}")]
    Truncated { at: usize },

    #[error("{0} trailing words after the last object")]
    TrailingData(usize),

    #[error("edge tag must be 0 or 1, got {0}")]
    BadEdgeTag(u64),

    #[error("object {0} serialized twice")]
    DuplicateObject(InnerId),

    #[error("internal edge to {0}, which is not in the snapshot")]
    UnknownInternalTarget(InnerId),

    #[error("external edge target {0} exceeds the table index range")]
    IndexOutOfRange(u64),

    #[error("external edge to unallocated table slot {0}")]
    UnallocatedTableIndex(TableIndex),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CycleError {
    #[error("malformed cycle graph: {0}")]
    Graph(#[from] GraphError),

    #[error("table failure: {0}")]
    Table(#[from] TableError),
}
