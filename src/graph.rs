//! Flat integer encoding of the inner VM's suspect subgraph.
//!
//! Grammar: `[object count] ([identifier] [edge count]
//! ([is_internal] [target])*)*`. An internal target is the identifier
//! of another object in the same snapshot; an external target is an
//! indirection-table index.

use crate::error::GraphError;
use crate::ids::{InnerId, TableIndex};
use std::collections::HashSet;

pub const EDGE_EXTERNAL: u64 = 0;
pub const EDGE_INTERNAL: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedObject {
    pub id: InnerId,
    pub edges: Vec<SerializedEdge>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializedEdge {
    /// Reference to another object in the same snapshot.
    Internal(InnerId),
    /// Reference through the indirection table to an outside object.
    External(TableIndex),
}

struct Reader<'a> {
    words: &'a [u64],
    pos: usize,
}

impl Reader<'_> {
    fn next(&mut self) -> Result<u64, GraphError> {
        let word = self
            .words
            .get(self.pos)
            .copied()
            .ok_or(GraphError::Truncated { at: self.pos })?;
        self.pos += 1;
        Ok(word)
    }
}

/// Decodes a snapshot, failing closed on anything malformed or
/// internally inconsistent.
pub fn decode(words: &[u64]) -> Result<Vec<SerializedObject>, GraphError> {
    let mut reader = Reader { words, pos: 0 };
    let count = reader.next()? as usize;

    let mut objects = Vec::new();
    let mut seen = HashSet::new();
    for _ in 0..count {
        let id = InnerId(reader.next()?);
        if !seen.insert(id) {
            return Err(GraphError::DuplicateObject(id));
        }
        let edge_count = reader.next()? as usize;
        let mut edges = Vec::new();
        for _ in 0..edge_count {
            let tag = reader.next()?;
            let target = reader.next()?;
            edges.push(match tag {
                EDGE_INTERNAL => SerializedEdge::Internal(InnerId(target)),
                EDGE_EXTERNAL => {
                    let index =
                        u32::try_from(target).map_err(|_| GraphError::IndexOutOfRange(target))?;
                    SerializedEdge::External(TableIndex(index))
                }
                other => return Err(GraphError::BadEdgeTag(other)),
            });
        }
        objects.push(SerializedObject { id, edges });
    }

    if reader.pos != words.len() {
        return Err(GraphError::TrailingData(words.len() - reader.pos));
    }

    // Internal edges must resolve within the snapshot itself.
    for obj in &objects {
        for edge in &obj.edges {
            if let SerializedEdge::Internal(target) = edge {
                if !seen.contains(target) {
                    return Err(GraphError::UnknownInternalTarget(*target));
                }
            }
        }
    }

    Ok(objects)
}

/// Produces the flat encoding `decode` accepts. Adapters building
/// snapshots on the inner side go through this.
pub fn encode(objects: &[SerializedObject]) -> Vec<u64> {
    let mut words = vec![objects.len() as u64];
    for obj in objects {
        words.push(obj.id.as_u64());
        words.push(obj.edges.len() as u64);
        for edge in &obj.edges {
            match edge {
                SerializedEdge::Internal(id) => {
                    words.push(EDGE_INTERNAL);
                    words.push(id.as_u64());
                }
                SerializedEdge::External(index) => {
                    words.push(EDGE_EXTERNAL);
                    words.push(index.as_u32() as u64);
                }
            }
        }
    }
    words
}
