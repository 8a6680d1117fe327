//! Reference-cycle collection across two independently collected
//! heaps: a host `gc-arena` heap on the outside and an embedded VM
//! with its own tracing collector on the inside, joined by a small
//! number of explicit cross-heap links.
//!
//! Outgoing links (inner object → outside object) are registered with
//! [`CycleCollector::inc_outgoing_link`], which hands back a stable
//! [`TableIndex`] the inner VM can store in its own memory as a plain
//! integer. Incoming links (outside object → inner object) go through
//! an [`InboundAnchor`] held in the outside object's traced fields and
//! install a root in the inner heap via the [`InnerVm`] adapter.
//! Cycles that span the boundary are retired by trial mirroring: see
//! the [`collector`] module.

pub mod collector;
pub mod error;
pub mod graph;
pub mod ids;
pub mod sets;
pub mod table;
pub mod vm;

pub use collector::{CycleCollector, InboundAnchor, Mirror, PassStats};
pub use error::{CycleError, GraphError, TableError};
pub use ids::{InnerId, TableIndex};
pub use vm::InnerVm;
