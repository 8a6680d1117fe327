//! Contract the collector consumes from the embedded VM.

use crate::ids::InnerId;

/// Adapter the inner VM implements so the collector can install roots,
/// snapshot suspect subgraphs, and deliver release notifications. The
/// collector calls these synchronously on the one thread driving both
/// heaps.
pub trait InnerVm {
    /// Installs a root for `id` in the inner heap. Called exactly once
    /// per 0→1 transition of the id's incoming refcount, never for
    /// later increments.
    fn add_root(&mut self, id: InnerId);

    /// Removes the root installed by [`add_root`](Self::add_root).
    /// Called exactly once per 1→0 transition.
    fn delete_root(&mut self, id: InnerId);

    /// Serializes the subgraph of inner objects that are kept alive
    /// only by the given cross-heap roots and themselves reach an
    /// outgoing link, in the flat encoding understood by
    /// [`graph::decode`](crate::graph::decode). The snapshot must be
    /// self-consistent at the moment it is produced.
    fn serialize(&mut self, roots: &[InnerId]) -> Vec<u64>;

    /// A collection pass has proven `id` unreachable. Its cross-heap
    /// bookkeeping is already torn down by the time this fires; the VM
    /// frees the object itself and must not release any links again.
    fn release_object(&mut self, id: InnerId);
}
