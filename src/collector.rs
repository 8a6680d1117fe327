//! Cycle collection between the host heap and an embedded VM.
//!
//! Notation: the "outside" is the host heap, whose objects are `Gc`
//! references; the "inside" is the embedded VM, whose objects live
//! behind opaque [`InnerId`]s and are reached from the outside only
//! through the indirection table. Neither collector can trace into the
//! other's objects, so a reference cycle that crosses the boundary is
//! invisible to both and would leak forever.
//!
//! This collector assumes cross-heap links are rare: most collection
//! inside the embedded VM stays internal, and the outside heap never
//! sees inner objects at all. Every boundary crossing pays a little
//! bookkeeping here in exchange, and a collection pass can then retire
//! whatever cycles have accumulated, so a long-running program does
//! not leak.
//!
//! A pass works by trial mirroring. The inner VM snapshots the objects
//! that only cross-heap roots keep alive; the collector rebuilds that
//! subgraph as host-side mirror nodes, hangs them off the anchors that
//! outside objects hold, and relaxes its own strong holds on the
//! mirrored objects' targets. The host tracer then sees the complete
//! candidate cycle and settles reachability on its own schedule; dead
//! mirrors are detected during the finalization step of the next full
//! collection, exactly the way the host embedder already drives one
//! (`mark_all`, then `finalize`, then `collect_all`).

use crate::{
    error::{CycleError, GraphError, TableError},
    graph::{self, SerializedEdge},
    ids::{InnerId, TableIndex},
    sets::{GcRootSet, IdSet, IterableWeakSet, RefCountedSet},
    table::{VecTable, WeakSlot, WeakTableManager},
    vm::InnerVm,
};
use gc_arena::{Collect, Collection, Finalization, Gc, GcWeak, Mutation};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Host-side anchor for a reference into the inner VM.
///
/// An outside object that holds inner references keeps one of these in
/// its traced fields. Outside a pass the anchor traces nothing; during
/// a pass the collector hangs mirror nodes off it, so a host root that
/// reaches the anchor also reaches the mirrored subgraph.
pub struct InboundAnchor<'gc, T: Collect + 'gc> {
    mirrors: RefCell<Vec<Gc<'gc, Mirror<'gc, T>>>>,
}

impl<'gc, T: Collect + 'gc> InboundAnchor<'gc, T> {
    pub fn new(mc: &Mutation<'gc>) -> Gc<'gc, Self> {
        Gc::new(
            mc,
            Self {
                mirrors: RefCell::new(Vec::new()),
            },
        )
    }
}

unsafe impl<'gc, T: Collect + 'gc> Collect for InboundAnchor<'gc, T> {
    fn trace(&self, cc: &Collection) {
        for mirror in self.mirrors.borrow().iter() {
            mirror.trace(cc);
        }
    }
}

/// Transient stand-in for one inner object during a pass: its identity
/// plus its decoded edges, expressed as ordinary host references.
pub struct Mirror<'gc, T: Collect + 'gc> {
    id: InnerId,
    edges: RefCell<Vec<MirrorEdge<'gc, T>>>,
}

impl<'gc, T: Collect + 'gc> Mirror<'gc, T> {
    pub fn id(&self) -> InnerId {
        self.id
    }
}

enum MirrorEdge<'gc, T: Collect + 'gc> {
    Inner(Gc<'gc, Mirror<'gc, T>>),
    Outer(Gc<'gc, T>),
}

unsafe impl<'gc, T: Collect + 'gc> Collect for Mirror<'gc, T> {
    fn trace(&self, cc: &Collection) {
        for edge in self.edges.borrow().iter() {
            match edge {
                MirrorEdge::Inner(mirror) => mirror.trace(cc),
                MirrorEdge::Outer(obj) => obj.trace(cc),
            }
        }
    }
}

struct IncomingEntry<'gc, T: Collect + 'gc> {
    anchor: GcWeak<'gc, InboundAnchor<'gc, T>>,
    targets: RefCountedSet<IdSet<InnerId>>,
}

struct ActivePass<'gc, T: Collect + 'gc> {
    /// One mirror per suspect object. Deliberately untraced: whether a
    /// mirror survives is exactly what the host trace is being asked
    /// to decide.
    watched: Vec<(InnerId, Gc<'gc, Mirror<'gc, T>>)>,
    /// Anchors that received mirror attachments, also untraced; dead
    /// ones are skipped at completion.
    attached: Vec<Gc<'gc, InboundAnchor<'gc, T>>>,
    /// Strong-hold keys relaxed for the duration of the pass.
    relaxed: Vec<usize>,
}

/// What starting a pass set up, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub mirrored: usize,
    pub relaxed_holds: usize,
}

/// Tracks every link crossing the heap boundary and, on demand, runs
/// trial-mirroring passes over the suspects.
///
/// All state sits behind `RefCell`s so the embedder can reach the
/// collector from anywhere in its root, including the finalization
/// callback of a collection.
pub struct CycleCollector<'gc, T: Collect + 'gc> {
    table: RefCell<WeakTableManager<'gc, T>>,
    outside_roots: RefCell<RefCountedSet<GcRootSet<'gc, T>>>,
    inside_roots: RefCell<RefCountedSet<IdSet<InnerId>>>,
    outgoing: RefCell<HashMap<InnerId, RefCountedSet<IdSet<TableIndex>>>>,
    incoming: RefCell<HashMap<usize, IncomingEntry<'gc, T>>>,
    incoming_origins: RefCell<RefCountedSet<IterableWeakSet<'gc, InboundAnchor<'gc, T>>>>,
    pass: RefCell<Option<ActivePass<'gc, T>>>,
}

impl<'gc, T: Collect + 'gc> CycleCollector<'gc, T> {
    /// `table_start` is the first indirection-table index the
    /// collector may hand out; lower slots belong to the embedder.
    pub fn new(table_start: u32) -> Self {
        Self::with_table(VecTable::new(), table_start)
    }

    pub fn with_table(storage: VecTable<WeakSlot<'gc, T>>, table_start: u32) -> Self {
        Self {
            table: RefCell::new(WeakTableManager::new(storage, table_start)),
            outside_roots: RefCell::new(RefCountedSet::default()),
            inside_roots: RefCell::new(RefCountedSet::default()),
            outgoing: RefCell::new(HashMap::new()),
            incoming: RefCell::new(HashMap::new()),
            incoming_origins: RefCell::new(RefCountedSet::default()),
            pass: RefCell::new(None),
        }
    }

    /// Records that inner object `inner` references outside object
    /// `outside`, and returns the table index standing in for the
    /// target. An object may hold several links to the same place
    /// (an array with one reference at two indexes, say); each call
    /// must eventually be matched by one
    /// [`dec_outgoing_link`](Self::dec_outgoing_link).
    pub fn inc_outgoing_link(
        &self,
        inner: InnerId,
        outside: Gc<'gc, T>,
    ) -> Result<TableIndex, TableError> {
        // Table registration first, so a growth failure leaves no
        // partial bookkeeping behind.
        let index = self.table.borrow_mut().inc(outside)?;
        let key = Gc::as_ptr(outside) as usize;
        {
            let mut roots = self.outside_roots.borrow_mut();
            roots.inc(outside);
            // A link taken mid-pass re-pins a hold the pass may have
            // relaxed.
            roots.backing().restore(key);
        }
        self.outgoing
            .borrow_mut()
            .entry(inner)
            .or_default()
            .inc(index);
        trace!(%inner, %index, "outgoing link registered");
        Ok(index)
    }

    /// Exact inverse of [`inc_outgoing_link`](Self::inc_outgoing_link);
    /// releases the link refcount, the table registration, and the
    /// strong hold together. Panics on an unmatched release.
    pub fn dec_outgoing_link(&self, inner: InnerId, outside: Gc<'gc, T>) {
        let key = Gc::as_ptr(outside) as usize;
        let index = self
            .table
            .borrow()
            .index_of(key)
            .unwrap_or_else(|| panic!("object has no table slot to release for {inner}"));
        {
            let mut outgoing = self.outgoing.borrow_mut();
            let links = outgoing
                .get_mut(&inner)
                .unwrap_or_else(|| panic!("{inner} has no outgoing links"));
            links.dec_key(index);
            if links.is_empty() {
                outgoing.remove(&inner);
            }
        }
        self.table.borrow_mut().dec(key);
        self.outside_roots.borrow_mut().dec_key(key);
        trace!(%inner, %index, "outgoing link released");
    }

    /// Records that the outside, through `anchor`, references inner
    /// object `inner`. The first link to an inner object installs a
    /// root for it in the inner heap; later links just count.
    pub fn inc_incoming_link<V: InnerVm + ?Sized>(
        &self,
        vm: &mut V,
        anchor: Gc<'gc, InboundAnchor<'gc, T>>,
        inner: InnerId,
    ) {
        let key = Gc::as_ptr(anchor) as usize;
        {
            let mut incoming = self.incoming.borrow_mut();
            let entry = incoming.entry(key).or_insert_with(|| IncomingEntry {
                anchor: Gc::downgrade(anchor),
                targets: RefCountedSet::default(),
            });
            // Refresh the handle: a row left behind by a dead anchor
            // can be revived by an address reuse, and the stale weak
            // would quietly drop every future attachment.
            entry.anchor = Gc::downgrade(anchor);
            entry.targets.inc(inner);
        }
        self.incoming_origins.borrow_mut().inc(anchor);
        if self.inside_roots.borrow_mut().inc(inner) {
            trace!(%inner, "installing inner root");
            vm.add_root(inner);
        }
    }

    /// Exact inverse of [`inc_incoming_link`](Self::inc_incoming_link).
    /// The last release for an inner object removes its inner root.
    pub fn dec_incoming_link<V: InnerVm + ?Sized>(
        &self,
        vm: &mut V,
        anchor: Gc<'gc, InboundAnchor<'gc, T>>,
        inner: InnerId,
    ) {
        let key = Gc::as_ptr(anchor) as usize;
        let emptied = {
            let mut incoming = self.incoming.borrow_mut();
            let entry = incoming
                .get_mut(&key)
                .unwrap_or_else(|| panic!("anchor has no incoming links for {inner}"));
            entry.targets.dec(&inner);
            entry.targets.is_empty()
        };
        if self.incoming_origins.borrow_mut().dec(&anchor) {
            debug_assert!(emptied);
            self.incoming.borrow_mut().remove(&key);
        }
        if self.inside_roots.borrow_mut().dec_key(inner) {
            trace!(%inner, "removing inner root");
            vm.delete_root(inner);
        }
    }

    /// Resolves a table index to its outside object. `None` means the
    /// referent is gone and the link is moot.
    pub fn get_from_table(&self, index: TableIndex, mc: &Mutation<'gc>) -> Option<Gc<'gc, T>> {
        self.table.borrow().get_original(index, mc)
    }

    /// Inner objects currently rooted because of incoming links, in
    /// ascending order. This is the query handed to the adapter when a
    /// pass begins.
    pub fn inside_root_ids(&self) -> Vec<InnerId> {
        let mut ids: Vec<InnerId> = self.inside_roots.borrow().keys().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_inside_root(&self, inner: InnerId) -> bool {
        self.inside_roots.borrow().has_key(inner)
    }

    pub fn holds_outside_root(&self, outside: Gc<'gc, T>) -> bool {
        self.outside_roots
            .borrow()
            .has_key(Gc::as_ptr(outside) as usize)
    }

    /// Total outstanding outgoing-link increments for an inner object.
    pub fn outgoing_link_count(&self, inner: InnerId) -> usize {
        self.outgoing
            .borrow()
            .get(&inner)
            .map(|links| links.entries().map(|(_, n)| n).sum())
            .unwrap_or(0)
    }

    /// Number of occupied indirection-table slots.
    pub fn live_table_entries(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn has_active_pass(&self) -> bool {
        self.pass.borrow().is_some()
    }

    /// Asks the adapter for a snapshot of the current suspects and
    /// starts a pass over it.
    pub fn collect_cycles<V: InnerVm + ?Sized>(
        &self,
        mc: &Mutation<'gc>,
        vm: &mut V,
    ) -> Result<PassStats, CycleError> {
        let roots = self.inside_root_ids();
        let words = vm.serialize(&roots);
        self.start_cycle_collection(mc, &words)
    }

    /// Begins one collection pass over an already-serialized snapshot.
    ///
    /// Returns immediately once the mirrors are in place; the verdict
    /// arrives through [`finalize_pass`](Self::finalize_pass). Until
    /// the pass completes, every host collection must run that hook
    /// during its finalization step. Panics if a pass is already
    /// outstanding.
    pub fn start_cycle_collection(
        &self,
        mc: &Mutation<'gc>,
        words: &[u64],
    ) -> Result<PassStats, CycleError> {
        assert!(
            self.pass.borrow().is_none(),
            "cycle collection already in progress"
        );
        let objects = graph::decode(words)?;

        // Anchors whose referents died of ordinary causes contribute
        // nothing below; drop their slots while we can still upgrade.
        self.incoming_origins.borrow_mut().backing_mut().prune(mc);

        // One mirror per serialized object; edges are filled in a
        // second sweep so internal references resolve in any order.
        let mut mirrors: HashMap<InnerId, Gc<'gc, Mirror<'gc, T>>> = HashMap::new();
        for obj in &objects {
            mirrors.insert(
                obj.id,
                Gc::new(
                    mc,
                    Mirror {
                        id: obj.id,
                        edges: RefCell::new(Vec::new()),
                    },
                ),
            );
        }
        {
            let table = self.table.borrow();
            for obj in &objects {
                let mirror = &mirrors[&obj.id];
                let mut edges = mirror.edges.borrow_mut();
                for edge in &obj.edges {
                    match edge {
                        SerializedEdge::Internal(id) => {
                            // decode() already proved the target is in
                            // the snapshot.
                            edges.push(MirrorEdge::Inner(mirrors[id]));
                        }
                        SerializedEdge::External(index) => {
                            if !table.is_occupied(*index) {
                                return Err(GraphError::UnallocatedTableIndex(*index).into());
                            }
                            // A dead referent means the link is already
                            // moot; the edge is dropped.
                            if let Some(target) = table.get_original(*index, mc) {
                                edges.push(MirrorEdge::Outer(target));
                            }
                        }
                    }
                }
            }
        }

        // Hang mirrors off the live anchors referencing them, so a
        // host root reaching an anchor reaches the mirrored subgraph.
        let mut attached = Vec::new();
        for entry in self.incoming.borrow().values() {
            let Some(anchor) = entry.anchor.upgrade(mc) else {
                continue;
            };
            let mut hung = false;
            for (id, _) in entry.targets.entries() {
                if let Some(mirror) = mirrors.get(&id) {
                    anchor.mirrors.borrow_mut().push(*mirror);
                    hung = true;
                }
            }
            if hung {
                attached.push(anchor);
            }
        }

        // Relax exactly the strong holds owed entirely to mirrored
        // objects; a hold shared with any unmirrored linker keeps
        // owning.
        let mut suspect_counts: HashMap<usize, usize> = HashMap::new();
        {
            let table = self.table.borrow();
            let outgoing = self.outgoing.borrow();
            for id in mirrors.keys() {
                let Some(links) = outgoing.get(id) else {
                    continue;
                };
                for (index, count) in links.entries() {
                    if let Some(key) = table.key_at(index) {
                        *suspect_counts.entry(key).or_insert(0) += count;
                    }
                }
            }
        }
        let mut relaxed = Vec::new();
        {
            let roots = self.outside_roots.borrow();
            for (&key, &count) in &suspect_counts {
                debug_assert!(roots.count_of(key) >= count);
                if roots.count_of(key) == count {
                    roots.backing().relax(key);
                    relaxed.push(key);
                }
            }
        }

        let stats = PassStats {
            mirrored: mirrors.len(),
            relaxed_holds: relaxed.len(),
        };
        let watched = objects.iter().map(|obj| (obj.id, mirrors[&obj.id])).collect();
        *self.pass.borrow_mut() = Some(ActivePass {
            watched,
            attached,
            relaxed,
        });
        debug!(
            mirrored = stats.mirrored,
            relaxed = stats.relaxed_holds,
            "cycle collection pass started"
        );
        Ok(stats)
    }

    /// Settles the outstanding pass, if any, against the verdict of the
    /// host trace. Run inside the finalization step of a collection,
    /// after marking:
    ///
    /// ```ignore
    /// let mut marked = None;
    /// while marked.is_none() {
    ///     marked = arena.mark_all();
    /// }
    /// if let Some(marked) = marked {
    ///     marked.finalize(|fc, root| root.collector.finalize_pass(fc, &mut vm));
    /// }
    /// arena.collect_all();
    /// ```
    ///
    /// Mirrors the trace did not reach belong to genuine cross-heap
    /// cycles: their inner objects' links are torn down and the VM is
    /// notified to free them. Surviving mirrors are detached and their
    /// targets' holds re-pinned; those links stay for a later pass.
    /// With no pass outstanding this is a no-op, so it is safe to run
    /// unconditionally on every collection.
    pub fn finalize_pass<V: InnerVm + ?Sized>(&self, fc: &Finalization<'gc>, vm: &mut V) {
        let Some(pass) = self.pass.borrow_mut().take() else {
            return;
        };

        let mut reclaimed = 0usize;
        let mut surviving = 0usize;
        for (id, mirror) in &pass.watched {
            if Gc::is_dead(fc, *mirror) {
                self.release_inner(*id, vm);
                reclaimed += 1;
            } else {
                surviving += 1;
            }
        }

        // Surviving relaxed holds go back to owning strength; released
        // ones are gone from the set already.
        {
            let roots = self.outside_roots.borrow();
            for key in &pass.relaxed {
                roots.backing().restore(*key);
            }
        }

        // Detach mirrors from surviving anchors so this pass's mirrors
        // die with it; dead anchors are the sweep's problem.
        for anchor in &pass.attached {
            if !Gc::is_dead(fc, *anchor) {
                anchor.mirrors.borrow_mut().clear();
            }
        }

        debug!(reclaimed, surviving, "cycle collection pass complete");
    }

    /// Tears down every trace of a collected inner object: its
    /// outgoing links with their slots and holds, the incoming rows
    /// targeting it, and its inner root. Ends with the release
    /// notification to the VM.
    fn release_inner<V: InnerVm + ?Sized>(&self, id: InnerId, vm: &mut V) {
        trace!(%id, "releasing inner object proven unreachable");

        if let Some(links) = self.outgoing.borrow_mut().remove(&id) {
            let mut table = self.table.borrow_mut();
            let mut roots = self.outside_roots.borrow_mut();
            for (index, count) in links.entries() {
                let key = table
                    .key_at(index)
                    .expect("occupied table slot for a live link");
                for _ in 0..count {
                    table.dec(key);
                    roots.dec_key(key);
                }
            }
        }

        {
            let mut incoming = self.incoming.borrow_mut();
            let mut origins = self.incoming_origins.borrow_mut();
            let mut inside = self.inside_roots.borrow_mut();
            let mut emptied = Vec::new();
            for (&anchor_key, entry) in incoming.iter_mut() {
                let n = entry.targets.count_of(id);
                for _ in 0..n {
                    entry.targets.dec_key(id);
                    origins.dec_key(anchor_key);
                    if inside.dec_key(id) {
                        vm.delete_root(id);
                    }
                }
                if entry.targets.is_empty() {
                    emptied.push(anchor_key);
                }
            }
            for key in emptied {
                incoming.remove(&key);
            }
        }

        vm.release_object(id);
    }
}

unsafe impl<'gc, T: Collect + 'gc> Collect for CycleCollector<'gc, T> {
    fn trace(&self, cc: &Collection) {
        self.table.borrow().trace(cc);
        self.outside_roots.borrow().trace(cc);
        for entry in self.incoming.borrow().values() {
            entry.anchor.trace(cc);
        }
        self.incoming_origins.borrow().trace(cc);
        // The active pass is deliberately absent: its mirrors and
        // attachment list must be reachable through real host roots or
        // not at all. inside_roots and outgoing hold only ids and
        // indices.
    }
}
