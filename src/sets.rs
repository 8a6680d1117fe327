//! Refcounted-set building blocks for cross-heap link bookkeeping.

use crate::ids::{InnerId, TableIndex};
use gc_arena::{Collect, Collection, Gc, GcWeak, Mutation};
use std::{
    cell::Cell,
    collections::{hash_map::Entry, HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
    marker::PhantomData,
};

/// Items addressable by a small copyable key. `Gc` pointers key by
/// their address; ids and indices key by themselves.
pub trait Keyed {
    type Key: Copy + Eq + Hash + Debug + 'static;

    fn key(&self) -> Self::Key;
}

pub type KeyOf<I> = <I as Keyed>::Key;

impl<'gc, T: 'gc> Keyed for Gc<'gc, T> {
    type Key = usize;

    fn key(&self) -> usize {
        Gc::as_ptr(*self) as usize
    }
}

impl Keyed for InnerId {
    type Key = Self;

    fn key(&self) -> Self {
        *self
    }
}

impl Keyed for TableIndex {
    type Key = Self;

    fn key(&self) -> Self {
        *self
    }
}

/// A set-like container that [`RefCountedSet`] can drive. Insertion
/// takes the item; removal goes by key, so a backing is free to hold
/// its items weakly, or not at all.
pub trait LinkSet {
    type Item: Keyed;

    fn insert(&mut self, item: Self::Item);
    fn remove(&mut self, key: KeyOf<Self::Item>);
}

/// Wraps an arbitrary set-like container, translating `inc`/`dec`
/// calls into an add on the first increment and a delete on the final
/// decrement back to zero.
pub struct RefCountedSet<S: LinkSet> {
    set: S,
    counts: HashMap<KeyOf<S::Item>, usize>,
}

impl<S: LinkSet + Default> Default for RefCountedSet<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: LinkSet> RefCountedSet<S> {
    pub fn new(set: S) -> Self {
        Self {
            set,
            counts: HashMap::new(),
        }
    }

    /// Increments the refcount for an item. Returns true if this call
    /// added it now.
    pub fn inc(&mut self, item: S::Item) -> bool {
        match self.counts.entry(item.key()) {
            Entry::Occupied(mut e) => {
                *e.get_mut() += 1;
                false
            }
            Entry::Vacant(e) => {
                e.insert(1);
                self.set.insert(item);
                true
            }
        }
    }

    /// Decrements the refcount for an item. Returns true if this call
    /// removed it now.
    ///
    /// Decrementing an untracked item means some caller released a
    /// reference it never took; that is a bookkeeping bug, not a
    /// runtime condition, and panics.
    pub fn dec(&mut self, item: &S::Item) -> bool {
        self.dec_key(item.key())
    }

    pub fn dec_key(&mut self, key: KeyOf<S::Item>) -> bool {
        let count = self
            .counts
            .get_mut(&key)
            .unwrap_or_else(|| panic!("refcount underflow: {key:?} is not tracked"));
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&key);
            self.set.remove(key);
            true
        } else {
            false
        }
    }

    pub fn has(&self, item: &S::Item) -> bool {
        self.has_key(item.key())
    }

    pub fn has_key(&self, key: KeyOf<S::Item>) -> bool {
        self.counts.contains_key(&key)
    }

    pub fn count_of(&self, key: KeyOf<S::Item>) -> usize {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = KeyOf<S::Item>> + '_ {
        self.counts.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (KeyOf<S::Item>, usize)> + '_ {
        self.counts.iter().map(|(k, n)| (*k, *n))
    }

    pub fn backing(&self) -> &S {
        &self.set
    }

    pub fn backing_mut(&mut self) -> &mut S {
        &mut self.set
    }
}

unsafe impl<S> Collect for RefCountedSet<S>
where
    S: LinkSet + Collect,
{
    fn trace(&self, cc: &Collection) {
        // Counts hold only copyable keys; the backing owns whatever
        // needs tracing.
        self.set.trace(cc);
    }
}

/// Plain strong backing for copyable ids and indices.
pub struct IdSet<I>(HashSet<I>);

impl<I> Default for IdSet<I> {
    fn default() -> Self {
        Self(HashSet::new())
    }
}

impl<I: Keyed<Key = I> + Eq + Hash> IdSet<I> {
    pub fn contains(&self, id: I) -> bool {
        self.0.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = I> + '_
    where
        I: Copy,
    {
        self.0.iter().copied()
    }
}

impl<I: Keyed<Key = I> + Eq + Hash> LinkSet for IdSet<I> {
    type Item = I;

    fn insert(&mut self, item: I) {
        self.0.insert(item);
    }

    fn remove(&mut self, key: I) {
        self.0.remove(&key);
    }
}

unsafe impl<I: Keyed<Key = I> + Eq + Hash> Collect for IdSet<I> {
    fn trace(&self, _cc: &Collection) {}
}

/// Backing with no storage of its own, for items that live elsewhere
/// (the table slots hold the actual values).
pub struct PhantomSet<V: Keyed>(PhantomData<fn(V)>);

impl<V: Keyed> Default for PhantomSet<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<V: Keyed> LinkSet for PhantomSet<V> {
    type Item = V;

    fn insert(&mut self, _item: V) {}

    fn remove(&mut self, _key: KeyOf<V>) {}
}

unsafe impl<V: Keyed> Collect for PhantomSet<V> {
    fn trace(&self, _cc: &Collection) {}
}

/// Strong root holds keyed by object address.
///
/// Entries marked relaxed are skipped during tracing, which turns the
/// hold non-owning for the duration of a collection pass while keeping
/// its refcount bookkeeping intact.
pub struct GcRootSet<'gc, T: 'gc> {
    entries: HashMap<usize, RootHold<'gc, T>>,
}

struct RootHold<'gc, T: 'gc> {
    obj: Gc<'gc, T>,
    relaxed: Cell<bool>,
}

impl<'gc, T: 'gc> Default for GcRootSet<'gc, T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<'gc, T: 'gc> GcRootSet<'gc, T> {
    pub fn get(&self, key: usize) -> Option<Gc<'gc, T>> {
        self.entries.get(&key).map(|hold| hold.obj)
    }

    pub fn relax(&self, key: usize) {
        if let Some(hold) = self.entries.get(&key) {
            hold.relaxed.set(true);
        }
    }

    /// Re-pins a relaxed hold. Harmless on holds that were never
    /// relaxed, or whose entry is already gone.
    pub fn restore(&self, key: usize) {
        if let Some(hold) = self.entries.get(&key) {
            hold.relaxed.set(false);
        }
    }

    pub fn is_relaxed(&self, key: usize) -> bool {
        self.entries
            .get(&key)
            .map(|hold| hold.relaxed.get())
            .unwrap_or(false)
    }
}

impl<'gc, T: 'gc> LinkSet for GcRootSet<'gc, T> {
    type Item = Gc<'gc, T>;

    fn insert(&mut self, item: Gc<'gc, T>) {
        self.entries.insert(
            item.key(),
            RootHold {
                obj: item,
                relaxed: Cell::new(false),
            },
        );
    }

    fn remove(&mut self, key: usize) {
        self.entries.remove(&key);
    }
}

unsafe impl<'gc, T: Collect + 'gc> Collect for GcRootSet<'gc, T> {
    fn trace(&self, cc: &Collection) {
        // Relaxed holds do not trace: the host tracer alone decides
        // whether their targets remain reachable.
        for hold in self.entries.values() {
            if !hold.relaxed.get() {
                hold.obj.trace(cc);
            }
        }
    }
}

/// A weakly-held set that stays iterable.
///
/// Weak containers cannot normally be walked, so alongside the
/// membership keys we keep an insertion-ordered list of weak handles.
/// Once the host collector reclaims a referent its slot upgrades to
/// nothing and is dropped by the next [`prune`](Self::prune); iteration
/// simply skips it in the meantime.
pub struct IterableWeakSet<'gc, T: 'gc> {
    slots: Vec<(usize, GcWeak<'gc, T>)>,
    members: HashSet<usize>,
}

impl<'gc, T: 'gc> Default for IterableWeakSet<'gc, T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            members: HashSet::new(),
        }
    }
}

impl<'gc, T: 'gc> IterableWeakSet<'gc, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `x` without preventing its reclamation. Re-adding
    /// always refreshes the weak handle: an address can outlive its
    /// first referent.
    pub fn add(&mut self, x: Gc<'gc, T>) {
        let key = Gc::as_ptr(x) as usize;
        self.members.insert(key);
        self.slots.retain(|(k, _)| *k != key);
        self.slots.push((key, Gc::downgrade(x)));
    }

    pub fn has(&self, x: Gc<'gc, T>) -> bool {
        self.has_key(Gc::as_ptr(x) as usize)
    }

    pub fn has_key(&self, key: usize) -> bool {
        self.members.contains(&key)
    }

    /// Removes `x` from iteration eagerly; its slot is dropped on the
    /// next prune.
    pub fn delete(&mut self, x: Gc<'gc, T>) {
        self.remove_key(Gc::as_ptr(x) as usize);
    }

    pub fn remove_key(&mut self, key: usize) {
        self.members.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Still-live members, in insertion order.
    pub fn iter<'a>(&'a self, mc: &'a Mutation<'gc>) -> impl Iterator<Item = Gc<'gc, T>> + 'a {
        self.slots
            .iter()
            .filter(|(key, _)| self.members.contains(key))
            .filter_map(move |(_, weak)| weak.upgrade(mc))
    }

    /// Drops slots whose referent is gone or which were deleted.
    pub fn prune(&mut self, mc: &Mutation<'gc>) {
        let members = &mut self.members;
        self.slots.retain(|(key, weak)| {
            if !members.contains(key) {
                return false;
            }
            if weak.upgrade(mc).is_none() {
                members.remove(key);
                false
            } else {
                true
            }
        });
    }
}

impl<'gc, T: 'gc> LinkSet for IterableWeakSet<'gc, T> {
    type Item = Gc<'gc, T>;

    fn insert(&mut self, item: Gc<'gc, T>) {
        self.add(item);
    }

    fn remove(&mut self, key: usize) {
        self.remove_key(key);
    }
}

unsafe impl<'gc, T: Collect + 'gc> Collect for IterableWeakSet<'gc, T> {
    fn trace(&self, cc: &Collection) {
        for (_, weak) in &self.slots {
            weak.trace(cc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gc_arena::{Arena, Rootable};

    #[test]
    fn membership_follows_net_count() {
        let mut set: RefCountedSet<IdSet<InnerId>> = RefCountedSet::default();
        let a = InnerId(1);

        assert!(set.inc(a));
        assert!(!set.inc(a));
        assert!(set.has(&a));
        assert_eq!(set.count_of(a), 2);

        assert!(!set.dec(&a));
        assert!(set.has(&a));
        assert!(set.dec(&a));
        assert!(!set.has(&a));
        assert!(set.is_empty());
    }

    #[test]
    fn first_inc_reaches_backing_once() {
        let mut set: RefCountedSet<IdSet<TableIndex>> = RefCountedSet::default();
        set.inc(TableIndex(3));
        set.inc(TableIndex(3));
        assert!(set.backing().contains(TableIndex(3)));
        set.dec_key(TableIndex(3));
        assert!(set.backing().contains(TableIndex(3)));
        set.dec_key(TableIndex(3));
        assert!(!set.backing().contains(TableIndex(3)));
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn dec_of_untracked_item_panics() {
        let mut set: RefCountedSet<IdSet<InnerId>> = RefCountedSet::default();
        set.dec(&InnerId(7));
    }

    #[test]
    #[should_panic(expected = "refcount underflow")]
    fn dec_past_zero_panics() {
        let mut set: RefCountedSet<IdSet<InnerId>> = RefCountedSet::default();
        set.inc(InnerId(7));
        set.dec(&InnerId(7));
        set.dec(&InnerId(7));
    }

    struct WeakSetRoot<'gc> {
        set: IterableWeakSet<'gc, u32>,
        keep: Vec<Gc<'gc, u32>>,
    }

    unsafe impl<'gc> Collect for WeakSetRoot<'gc> {
        fn trace(&self, cc: &Collection) {
            self.set.trace(cc);
            for obj in &self.keep {
                obj.trace(cc);
            }
        }
    }

    #[test]
    fn weak_set_prunes_reclaimed_entries() {
        let mut arena = Arena::<Rootable!['gc => WeakSetRoot<'gc>]>::new(|_mc| WeakSetRoot {
            set: IterableWeakSet::new(),
            keep: Vec::new(),
        });

        arena.mutate_root(|mc, root| {
            for value in [10u32, 20, 30] {
                let obj = Gc::new(mc, value);
                root.keep.push(obj);
                root.set.add(obj);
            }
            assert_eq!(root.set.len(), 3);
        });

        // Drop the middle object's only strong reference.
        arena.mutate_root(|_mc, root| {
            root.keep.remove(1);
        });
        arena.collect_all();

        arena.mutate_root(|mc, root| {
            let live: Vec<u32> = root.set.iter(mc).map(|obj| *obj).collect();
            assert_eq!(live, vec![10, 30]);

            root.set.prune(mc);
            assert_eq!(root.set.len(), 2);
        });
    }

    #[test]
    fn weak_set_delete_is_eager() {
        let mut arena = Arena::<Rootable!['gc => WeakSetRoot<'gc>]>::new(|_mc| WeakSetRoot {
            set: IterableWeakSet::new(),
            keep: Vec::new(),
        });

        arena.mutate_root(|mc, root| {
            let a = Gc::new(mc, 1u32);
            let b = Gc::new(mc, 2u32);
            root.keep.extend([a, b]);
            root.set.add(a);
            root.set.add(b);

            root.set.delete(a);
            assert!(!root.set.has(a));
            let live: Vec<u32> = root.set.iter(mc).map(|obj| *obj).collect();
            assert_eq!(live, vec![2]);

            // Re-adding after delete must not double up the slot.
            root.set.add(a);
            let live: Vec<u32> = root.set.iter(mc).map(|obj| *obj).collect();
            assert_eq!(live, vec![2, 1]);
        });
    }

    struct RootSetRoot<'gc> {
        roots: RefCountedSet<GcRootSet<'gc, u32>>,
        watch: Option<GcWeak<'gc, u32>>,
    }

    unsafe impl<'gc> Collect for RootSetRoot<'gc> {
        fn trace(&self, cc: &Collection) {
            self.roots.trace(cc);
            if let Some(weak) = &self.watch {
                weak.trace(cc);
            }
        }
    }

    #[test]
    fn relaxed_hold_stops_owning() {
        let mut arena = Arena::<Rootable!['gc => RootSetRoot<'gc>]>::new(|_mc| RootSetRoot {
            roots: RefCountedSet::default(),
            watch: None,
        });

        let key = arena.mutate_root(|mc, root| {
            let obj = Gc::new(mc, 99u32);
            root.watch = Some(Gc::downgrade(obj));
            root.roots.inc(obj);
            Gc::as_ptr(obj) as usize
        });

        // The hold is strong: the object survives collection.
        arena.collect_all();
        arena.mutate_root(|mc, root| {
            assert!(root.watch.unwrap().upgrade(mc).is_some());
            assert!(root.roots.backing().get(key).is_some());
            assert!(!root.roots.backing().is_relaxed(key));
            root.roots.backing().relax(key);
            assert!(root.roots.backing().is_relaxed(key));
        });

        // Relaxed, the hold no longer keeps it alive.
        arena.collect_all();
        arena.mutate_root(|mc, root| {
            assert!(root.watch.unwrap().upgrade(mc).is_none());
        });
    }
}
