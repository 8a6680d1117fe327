//! The shared indirection table: stable index allocation with
//! refcount-gated slot lifetime.

use crate::{
    error::TableError,
    ids::TableIndex,
    sets::{KeyOf, Keyed, PhantomSet, RefCountedSet},
};
use gc_arena::{Collect, Collection, Gc, GcWeak, Mutation};
use std::collections::HashMap;

/// Storage contract for the table proper. The manager owns index
/// allocation; the storage only grows, reads, and writes slots.
pub trait TableStorage<V> {
    fn len(&self) -> usize;
    fn grow(&mut self, additional: usize) -> Result<(), TableError>;
    fn get(&self, index: TableIndex) -> Option<&V>;
    fn set(&mut self, index: TableIndex, value: Option<V>);
}

/// Growable vector-backed table with an optional slot limit.
pub struct VecTable<V> {
    slots: Vec<Option<V>>,
    limit: Option<usize>,
}

impl<V> VecTable<V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            limit: None,
        }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit: Some(limit),
        }
    }
}

impl<V> Default for VecTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TableStorage<V> for VecTable<V> {
    fn len(&self) -> usize {
        self.slots.len()
    }

    fn grow(&mut self, additional: usize) -> Result<(), TableError> {
        let new_len = self.slots.len() + additional;
        if let Some(limit) = self.limit {
            if new_len > limit {
                return Err(TableError::LimitExceeded { limit });
            }
        }
        self.slots
            .try_reserve(additional)
            .map_err(|_| TableError::AllocationFailed)?;
        self.slots.resize_with(new_len, || None);
        Ok(())
    }

    fn get(&self, index: TableIndex) -> Option<&V> {
        self.slots.get(index.as_usize()).and_then(|slot| slot.as_ref())
    }

    fn set(&mut self, index: TableIndex, value: Option<V>) {
        self.slots[index.as_usize()] = value;
    }
}

unsafe impl<V: Collect> Collect for VecTable<V> {
    fn trace(&self, cc: &Collection) {
        for slot in self.slots.iter().flatten() {
            slot.trace(cc);
        }
    }
}

/// Manages a table of values, handling reuse of indexes. Each tracked
/// value has a refcount and occupies its slot while the count stays
/// positive.
pub struct TableManager<V: Keyed + Copy, S: TableStorage<V>> {
    storage: S,
    /// How much of the table is in use, either actively or through the
    /// free list. Grows monotonically, never shrinks.
    top: u32,
    free: Vec<TableIndex>,
    tracked: RefCountedSet<PhantomSet<V>>,
    indexes: HashMap<KeyOf<V>, TableIndex>,
}

impl<V: Keyed + Copy, S: TableStorage<V>> TableManager<V, S> {
    /// `start_index` is the first index this manager may hand out;
    /// anything below it belongs to whoever else shares the table.
    pub fn new(storage: S, start_index: u32) -> Self {
        Self {
            storage,
            top: start_index,
            free: Vec::new(),
            tracked: RefCountedSet::default(),
            indexes: HashMap::new(),
        }
    }

    /// Increments the refcount for a value. Returns its table index,
    /// stable for as long as the count stays positive.
    pub fn inc(&mut self, value: V) -> Result<TableIndex, TableError> {
        let key = value.key();
        if let Some(&index) = self.indexes.get(&key) {
            self.tracked.inc(value);
            return Ok(index);
        }
        let index = self.alloc_index()?;
        self.tracked.inc(value);
        self.indexes.insert(key, index);
        self.storage.set(index, Some(value));
        Ok(index)
    }

    /// Decrements the refcount. On the final release the slot is
    /// cleared and its index recycled. Returns true if removed now.
    pub fn dec(&mut self, key: KeyOf<V>) -> bool {
        if !self.tracked.dec_key(key) {
            return false;
        }
        let index = self
            .indexes
            .remove(&key)
            .expect("tracked value has no table index");
        self.storage.set(index, None);
        self.free.push(index);
        true
    }

    pub fn get(&self, index: TableIndex) -> Option<&V> {
        self.storage.get(index)
    }

    pub fn index_of(&self, key: KeyOf<V>) -> Option<TableIndex> {
        self.indexes.get(&key).copied()
    }

    pub fn count_of(&self, key: KeyOf<V>) -> usize {
        self.tracked.count_of(key)
    }

    /// Number of currently occupied slots.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn high_water(&self) -> u32 {
        self.top
    }

    fn alloc_index(&mut self) -> Result<TableIndex, TableError> {
        if let Some(index) = self.free.pop() {
            return Ok(index);
        }
        let index = TableIndex(self.top);
        if self.storage.len() <= index.as_usize() {
            self.storage.grow(index.as_usize() - self.storage.len() + 1)?;
        }
        self.top += 1;
        Ok(index)
    }
}

unsafe impl<V, S> Collect for TableManager<V, S>
where
    V: Keyed + Copy + Collect,
    S: TableStorage<V> + Collect,
{
    fn trace(&self, cc: &Collection) {
        self.storage.trace(cc);
    }
}

/// What a weak table slot actually stores: the weak handle plus the
/// address key its object registered under, so releases can go by key
/// even after the referent has been reclaimed.
pub struct WeakSlot<'gc, T: 'gc> {
    key: usize,
    weak: GcWeak<'gc, T>,
}

impl<'gc, T: 'gc> Clone for WeakSlot<'gc, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'gc, T: 'gc> Copy for WeakSlot<'gc, T> {}

impl<'gc, T: 'gc> Keyed for WeakSlot<'gc, T> {
    type Key = usize;

    fn key(&self) -> usize {
        self.key
    }
}

unsafe impl<'gc, T: Collect + 'gc> Collect for WeakSlot<'gc, T> {
    fn trace(&self, cc: &Collection) {
        self.weak.trace(cc);
    }
}

/// Layers weak semantics over [`TableManager`]: the table stores weak
/// handles, kept unique per object, so each distinct object occupies a
/// single slot no matter how many registrations it accumulates.
pub struct WeakTableManager<'gc, T: Collect + 'gc> {
    parent: TableManager<WeakSlot<'gc, T>, VecTable<WeakSlot<'gc, T>>>,
    handles: HashMap<usize, GcWeak<'gc, T>>,
}

impl<'gc, T: Collect + 'gc> WeakTableManager<'gc, T> {
    pub fn new(storage: VecTable<WeakSlot<'gc, T>>, start_index: u32) -> Self {
        Self {
            parent: TableManager::new(storage, start_index),
            handles: HashMap::new(),
        }
    }

    pub fn inc(&mut self, obj: Gc<'gc, T>) -> Result<TableIndex, TableError> {
        let key = Gc::as_ptr(obj) as usize;
        let weak = *self
            .handles
            .entry(key)
            .or_insert_with(|| Gc::downgrade(obj));
        self.parent.inc(WeakSlot { key, weak })
    }

    pub fn dec(&mut self, key: usize) -> bool {
        let removed = self.parent.dec(key);
        if removed {
            self.handles.remove(&key);
        }
        removed
    }

    /// Dereferences the slot's handle. `None` means the referent is
    /// already gone; the link is moot, not broken.
    pub fn get_original(&self, index: TableIndex, mc: &Mutation<'gc>) -> Option<Gc<'gc, T>> {
        self.parent.get(index).and_then(|slot| slot.weak.upgrade(mc))
    }

    pub fn is_occupied(&self, index: TableIndex) -> bool {
        self.parent.get(index).is_some()
    }

    pub fn key_at(&self, index: TableIndex) -> Option<usize> {
        self.parent.get(index).map(|slot| slot.key)
    }

    pub fn index_of(&self, key: usize) -> Option<TableIndex> {
        self.parent.index_of(key)
    }

    pub fn count_of(&self, key: usize) -> usize {
        self.parent.count_of(key)
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }
}

unsafe impl<'gc, T: Collect + 'gc> Collect for WeakTableManager<'gc, T> {
    fn trace(&self, cc: &Collection) {
        self.parent.trace(cc);
        for weak in self.handles.values() {
            weak.trace(cc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gc_arena::{Arena, Rootable};

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct Item(u32);

    impl Keyed for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.0
        }
    }

    fn manager(start: u32) -> TableManager<Item, VecTable<Item>> {
        TableManager::new(VecTable::new(), start)
    }

    #[test]
    fn index_is_stable_while_live() {
        let mut table = manager(4);
        let a = table.inc(Item(1)).unwrap();
        assert_eq!(a, TableIndex(4));
        assert_eq!(table.inc(Item(1)).unwrap(), a);
        assert_eq!(table.count_of(1), 2);

        assert!(!table.dec(1));
        assert_eq!(table.index_of(1), Some(a));
        assert!(table.dec(1));
        assert_eq!(table.index_of(1), None);
        assert_eq!(table.get(a), None);
    }

    #[test]
    fn freed_indexes_are_reused() {
        let mut table = manager(0);
        let a = table.inc(Item(1)).unwrap();
        let b = table.inc(Item(2)).unwrap();
        assert_ne!(a, b);

        table.dec(1);
        let c = table.inc(Item(3)).unwrap();
        assert_eq!(c, a);
        // The high-water mark only ever moves forward.
        assert_eq!(table.high_water(), 2);
    }

    #[test]
    fn growth_failure_leaves_no_bookkeeping() {
        let mut table = TableManager::new(VecTable::with_limit(2), 0);
        table.inc(Item(1)).unwrap();
        table.inc(Item(2)).unwrap();
        let err = table.inc(Item(3)).unwrap_err();
        assert_eq!(err, TableError::LimitExceeded { limit: 2 });
        assert_eq!(table.len(), 2);
        assert_eq!(table.index_of(3), None);

        // A freed slot still satisfies later allocations.
        table.dec(1);
        assert!(table.inc(Item(3)).is_ok());
    }

    struct WeakTableRoot<'gc> {
        table: WeakTableManager<'gc, u32>,
        keep: Vec<Gc<'gc, u32>>,
    }

    unsafe impl<'gc> Collect for WeakTableRoot<'gc> {
        fn trace(&self, cc: &Collection) {
            self.table.trace(cc);
            for obj in &self.keep {
                obj.trace(cc);
            }
        }
    }

    #[test]
    fn weak_table_keeps_one_slot_per_object() {
        let mut arena = Arena::<Rootable!['gc => WeakTableRoot<'gc>]>::new(|_mc| WeakTableRoot {
            table: WeakTableManager::new(VecTable::new(), 0),
            keep: Vec::new(),
        });

        arena.mutate_root(|mc, root| {
            let obj = Gc::new(mc, 5u32);
            root.keep.push(obj);
            let a = root.table.inc(obj).unwrap();
            let b = root.table.inc(obj).unwrap();
            assert_eq!(a, b);
            assert_eq!(root.table.len(), 1);
            assert_eq!(root.table.get_original(a, mc).map(|o| *o), Some(5));
        });
    }

    #[test]
    fn reclaimed_referent_reads_as_gone() {
        let mut arena = Arena::<Rootable!['gc => WeakTableRoot<'gc>]>::new(|_mc| WeakTableRoot {
            table: WeakTableManager::new(VecTable::new(), 0),
            keep: Vec::new(),
        });

        let (index, key) = arena.mutate_root(|mc, root| {
            let obj = Gc::new(mc, 5u32);
            root.keep.push(obj);
            let index = root.table.inc(obj).unwrap();
            root.table.inc(obj).unwrap();
            (index, Gc::as_ptr(obj) as usize)
        });

        // The table holds only a weak handle, so dropping the strong
        // reference lets the collector take the object.
        arena.mutate_root(|_mc, root| {
            root.keep.clear();
        });
        arena.collect_all();

        arena.mutate_root(|mc, root| {
            assert!(root.table.is_occupied(index));
            assert!(root.table.get_original(index, mc).is_none());

            // Release by key still works with the referent gone.
            assert!(!root.table.dec(key));
            assert!(root.table.dec(key));
            assert!(!root.table.is_occupied(index));
        });
    }
}
