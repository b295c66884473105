//! Per-component-type value storage.
//!
//! A [`Store<T>`] maps entities to values of `T` using one of three
//! strategies (see [`Storage`]). Values are owned by the store and handed
//! out as references or clones, never aliased with caller locals.
//!
//! Structural compaction only happens in [`Store::resolve`], which the world
//! calls at resolve points; slot indices are stable in between.

use crate::component::{Component, Metadata, Storage};
use crate::entity::Entity;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Address of a value: the entity plus its current segment slot.
///
/// Segment-indexed stores use `slot`; entity-indexed stores use
/// `entity.index()`; dictionary stores look `entity` up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub entity: Entity,
    pub slot: usize,
}

impl Key {
    #[inline]
    pub fn new(entity: Entity, slot: usize) -> Self {
        Self { entity, slot }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store<T> {
    storage: Storage,
    values: Vec<Option<T>>,
    /// Entity owning each slot, checked on every access so stale handles miss.
    owners: Vec<Entity>,
    /// Holes left by removals in dictionary stores.
    free: Vec<usize>,
    indices: HashMap<Entity, usize>,
    count: usize,
}

impl<T: Component> Store<T> {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            values: Vec::new(),
            owners: Vec::new(),
            free: Vec::new(),
            indices: HashMap::new(),
            count: 0,
        }
    }

    /// A type-erased, lock-wrapped store using `T`'s declared storage.
    pub fn shared() -> Arc<dyn AnyStore> {
        Arc::new(RwLock::new(Self::new(T::STORAGE)))
    }

    pub fn storage(&self) -> Storage {
        self.storage
    }

    #[inline]
    fn position(&self, key: Key) -> Option<usize> {
        match self.storage {
            Storage::Segment => Some(key.slot),
            Storage::Entity => Some(key.entity.index() as usize),
            Storage::Dictionary => self.indices.get(&key.entity).copied(),
        }
    }

    /// Slot holding the value for `key`, if any.
    pub fn try_index(&self, key: Key) -> Option<usize> {
        let slot = self.position(key)?;
        let owned = self.owners.get(slot) == Some(&key.entity);
        (owned && self.values[slot].is_some()).then_some(slot)
    }

    pub fn try_get(&self, key: Key) -> Option<&T> {
        let slot = self.try_index(key)?;
        self.values[slot].as_ref()
    }

    pub fn try_get_mut(&mut self, key: Key) -> Option<&mut T> {
        let slot = self.try_index(key)?;
        self.values[slot].as_mut()
    }

    /// Store `value` for `key`. Returns `true` if newly added, `false` if an
    /// existing value was overwritten.
    pub fn set(&mut self, key: Key, value: T) -> bool {
        if let Some(slot) = self.try_index(key) {
            self.values[slot] = Some(value);
            return false;
        }

        let slot = match self.storage {
            Storage::Segment | Storage::Entity => {
                let slot = self.position(key).unwrap_or_default();
                if slot >= self.values.len() {
                    self.values.resize_with(slot + 1, || None);
                    self.owners.resize(slot + 1, Entity::ZERO);
                }
                slot
            }
            Storage::Dictionary => {
                let slot = self.free.pop().unwrap_or_else(|| {
                    self.values.push(None);
                    self.owners.push(Entity::ZERO);
                    self.values.len() - 1
                });
                self.indices.insert(key.entity, slot);
                slot
            }
        };
        // A stale value left by a previous owner is replaced, not counted.
        if self.values[slot].replace(value).is_none() {
            self.count += 1;
        }
        self.owners[slot] = key.entity;
        true
    }

    /// Same as [`set`](Self::set); reads better where the caller expects a
    /// new value.
    #[inline]
    pub fn add(&mut self, key: Key, value: T) -> bool {
        self.set(key, value)
    }

    /// Remove and return the value for `key`.
    pub fn take(&mut self, key: Key) -> Option<T> {
        let slot = self.try_index(key)?;
        let value = self.values[slot].take();
        self.owners[slot] = Entity::ZERO;
        self.count -= 1;
        if self.storage == Storage::Dictionary {
            self.indices.remove(&key.entity);
            self.free.push(slot);
        }
        value
    }

    pub fn remove(&mut self, key: Key) -> bool {
        self.take(key).is_some()
    }

    pub fn has(&self, key: Key) -> bool {
        self.try_index(key).is_some()
    }

    /// Copy the value at `source` into `other` at `target`.
    ///
    /// Returns `false` when there is nothing to copy.
    pub fn copy_to(&self, source: Key, target: Key, other: &mut Store<T>) -> bool {
        match self.try_get(source) {
            Some(value) => {
                other.set(target, value.clone());
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) -> bool {
        if self.values.is_empty() {
            return false;
        }
        self.values.clear();
        self.owners.clear();
        self.free.clear();
        self.indices.clear();
        self.count = 0;
        true
    }

    /// Compact storage. Dictionary stores pack live values to the front and
    /// rebuild their index; indexed stores trim trailing holes.
    pub fn resolve(&mut self) -> bool {
        match self.storage {
            Storage::Dictionary => {
                if self.free.is_empty() {
                    return false;
                }
                let mut packed = 0;
                for slot in 0..self.values.len() {
                    if self.values[slot].is_none() {
                        continue;
                    }
                    if slot != packed {
                        self.values.swap(slot, packed);
                        self.owners.swap(slot, packed);
                    }
                    self.indices.insert(self.owners[packed], packed);
                    packed += 1;
                }
                self.values.truncate(packed);
                self.owners.truncate(packed);
                self.free.clear();
                true
            }
            Storage::Segment | Storage::Entity => {
                let before = self.values.len();
                while matches!(self.values.last(), Some(None)) {
                    self.values.pop();
                    self.owners.pop();
                }
                before != self.values.len()
            }
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Allocated slot span, including holes.
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> {
        self.owners
            .iter()
            .zip(&self.values)
            .filter_map(|(&entity, value)| Some((entity, value.as_ref()?)))
    }
}

// ---------------------------------------------------------------------------
// AnyStore
// ---------------------------------------------------------------------------

/// Type-erased view of a lock-wrapped store.
pub trait AnyStore: Send + Sync + 'static {
    fn metadata(&self) -> Metadata;
    fn storage(&self) -> Storage;
    fn has(&self, key: Key) -> bool;
    fn remove(&self, key: Key) -> bool;
    fn clear(&self) -> bool;
    fn resolve(&self) -> bool;
    fn len(&self) -> usize;
    /// Move the value at `source` into `target` (a store of the same type)
    /// at `destination`.
    fn transfer(&self, source: Key, target: &dyn AnyStore, destination: Key) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Component> AnyStore for RwLock<Store<T>> {
    fn metadata(&self) -> Metadata {
        Metadata::component::<T>()
    }

    fn storage(&self) -> Storage {
        self.read().storage
    }

    fn has(&self, key: Key) -> bool {
        self.read().has(key)
    }

    fn remove(&self, key: Key) -> bool {
        self.write().remove(key)
    }

    fn clear(&self) -> bool {
        self.write().clear()
    }

    fn resolve(&self) -> bool {
        self.write().resolve()
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn transfer(&self, source: Key, target: &dyn AnyStore, destination: Key) -> bool {
        let Some(target) = target.as_any().downcast_ref::<RwLock<Store<T>>>() else {
            return false;
        };
        let Some(value) = self.write().take(source) else {
            return false;
        };
        target.write().set(destination, value);
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recover the concrete store behind an erased one.
pub fn downcast<T: Component>(store: &Arc<dyn AnyStore>) -> Option<Arc<RwLock<Store<T>>>> {
    store.clone().into_any().downcast::<RwLock<Store<T>>>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);
    impl Component for Health {}

    fn key(index: u32, slot: usize) -> Key {
        Key::new(Entity::new(index, 1), slot)
    }

    // -- per-strategy behaviour ---------------------------------------------

    #[test]
    fn set_reports_new_versus_overwrite() {
        for storage in [Storage::Segment, Storage::Entity, Storage::Dictionary] {
            let mut store = Store::new(storage);
            assert!(store.set(key(3, 0), Health(1)), "{storage:?}");
            assert!(!store.set(key(3, 0), Health(2)), "{storage:?}");
            assert_eq!(store.try_get(key(3, 0)), Some(&Health(2)));
            assert_eq!(store.len(), 1);
        }
    }

    #[test]
    fn stale_handles_miss() {
        for storage in [Storage::Segment, Storage::Entity] {
            let mut store = Store::new(storage);
            store.set(key(2, 2), Health(5));
            let stale = Key::new(Entity::new(2, 0), 2);
            assert!(!store.has(stale), "{storage:?}");
            assert!(!store.remove(stale), "{storage:?}");
        }
    }

    #[test]
    fn dictionary_reuses_holes_and_compacts() {
        let mut store = Store::new(Storage::Dictionary);
        store.set(key(1, 0), Health(1));
        store.set(key(2, 0), Health(2));
        store.set(key(3, 0), Health(3));
        assert!(store.remove(key(1, 0)));
        assert_eq!(store.capacity(), 3);

        assert!(store.resolve());
        assert_eq!(store.capacity(), 2);
        assert_eq!(store.try_index(key(2, 0)), Some(0));
        assert_eq!(store.try_get(key(3, 0)), Some(&Health(3)));
        assert!(!store.resolve());
    }

    #[test]
    fn indexed_stores_trim_trailing_holes() {
        let mut store = Store::new(Storage::Segment);
        store.set(key(1, 0), Health(1));
        store.set(key(2, 4), Health(2));
        assert_eq!(store.capacity(), 5);
        store.remove(key(2, 4));
        assert!(store.resolve());
        assert_eq!(store.capacity(), 1);
    }

    #[test]
    fn copy_and_transfer() {
        let mut source = Store::new(Storage::Segment);
        let mut target = Store::new(Storage::Segment);
        source.set(key(1, 0), Health(9));
        assert!(source.copy_to(key(1, 0), key(1, 3), &mut target));
        assert_eq!(target.try_get(key(1, 3)), Some(&Health(9)));
        assert!(!source.copy_to(key(7, 0), key(7, 0), &mut target));

        let left = Store::<Health>::shared();
        let right = Store::<Health>::shared();
        downcast::<Health>(&left).unwrap().write().set(key(1, 0), Health(4));
        assert!(left.transfer(key(1, 0), right.as_ref(), key(1, 1)));
        assert!(!left.has(key(1, 0)));
        assert!(right.has(key(1, 1)));
        assert_eq!(right.metadata(), Metadata::component::<Health>());
    }

    #[test]
    fn clear_on_empty_store_is_false() {
        let mut store = Store::<Health>::new(Storage::Entity);
        assert!(!store.clear());
        store.set(key(0, 0), Health(0));
        assert!(store.clear());
        assert!(store.is_empty());
    }
}
