//! Segments: storage partitions for entities sharing one component set.
//!
//! A segment owns a dense array of entity slots plus the segment-indexed
//! stores of every [`Storage::Segment`](crate::component::Storage) component
//! in its mask. Slots released by destruction or migration are *frozen* first
//! and only become free at the next resolve, so slot indices stay stable for
//! any iteration in flight.

use crate::bitmask::BitMask;
use crate::component::{Metadata, Storage};
use crate::entity::Entity;
use crate::store::{AnyStore, Key};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Default)]
struct Slots {
    entities: Vec<Entity>,
    free: Vec<usize>,
    frozen: Vec<(usize, Entity)>,
    count: usize,
}

pub struct Segment {
    index: usize,
    mask: BitMask,
    types: Vec<Metadata>,
    stores: HashMap<usize, Arc<dyn AnyStore>>,
    slots: RwLock<Slots>,
}

impl Segment {
    pub(crate) fn new(index: usize, mask: BitMask) -> Self {
        let types: Vec<Metadata> = mask.iter().filter_map(Metadata::get).collect();
        let stores = types
            .iter()
            .filter(|meta| meta.storage == Some(Storage::Segment))
            .filter_map(|meta| Some((meta.index, meta.create_store()?)))
            .collect();
        Self {
            index,
            mask,
            types,
            stores,
            slots: RwLock::new(Slots::default()),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// The component-type combination of every entity in this segment.
    #[inline]
    pub fn mask(&self) -> &BitMask {
        &self.mask
    }

    pub fn types(&self) -> &[Metadata] {
        &self.types
    }

    /// Segment-indexed store for the component type at `index`.
    pub fn store(&self, index: usize) -> Option<&Arc<dyn AnyStore>> {
        self.stores.get(&index)
    }

    pub(crate) fn stores(&self) -> impl Iterator<Item = (usize, &Arc<dyn AnyStore>)> {
        self.stores.iter().map(|(&index, store)| (index, store))
    }

    /// Append `entity`, reusing a free slot when one exists.
    pub(crate) fn push(&self, entity: Entity) -> usize {
        let mut slots = self.slots.write();
        slots.count += 1;
        match slots.free.pop() {
            Some(slot) => {
                slots.entities[slot] = entity;
                slot
            }
            None => {
                slots.entities.push(entity);
                slots.entities.len() - 1
            }
        }
    }

    /// Take `slot` out of the live range.
    ///
    /// With `keep` the slot still reports its entity until resolve (the
    /// entity was destroyed but may be visited by in-flight iteration).
    /// Without it the slot is blanked immediately (the entity moved away).
    pub(crate) fn freeze(&self, slot: usize, keep: bool) {
        let mut slots = self.slots.write();
        let Some(&entity) = slots.entities.get(slot) else {
            return;
        };
        if !keep {
            slots.entities[slot] = Entity::ZERO;
        }
        slots.frozen.push((slot, entity));
        slots.count -= 1;
    }

    /// Release frozen slots and drop any values still stored there.
    pub(crate) fn resolve(&self) -> bool {
        let frozen = {
            let mut slots = self.slots.write();
            let frozen = std::mem::take(&mut slots.frozen);
            for &(slot, _) in &frozen {
                slots.entities[slot] = Entity::ZERO;
                slots.free.push(slot);
            }
            frozen
        };
        for (slot, entity) in &frozen {
            for store in self.stores.values() {
                store.remove(Key::new(*entity, *slot));
            }
        }
        let mut changed = !frozen.is_empty();
        for store in self.stores.values() {
            changed |= store.resolve();
        }
        changed
    }

    /// Entity at `slot`, or `None` for free and moved-out slots.
    #[inline]
    pub fn entity(&self, slot: usize) -> Option<Entity> {
        self.slots
            .read()
            .entities
            .get(slot)
            .copied()
            .filter(|entity| !entity.is_zero())
    }

    /// Width of the slot array (live, frozen and free slots).
    pub fn len(&self) -> usize {
        self.slots.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Number of live entities.
    pub fn count(&self) -> usize {
        self.slots.read().count
    }

    /// Snapshot of every enumerable entity with its slot.
    pub fn entities(&self) -> Vec<(usize, Entity)> {
        self.slots
            .read()
            .entities
            .iter()
            .enumerate()
            .filter(|(_, entity)| !entity.is_zero())
            .map(|(slot, &entity)| (slot, entity))
            .collect()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("index", &self.index)
            .field("mask", &self.mask)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reuses_free_slots_after_resolve() {
        let segment = Segment::new(1, BitMask::new());
        let a = Entity::new(0, 1);
        let b = Entity::new(1, 1);
        let slot = segment.push(a);
        segment.freeze(slot, true);

        // Frozen slot is not reused yet.
        assert_eq!(segment.push(b), 1);
        assert_eq!(segment.entity(slot), Some(a));

        assert!(segment.resolve());
        assert_eq!(segment.entity(slot), None);
        let c = Entity::new(2, 1);
        assert_eq!(segment.push(c), slot);
        assert_eq!(segment.count(), 2);
    }

    #[test]
    fn moved_slots_are_blanked_immediately() {
        let segment = Segment::new(1, BitMask::new());
        let a = Entity::new(0, 1);
        let slot = segment.push(a);
        segment.freeze(slot, false);
        assert_eq!(segment.entity(slot), None);
        assert!(segment.entities().is_empty());
        assert_eq!(segment.len(), 1);
    }

    #[test]
    fn resolve_without_pending_work_is_a_no_op() {
        let segment = Segment::new(0, BitMask::new());
        assert!(!segment.resolve());
    }
}
