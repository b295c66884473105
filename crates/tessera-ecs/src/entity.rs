//! Entity identifiers and the entity registry.
//!
//! An [`Entity`] is a 64-bit handle that packs a *generation* counter in the
//! high 32 bits and an *index* in the low 32 bits. Generations start at 1 and
//! are bumped every time an index is recycled, so [`Entity::ZERO`] is never a
//! live entity and stale handles fail every lookup.
//!
//! Destruction is two-phase. [`Entities::destroy`] moves the index into a
//! *frozen* list; it only becomes reusable after [`Entities::resolve`]. This
//! keeps indices stable for any iteration still in flight this frame.

use crate::bitmask::BitMask;
use crate::segment::Segment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A generational entity identifier.
///
/// Layout: `[generation: u32 | index: u32]`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Entity(u64);

impl Entity {
    /// The null entity. Never returned by the registry.
    pub const ZERO: Entity = Entity(0);

    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// The index portion (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// The generation portion (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// Per-index metadata record.
#[derive(Debug, Clone, Default)]
pub struct Data {
    /// Live generation for this index. Zero means the index was never used.
    pub generation: u32,
    /// Whether the index currently holds a live entity.
    pub allocated: bool,
    /// Index of the segment the entity lives in.
    pub segment: usize,
    /// Position within the segment's dense entity array.
    pub slot: usize,
    /// Component types attached to the entity.
    pub mask: BitMask,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Generational index allocator that also owns segment membership.
///
/// Segments are append-only: once created for a mask they are never merged
/// or destroyed, only emptied.
pub struct Entities {
    data: Vec<Data>,
    free: Vec<u32>,
    frozen: Vec<Entity>,
    capacity: usize,
    alive: usize,
    segments: Vec<Arc<Segment>>,
    lookup: HashMap<BitMask, usize>,
}

impl Entities {
    /// Create a registry with room for `capacity` entities before indices
    /// start being recycled. Segment 0 (the empty mask) always exists.
    pub fn new(capacity: usize) -> Self {
        let empty = BitMask::new();
        let mut lookup = HashMap::new();
        lookup.insert(empty.clone(), 0);
        Self {
            data: Vec::new(),
            free: Vec::new(),
            frozen: Vec::new(),
            capacity: capacity.max(1),
            alive: 0,
            segments: vec![Arc::new(Segment::new(0, empty))],
            lookup,
        }
    }

    /// Reserve an index and place the new entity in the segment for `mask`.
    ///
    /// The dense array is extended while it is below capacity; only then are
    /// freed indices recycled. When neither is possible the capacity doubles.
    pub fn create(&mut self, mask: &BitMask) -> Entity {
        let index = if self.data.len() < self.capacity {
            self.data.push(Data::default());
            self.data.len() - 1
        } else if let Some(index) = self.free.pop() {
            index as usize
        } else {
            self.capacity *= 2;
            self.data.push(Data::default());
            self.data.len() - 1
        };

        let (segment, _) = self.get_or_create_segment(mask);
        let data = &mut self.data[index];
        data.generation = match data.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        let entity = Entity::new(index as u32, data.generation);
        data.allocated = true;
        data.segment = segment.index();
        data.slot = segment.push(entity);
        data.mask = segment.mask().clone();
        self.alive += 1;
        entity
    }

    /// Destroy a live entity. Returns its final metadata, or `None` if the
    /// handle is stale.
    ///
    /// The entity stays enumerable in its segment until [`resolve`](Self::resolve).
    pub fn destroy(&mut self, entity: Entity) -> Option<Data> {
        if !self.has(entity) {
            return None;
        }
        let data = &mut self.data[entity.index() as usize];
        data.allocated = false;
        self.segments[data.segment].freeze(data.slot, true);
        self.frozen.push(entity);
        self.alive -= 1;
        Some(data.clone())
    }

    /// Return frozen indices to the free list, in the registry and in every
    /// segment. Returns `true` if anything was released.
    pub fn resolve(&mut self) -> bool {
        let mut changed = !self.frozen.is_empty();
        self.free.extend(self.frozen.drain(..).map(Entity::index));
        for segment in &self.segments {
            changed |= segment.resolve();
        }
        changed
    }

    /// Move a live entity into the segment for `mask`.
    ///
    /// Returns the `(from, to)` segments with the old and new slots.
    pub fn relocate(&mut self, entity: Entity, mask: &BitMask) -> Option<Relocation> {
        if !self.has(entity) {
            return None;
        }
        let (target, _) = self.get_or_create_segment(mask);
        let data = &mut self.data[entity.index() as usize];
        let source = self.segments[data.segment].clone();
        source.freeze(data.slot, false);
        let relocation = Relocation {
            source,
            source_slot: data.slot,
            target_slot: target.push(entity),
            target: target.clone(),
        };
        data.segment = target.index();
        data.slot = relocation.target_slot;
        data.mask = target.mask().clone();
        Some(relocation)
    }

    /// Whether `entity` is live (in range, allocated, generation matches).
    #[inline]
    pub fn has(&self, entity: Entity) -> bool {
        self.data
            .get(entity.index() as usize)
            .is_some_and(|data| data.allocated && data.generation == entity.generation())
    }

    pub fn try_data(&self, entity: Entity) -> Option<&Data> {
        self.data
            .get(entity.index() as usize)
            .filter(|data| data.allocated && data.generation == entity.generation())
    }

    pub fn try_mask(&self, entity: Entity) -> Option<&BitMask> {
        self.try_data(entity).map(|data| &data.mask)
    }

    pub fn try_segment(&self, entity: Entity) -> Option<&Arc<Segment>> {
        self.try_data(entity).map(|data| &self.segments[data.segment])
    }

    /// Segment for `mask`, creating it on first use. The flag reports creation.
    pub fn get_or_create_segment(&mut self, mask: &BitMask) -> (Arc<Segment>, bool) {
        if let Some(&index) = self.lookup.get(mask) {
            return (self.segments[index].clone(), false);
        }
        let index = self.segments.len();
        let segment = Arc::new(Segment::new(index, mask.clone()));
        self.segments.push(segment.clone());
        self.lookup.insert(mask.clone(), index);
        tracing::debug!(segment = index, mask = ?mask, "segment created");
        (segment, true)
    }

    pub fn segment(&self, index: usize) -> Option<&Arc<Segment>> {
        self.segments.get(index)
    }

    pub fn segments(&self) -> &[Arc<Segment>] {
        &self.segments
    }

    /// Entities destroyed since the last resolve.
    pub fn frozen(&self) -> &[Entity] {
        &self.frozen
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.alive
    }

    pub fn is_empty(&self) -> bool {
        self.alive == 0
    }

    /// Live entities in index order. Deallocated indices are skipped.
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.data.iter().enumerate().filter_map(|(index, data)| {
            data.allocated
                .then(|| Entity::new(index as u32, data.generation))
        })
    }
}

impl fmt::Debug for Entities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entities")
            .field("alive", &self.alive)
            .field("capacity", &self.capacity)
            .field("free", &self.free.len())
            .field("frozen", &self.frozen.len())
            .field("segments", &self.segments.len())
            .finish()
    }
}

/// Result of moving an entity between segments.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub source: Arc<Segment>,
    pub source_slot: usize,
    pub target: Arc<Segment>,
    pub target_slot: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_packing() {
        let entity = Entity::new(7, 3);
        assert_eq!(entity.index(), 7);
        assert_eq!(entity.generation(), 3);
        assert_eq!(Entity::from_raw(entity.to_raw()), entity);
        assert_eq!(format!("{entity:?}"), "Entity(7v3)");
        assert_eq!(format!("{entity}"), "7v3");
    }

    #[test]
    fn generations_start_at_one() {
        let mut entities = Entities::new(4);
        let entity = entities.create(&BitMask::new());
        assert_eq!(entity.generation(), 1);
        assert!(!entity.is_zero());
        assert!(!entities.has(Entity::ZERO));
    }

    #[test]
    fn dense_array_extends_before_recycling() {
        let mut entities = Entities::new(2);
        let a = entities.create(&BitMask::new());
        entities.destroy(a);
        entities.resolve();
        let b = entities.create(&BitMask::new());
        assert_ne!(a.index(), b.index());
        // Capacity reached: the freed index is reused with a new generation.
        let c = entities.create(&BitMask::new());
        assert_eq!(c.index(), a.index());
        assert_eq!(c.generation(), a.generation() + 1);
        assert!(!entities.has(a));
    }

    #[test]
    fn capacity_doubles_when_exhausted() {
        let mut entities = Entities::new(1);
        let a = entities.create(&BitMask::new());
        let b = entities.create(&BitMask::new());
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(entities.len(), 2);
    }

    #[test]
    fn destroyed_index_is_frozen_until_resolve() {
        let mut entities = Entities::new(1);
        let a = entities.create(&BitMask::new());
        assert!(entities.destroy(a).is_some());
        assert!(entities.destroy(a).is_none());
        assert_eq!(entities.frozen(), &[a]);

        // Still frozen: a fresh index is allocated instead.
        let b = entities.create(&BitMask::new());
        assert_ne!(b.index(), a.index());

        entities.resolve();
        assert!(entities.frozen().is_empty());
    }

    #[test]
    fn relocate_moves_between_segments() {
        let mut entities = Entities::new(8);
        let entity = entities.create(&BitMask::new());
        let mask = BitMask::with(5);
        let relocation = entities.relocate(entity, &mask).unwrap();
        assert_eq!(relocation.source.index(), 0);
        assert_eq!(relocation.target.mask(), &mask);
        assert_eq!(entities.try_mask(entity), Some(&mask));
        assert_eq!(
            entities.try_segment(entity).map(|s| s.index()),
            Some(relocation.target.index())
        );
        assert_eq!(relocation.source.count(), 0);
    }

    #[test]
    fn iter_skips_deallocated() {
        let mut entities = Entities::new(8);
        let a = entities.create(&BitMask::new());
        let b = entities.create(&BitMask::new());
        entities.destroy(a);
        assert_eq!(entities.iter().collect::<Vec<_>>(), vec![b]);
    }
}
