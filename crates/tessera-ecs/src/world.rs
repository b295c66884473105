//! The [`World`] container.
//!
//! A world owns the entity registry, the component stores, and the
//! collaborators built around them: messages, deferred resolvers, queriers,
//! boxes, families and modules. It is a cheap clonable handle; every
//! operation takes `&self` and synchronises internally.
//!
//! Lock order is always registry, then global store map, then individual
//! stores. Messages are emitted only after every lock is released, so
//! reactions may call back into the world.

use crate::bitmask::BitMask;
use crate::boxes::{Boxes, Resource};
use crate::component::{Component, Metadata, Storage};
use crate::entity::{Entities, Entity, Relocation};
use crate::family::Families;
use crate::group::Group;
use crate::message::{
    Messages, OnAdd, OnAdopt, OnCreate, OnPostDestroy, OnPreDestroy, OnReject, OnRemove, OnSegment,
};
use crate::module::Modules;
use crate::query::{Context, Query, Queryable, Queriers};
use crate::resolver::{Defer, Resolvable, Resolvers};
use crate::segment::Segment;
use crate::store::{downcast, AnyStore, Key, Store};
use crate::EcsError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// WorldConfig
// ---------------------------------------------------------------------------

/// Tuning knobs for a [`World`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Entities allocated densely before freed indices are recycled.
    pub entity_capacity: usize,
    /// Debug builds stop draining deferred actions after this many per
    /// resolve call.
    pub resolve_limit: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            entity_capacity: 64,
            resolve_limit: 1 << 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// A set of components spawned together, directly into their final segment.
pub trait Bundle: Send + 'static {
    fn metadata() -> Vec<Metadata>;
    fn write(self, world: &World, segment: &Arc<Segment>, key: Key);
}

impl Bundle for () {
    fn metadata() -> Vec<Metadata> {
        Vec::new()
    }

    fn write(self, _: &World, _: &Arc<Segment>, _: Key) {}
}

macro_rules! bundle_tuple {
    ($($name:ident),+) => {
        impl<$($name: Component),+> Bundle for ($($name,)+) {
            fn metadata() -> Vec<Metadata> {
                vec![$(Metadata::component::<$name>()),+]
            }

            #[allow(non_snake_case)]
            fn write(self, world: &World, segment: &Arc<Segment>, key: Key) {
                let ($($name,)+) = self;
                $(
                    if let Some(store) = world.store_in::<$name>(segment) {
                        store.write().set(key, $name);
                    }
                )+
            }
        }
    };
}

bundle_tuple!(A);
bundle_tuple!(A, B);
bundle_tuple!(A, B, C);
bundle_tuple!(A, B, C, D);
bundle_tuple!(A, B, C, D, E);
bundle_tuple!(A, B, C, D, E, F);
bundle_tuple!(A, B, C, D, E, F, G);
bundle_tuple!(A, B, C, D, E, F, G, H);

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

struct Inner {
    config: WorldConfig,
    entities: RwLock<Entities>,
    /// Stores for entity- and dictionary-indexed components, by type index.
    globals: RwLock<HashMap<usize, Arc<dyn AnyStore>>>,
    messages: Messages,
    resolvers: Resolvers,
    queriers: Queriers,
    boxes: Boxes,
    families: Families,
    modules: Modules,
}

#[derive(Clone)]
pub struct World {
    inner: Arc<Inner>,
}

impl World {
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                entities: RwLock::new(Entities::new(config.entity_capacity)),
                globals: RwLock::new(HashMap::new()),
                messages: Messages::new(),
                resolvers: Resolvers::new(config.resolve_limit),
                queriers: Queriers::new(),
                boxes: Boxes::new(),
                families: Families::new(),
                modules: Modules::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.inner.config
    }

    pub fn messages(&self) -> &Messages {
        &self.inner.messages
    }

    pub fn resolvers(&self) -> &Resolvers {
        &self.inner.resolvers
    }

    pub fn queriers(&self) -> &Queriers {
        &self.inner.queriers
    }

    pub fn boxes(&self) -> &Boxes {
        &self.inner.boxes
    }

    pub fn families(&self) -> &Families {
        &self.inner.families
    }

    pub fn modules(&self) -> &Modules {
        &self.inner.modules
    }

    /// Whether two handles refer to the same world.
    pub fn same(&self, other: &World) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -- entities -----------------------------------------------------------

    /// Create an entity with no components.
    pub fn create(&self) -> Entity {
        self.spawn(())
    }

    /// Create an entity holding every component of `bundle`.
    pub fn spawn<B: Bundle>(&self, bundle: B) -> Entity {
        let types = B::metadata();
        let mask: BitMask = types.iter().map(|meta| meta.index).collect();
        let (entity, segments) = {
            let mut entities = self.inner.entities.write();
            let before = entities.segments().len();
            let entity = entities.create(&mask);
            if let Some(data) = entities.try_data(entity) {
                if let Some(segment) = entities.segment(data.segment) {
                    bundle.write(self, segment, Key::new(entity, data.slot));
                }
            }
            (entity, created_since(&entities, before))
        };

        self.announce(segments);
        self.inner.messages.emit(OnCreate { entity });
        for component in types {
            self.inner.messages.emit(OnAdd { entity, component });
        }
        entity
    }

    /// Destroy `entity`. Returns `false` if it was not live.
    ///
    /// The entity stays enumerable by groups until the next [`resolve`](Self::resolve),
    /// but every direct lookup fails immediately.
    pub fn destroy(&self, entity: Entity) -> bool {
        if !self.has(entity) {
            return false;
        }
        self.inner.messages.emit(OnPreDestroy { entity });
        if self.inner.entities.write().destroy(entity).is_none() {
            // A pre-destroy reaction got there first.
            return false;
        }

        let (parent, children) = self.inner.families.clear(entity);
        if let Some(parent) = parent {
            self.inner.messages.emit(OnReject { parent, child: entity });
        }
        for child in children {
            self.inner.messages.emit(OnReject { parent: entity, child });
        }
        self.inner.messages.emit(OnPostDestroy { entity });
        true
    }

    #[inline]
    pub fn has(&self, entity: Entity) -> bool {
        self.inner.entities.read().has(entity)
    }

    /// Live entities in index order.
    pub fn entities(&self) -> Vec<Entity> {
        self.inner.entities.read().iter().collect()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.inner.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mask(&self, entity: Entity) -> Option<BitMask> {
        self.inner.entities.read().try_mask(entity).cloned()
    }

    /// `(segment index, slot)` of a live entity.
    pub fn location(&self, entity: Entity) -> Option<(usize, usize)> {
        let entities = self.inner.entities.read();
        entities
            .try_data(entity)
            .map(|data| (data.segment, data.slot))
    }

    pub fn segment_of(&self, entity: Entity) -> Option<Arc<Segment>> {
        self.inner.entities.read().try_segment(entity).cloned()
    }

    pub fn slot_of(&self, entity: Entity) -> Option<usize> {
        self.location(entity).map(|(_, slot)| slot)
    }

    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.inner.entities.read().segments().to_vec()
    }

    pub fn segment(&self, index: usize) -> Option<Arc<Segment>> {
        self.inner.entities.read().segment(index).cloned()
    }

    // -- components ---------------------------------------------------------

    /// Attach or overwrite `C` on `entity`. Returns `true` if the component
    /// was newly added (the entity moved to a new segment).
    pub fn set<C: Component>(&self, entity: Entity, value: C) -> Result<bool, EcsError> {
        let meta = Metadata::component::<C>();
        let segments = {
            let mut entities = self.inner.entities.write();
            let data = entities
                .try_data(entity)
                .ok_or(EcsError::StaleEntity { entity })?;

            if data.mask.has(meta.index) {
                let key = Key::new(entity, data.slot);
                if let Some(store) = entities
                    .segment(data.segment)
                    .and_then(|segment| self.store_in::<C>(segment))
                {
                    store.write().set(key, value);
                }
                return Ok(false);
            }

            let mut mask = data.mask.clone();
            mask.add(meta.index);
            let before = entities.segments().len();
            let relocation = entities
                .relocate(entity, &mask)
                .ok_or(EcsError::StaleEntity { entity })?;
            self.migrate(entity, &relocation);
            if let Some(store) = self.store_in::<C>(&relocation.target) {
                store
                    .write()
                    .set(Key::new(entity, relocation.target_slot), value);
            }
            created_since(&entities, before)
        };

        self.announce(segments);
        self.inner.messages.emit(OnAdd {
            entity,
            component: meta,
        });
        Ok(true)
    }

    /// Alias of [`set`](Self::set) for call sites that expect a new component.
    pub fn add<C: Component>(&self, entity: Entity, value: C) -> Result<bool, EcsError> {
        self.set(entity, value)
    }

    /// Detach `C` from `entity`. Returns `false` if it was not attached.
    pub fn remove<C: Component>(&self, entity: Entity) -> bool {
        let meta = Metadata::component::<C>();
        let segments = {
            let mut entities = self.inner.entities.write();
            let Some(data) = entities.try_data(entity) else {
                return false;
            };
            if !data.mask.has(meta.index) {
                return false;
            }
            let mut mask = data.mask.clone();
            mask.remove(meta.index);
            let before = entities.segments().len();
            let Some(relocation) = entities.relocate(entity, &mask) else {
                return false;
            };
            // Segment-indexed values of `C` have no target store and are dropped here.
            self.migrate(entity, &relocation);
            if C::STORAGE != Storage::Segment {
                self.store::<C>().write().remove(Key::new(entity, relocation.source_slot));
            }
            created_since(&entities, before)
        };

        self.announce(segments);
        self.inner.messages.emit(OnRemove {
            entity,
            component: meta,
        });
        true
    }

    /// A copy of `entity`'s `C`.
    pub fn get<C: Component>(&self, entity: Entity) -> Option<C> {
        self.with(entity, C::clone)
    }

    /// Borrow `entity`'s `C`. The store stays read-locked while `read` runs.
    pub fn with<C: Component, R>(&self, entity: Entity, read: impl FnOnce(&C) -> R) -> Option<R> {
        let (store, key) = self.locate::<C>(entity)?;
        let store = store.read();
        store.try_get(key).map(read)
    }

    /// Mutate `entity`'s `C` in place. The store stays write-locked while
    /// `update` runs.
    pub fn update<C: Component, R>(
        &self,
        entity: Entity,
        update: impl FnOnce(&mut C) -> R,
    ) -> Option<R> {
        let (store, key) = self.locate::<C>(entity)?;
        let mut store = store.write();
        store.try_get_mut(key).map(update)
    }

    pub fn has_component<C: Component>(&self, entity: Entity) -> bool {
        let index = Metadata::component::<C>().index;
        self.inner
            .entities
            .read()
            .try_mask(entity)
            .is_some_and(|mask| mask.has(index))
    }

    fn locate<C: Component>(&self, entity: Entity) -> Option<(Arc<RwLock<Store<C>>>, Key)> {
        let index = Metadata::component::<C>().index;
        let entities = self.inner.entities.read();
        let data = entities.try_data(entity)?;
        if !data.mask.has(index) {
            return None;
        }
        let store = self.store_in::<C>(entities.segment(data.segment)?)?;
        Some((store, Key::new(entity, data.slot)))
    }

    /// Move segment-indexed values along with a relocated entity.
    fn migrate(&self, entity: Entity, relocation: &Relocation) {
        let source = Key::new(entity, relocation.source_slot);
        let target = Key::new(entity, relocation.target_slot);
        for (index, store) in relocation.source.stores() {
            match relocation.target.store(index) {
                Some(destination) => {
                    store.transfer(source, destination.as_ref(), target);
                }
                None => {
                    store.remove(source);
                }
            }
        }
    }

    /// The store that holds `C` for entities of `segment`.
    pub(crate) fn store_in<C: Component>(&self, segment: &Segment) -> Option<Arc<RwLock<Store<C>>>> {
        match C::STORAGE {
            Storage::Segment => downcast::<C>(segment.store(Metadata::component::<C>().index)?),
            Storage::Entity | Storage::Dictionary => Some(self.store::<C>()),
        }
    }

    /// The world-wide store for an entity- or dictionary-indexed `C`.
    pub(crate) fn store<C: Component>(&self) -> Arc<RwLock<Store<C>>> {
        let index = Metadata::component::<C>().index;
        if let Some(store) = self.inner.globals.read().get(&index).and_then(downcast::<C>) {
            return store;
        }
        let mut globals = self.inner.globals.write();
        if let Some(store) = globals.get(&index).and_then(downcast::<C>) {
            return store;
        }
        let store = Arc::new(RwLock::new(Store::<C>::new(C::STORAGE)));
        globals.insert(index, store.clone());
        store
    }

    fn announce(&self, segments: Vec<OnSegment>) {
        for segment in segments {
            self.inner.messages.emit(segment);
        }
    }

    // -- queries ------------------------------------------------------------

    /// Every entity matching `Q`, across all present and future segments.
    pub fn group<Q: Queryable>(&self) -> Group<Q> {
        Group::new(self.clone())
    }

    /// Match `Q` against one segment.
    pub fn query<Q: Queryable>(&self, segment: &Arc<Segment>) -> Option<Query<Q>> {
        Context::new(self, segment).query::<Q>()
    }

    // -- deferral & resolution ----------------------------------------------

    pub fn defer<T: Resolvable>(&self, item: T) {
        self.inner.resolvers.defer(item);
    }

    pub fn defer_with(&self, action: impl FnOnce(&World) + Send + 'static) {
        self.inner.resolvers.defer_with(action);
    }

    /// A handle for deferring work from systems.
    pub fn deferrer(&self) -> Defer {
        Defer::new(self.clone())
    }

    /// Apply every deferred change, release destroyed entities and their
    /// values, compact stores, then resolve modules in registration order.
    ///
    /// Must not run while any group iteration on this world is in flight.
    /// Returns the number of deferred items resolved.
    pub fn resolve(&self) -> usize {
        let resolved = self.inner.resolvers.resolve(self);

        let globals: Vec<Arc<dyn AnyStore>> = self.inner.globals.read().values().cloned().collect();
        let frozen = self.inner.entities.read().frozen().to_vec();
        for store in &globals {
            for &entity in &frozen {
                store.remove(Key::new(entity, 0));
            }
        }
        self.inner.entities.write().resolve();
        for store in &globals {
            store.resolve();
        }
        self.inner.modules.resolve();
        resolved
    }

    // -- families & resources -----------------------------------------------

    /// Make `child` a child of `parent`. Both must be live; cycles are refused.
    pub fn adopt(&self, parent: Entity, child: Entity) -> bool {
        if !self.has(parent) || !self.has(child) {
            return false;
        }
        if !self.inner.families.adopt(parent, child) {
            return false;
        }
        self.inner.messages.emit(OnAdopt { parent, child });
        true
    }

    pub fn reject(&self, child: Entity) -> bool {
        match self.inner.families.reject(child) {
            Some(parent) => {
                self.inner.messages.emit(OnReject { parent, child });
                true
            }
            None => false,
        }
    }

    /// The world-wide `T`, created with `T::default()` on first access.
    pub fn resource<T: Default + Send + Sync + 'static>(&self) -> Resource<T> {
        Resource::attach(&self.inner.boxes, T::default)
    }
}

fn created_since(entities: &Entities, before: usize) -> Vec<OnSegment> {
    entities.segments()[before..]
        .iter()
        .map(|segment| OnSegment {
            segment: segment.index(),
            mask: segment.mask().clone(),
        })
        .collect()
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("entities", &*self.inner.entities.read())
            .field("pending", &self.inner.resolvers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Position(f32, f32);
    impl Component for Position {}

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity(f32, f32);
    impl Component for Velocity {}

    #[derive(Debug, Clone, PartialEq)]
    struct Label(&'static str);
    impl Component for Label {
        const STORAGE: Storage = Storage::Dictionary;
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Slot(u32);
    impl Component for Slot {
        const STORAGE: Storage = Storage::Entity;
    }

    // -- spawn / set / remove -----------------------------------------------

    #[test]
    fn spawn_places_entity_in_final_segment() {
        let world = World::new();
        let entity = world.spawn((Position(1.0, 2.0), Velocity(3.0, 4.0), Label("a")));
        let segment = world.segment_of(entity).unwrap();
        assert_eq!(segment.mask().count(), 3);
        assert_eq!(world.get::<Position>(entity), Some(Position(1.0, 2.0)));
        assert_eq!(world.get::<Label>(entity), Some(Label("a")));
    }

    #[test]
    fn set_migrates_values_between_segments() {
        let world = World::new();
        let entity = world.spawn((Position(1.0, 1.0),));
        let first = world.segment_of(entity).unwrap();

        assert!(world.set(entity, Velocity(0.5, 0.5)).unwrap());
        assert!(!world.set(entity, Velocity(2.0, 2.0)).unwrap());
        let second = world.segment_of(entity).unwrap();

        assert_ne!(first.index(), second.index());
        assert_eq!(first.count(), 0);
        assert_eq!(world.get::<Position>(entity), Some(Position(1.0, 1.0)));
        assert_eq!(world.get::<Velocity>(entity), Some(Velocity(2.0, 2.0)));
    }

    #[test]
    fn remove_drops_the_component_only() {
        let world = World::new();
        let entity = world.spawn((Position(0.0, 0.0), Label("x"), Slot(4)));
        assert!(world.remove::<Label>(entity));
        assert!(!world.remove::<Label>(entity));
        assert!(world.remove::<Position>(entity));
        assert_eq!(world.get::<Label>(entity), None);
        assert_eq!(world.get::<Position>(entity), None);
        assert_eq!(world.get::<Slot>(entity), Some(Slot(4)));
        assert!(!world.has_component::<Position>(entity));
    }

    #[test]
    fn returned_values_are_copies() {
        let world = World::new();
        let entity = world.spawn((Position(1.0, 1.0),));
        let mut copy = world.get::<Position>(entity).unwrap();
        copy.0 = 99.0;
        assert_eq!(world.get::<Position>(entity), Some(Position(1.0, 1.0)));
        world.update::<Position, _>(entity, |p| p.0 = 5.0);
        assert_eq!(world.with::<Position, _>(entity, |p| p.0), Some(5.0));
    }

    #[test]
    fn stale_entities_fail_every_lookup() {
        let world = World::new();
        let entity = world.spawn((Position(0.0, 0.0), Slot(1)));
        assert!(world.destroy(entity));
        assert!(!world.destroy(entity));
        world.resolve();

        assert!(!world.has(entity));
        assert_eq!(world.get::<Position>(entity), None);
        assert!(matches!(
            world.set(entity, Velocity(0.0, 0.0)),
            Err(EcsError::StaleEntity { .. })
        ));
        assert!(!world.remove::<Position>(entity));
    }

    #[test]
    fn global_values_are_released_on_resolve() {
        let world = World::with_config(WorldConfig {
            entity_capacity: 1,
            ..Default::default()
        });
        let first = world.spawn((Label("old"), Slot(1)));
        world.destroy(first);
        // Still held until resolve.
        assert_eq!(world.store::<Slot>().read().len(), 1);
        world.resolve();
        assert_eq!(world.store::<Slot>().read().len(), 0);
        assert_eq!(world.store::<Label>().read().len(), 0);

        let second = world.spawn((Slot(2),));
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);
        assert_eq!(world.get::<Slot>(second), Some(Slot(2)));
        assert_eq!(world.get::<Slot>(first), None);
    }

    // -- messages -----------------------------------------------------------

    #[test]
    fn lifecycle_messages_in_order() {
        let world = World::new();
        let created = world.messages().receiver::<OnCreate>();
        let segments = world.messages().receiver::<OnSegment>();
        let added = world.messages().receiver::<OnAdd>();
        let destroyed = world.messages().receiver::<OnPostDestroy>();

        let entity = world.spawn((Position(0.0, 0.0),));
        world.set(entity, Velocity(0.0, 0.0)).unwrap();
        world.destroy(entity);

        assert_eq!(created.drain(), vec![OnCreate { entity }]);
        assert_eq!(segments.len(), 2);
        assert_eq!(added.len(), 2);
        assert_eq!(destroyed.pop(), Some(OnPostDestroy { entity }));
    }

    #[test]
    fn reactions_may_call_back_into_the_world() {
        let world = World::new();
        let inner = world.clone();
        world.messages().react::<OnCreate>(move |message| {
            let _ = inner.set(message.entity, Label("tagged"));
        });
        let entity = world.create();
        assert_eq!(world.get::<Label>(entity), Some(Label("tagged")));
    }

    // -- families & resources -----------------------------------------------

    #[test]
    fn destroy_orphans_children() {
        let world = World::new();
        let parent = world.create();
        let child = world.create();
        assert!(world.adopt(parent, child));
        assert!(!world.adopt(child, parent));
        world.destroy(parent);
        assert_eq!(world.families().parent(child), None);
        assert!(!world.reject(child));
    }

    #[test]
    fn resources_are_shared_between_handles() {
        #[derive(Default)]
        struct Score(u32);

        let world = World::new();
        world.resource::<Score>().write().0 += 3;
        let other = world.clone();
        assert_eq!(other.resource::<Score>().read().0, 3);
    }

    #[test]
    fn config_round_trips_through_json() {
        let config: WorldConfig = serde_json::from_str(r#"{"entity_capacity": 8}"#).unwrap();
        assert_eq!(config.entity_capacity, 8);
        assert_eq!(config.resolve_limit, WorldConfig::default().resolve_limit);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<WorldConfig>(&json).unwrap(), config);
    }
}
