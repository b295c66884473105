//! Composable query shapes and the per-segment querier cache.
//!
//! A *queryable shape* describes what a system wants from each entity:
//!
//! | shape | matches when | yields |
//! |---|---|---|
//! | [`Entity`] | always | the entity handle |
//! | [`Read<C>`] / [`Write<C>`] | the segment holds `C` | an accessor bound to `C`'s store |
//! | [`Maybe<Q>`] | always | `Some` when `Q` matches, else `None` |
//! | `(A, B, ..)` | every element matches | a tuple of the elements |
//! | [`Any<(Maybe<A>, ..)>`](Any) | at least one alternative matches | the first match, others `None` |
//! | [`Has<K>`] / [`Not<K>`] | the segment holds / lacks `K` (or an implementor) | a marker |
//!
//! Matching is evaluated once per `(shape, segment)` pair and cached in
//! [`Queriers`]. Segments only ever grow in number, so cached entries never
//! go stale.

use crate::capability::Capabilities;
use crate::component::{mask_of, Component, Metadata};
use crate::entity::Entity;
use crate::segment::Segment;
use crate::store::{Key, Store};
use crate::world::World;
use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A compiled accessor for one shape on one segment.
pub struct Query<T> {
    fetch: Arc<dyn Fn(Entity, usize) -> T + Send + Sync>,
    types: Vec<Metadata>,
}

impl<T: 'static> Query<T> {
    pub fn new(types: Vec<Metadata>, fetch: impl Fn(Entity, usize) -> T + Send + Sync + 'static) -> Self {
        Self {
            fetch: Arc::new(fetch),
            types,
        }
    }

    /// Fetch the item for the entity at `slot`.
    #[inline]
    pub fn get(&self, entity: Entity, slot: usize) -> T {
        (self.fetch)(entity, slot)
    }

    /// Every component type this query reads or writes.
    pub fn types(&self) -> &[Metadata] {
        &self.types
    }

    pub fn map<U: 'static>(self, map: impl Fn(T) -> U + Send + Sync + 'static) -> Query<U> {
        let fetch = self.fetch;
        Query::new(self.types, move |entity, slot| map(fetch(entity, slot)))
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            fetch: self.fetch.clone(),
            types: self.types.clone(),
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query").field("types", &self.types).finish()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// The segment being matched, with access to the world's stores and cache.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    world: &'a World,
    segment: &'a Arc<Segment>,
}

impl<'a> Context<'a> {
    pub fn new(world: &'a World, segment: &'a Arc<Segment>) -> Self {
        Self { world, segment }
    }

    pub fn world(&self) -> &'a World {
        self.world
    }

    pub fn segment(&self) -> &'a Arc<Segment> {
        self.segment
    }

    /// Match a sub-shape on the same segment, through the cache.
    pub fn query<Q: Queryable>(&self) -> Option<Query<Q>> {
        self.world.queriers().query::<Q>(self)
    }

    /// The store holding `C` for entities of this segment, if the segment
    /// has `C` at all.
    pub fn store<C: Component>(&self) -> Option<Arc<RwLock<Store<C>>>> {
        if !self.segment.mask().has(Metadata::component::<C>().index) {
            return None;
        }
        self.world.store_in::<C>(self.segment)
    }
}

// ---------------------------------------------------------------------------
// Queryable / Querier
// ---------------------------------------------------------------------------

/// A shape that can be matched against segments.
pub trait Queryable: Send + Sync + Sized + 'static {
    /// Structural matching, used when no querier is registered or declared.
    fn try_query(context: &Context) -> Option<Query<Self>>;

    /// A default querier declared by the shape itself.
    fn querier() -> Option<Arc<dyn Querier<Self>>> {
        None
    }
}

/// Custom matching logic for a shape, registered with [`Queriers::set`].
pub trait Querier<T>: Send + Sync + 'static {
    fn try_query(&self, context: &Context) -> Option<Query<T>>;
}

impl<T, F> Querier<T> for F
where
    F: Fn(&Context) -> Option<Query<T>> + Send + Sync + 'static,
{
    fn try_query(&self, context: &Context) -> Option<Query<T>> {
        self(context)
    }
}

struct Structural;

impl<Q: Queryable> Querier<Q> for Structural {
    fn try_query(&self, context: &Context) -> Option<Query<Q>> {
        Q::try_query(context)
    }
}

// ---------------------------------------------------------------------------
// Queriers
// ---------------------------------------------------------------------------

type CacheKey = (TypeId, usize);

/// Querier registry plus the per-`(shape, segment)` result cache.
pub struct Queriers {
    capabilities: Capabilities,
    cache: RwLock<HashMap<CacheKey, Arc<dyn std::any::Any + Send + Sync>>>,
}

impl Queriers {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new("querier"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Override matching for `Q`. Clears the cache.
    pub fn set<Q: Queryable>(&self, querier: impl Querier<Q>) -> bool {
        let querier: Arc<dyn Querier<Q>> = Arc::new(querier);
        let added = self.capabilities.set::<Q, _>(querier);
        self.cache.write().clear();
        added
    }

    pub fn has<Q: Queryable>(&self) -> bool {
        self.capabilities.has::<Q>()
    }

    pub fn remove<Q: Queryable>(&self) -> bool {
        let removed = self.capabilities.remove::<Q>();
        if removed {
            self.cache.write().clear();
        }
        removed
    }

    /// Match `Q` against the context's segment.
    pub fn query<Q: Queryable>(&self, context: &Context) -> Option<Query<Q>> {
        let key = (TypeId::of::<Q>(), context.segment().index());
        if let Some(cached) = self.cache.read().get(&key) {
            return cached.downcast_ref::<Option<Query<Q>>>().cloned().flatten();
        }

        // Computed without holding the cache lock: shapes recurse into it.
        let querier = self.capabilities.get::<Q, Arc<dyn Querier<Q>>>(Q::querier, || {
            Some(Arc::new(Structural) as Arc<dyn Querier<Q>>)
        });
        let query = match querier {
            Ok(querier) => querier.try_query(context),
            Err(error) => {
                tracing::warn!(%error, "querier lookup failed");
                None
            }
        };
        self.cache.write().insert(key, Arc::new(query.clone()));
        query
    }

    /// Number of cached `(shape, segment)` results.
    pub fn cached(&self) -> usize {
        self.cache.read().len()
    }
}

impl Default for Queriers {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

impl Queryable for Entity {
    fn try_query(_: &Context) -> Option<Query<Self>> {
        Some(Query::new(Vec::new(), |entity, _| entity))
    }
}

/// Shared access to one entity's `C`.
pub struct Read<C: Component> {
    store: Arc<RwLock<Store<C>>>,
    key: Key,
}

impl<C: Component> Read<C> {
    pub fn entity(&self) -> Entity {
        self.key.entity
    }

    /// A copy of the current value.
    pub fn get(&self) -> Option<C> {
        self.store.read().try_get(self.key).cloned()
    }

    pub fn with<R>(&self, read: impl FnOnce(&C) -> R) -> Option<R> {
        self.store.read().try_get(self.key).map(read)
    }
}

impl<C: Component> Queryable for Read<C> {
    fn try_query(context: &Context) -> Option<Query<Self>> {
        let store = context.store::<C>()?;
        Some(Query::new(vec![Metadata::component::<C>()], move |entity, slot| Read {
            store: store.clone(),
            key: Key::new(entity, slot),
        }))
    }
}

/// Exclusive access to one entity's `C`.
pub struct Write<C: Component> {
    store: Arc<RwLock<Store<C>>>,
    key: Key,
}

impl<C: Component> Write<C> {
    pub fn entity(&self) -> Entity {
        self.key.entity
    }

    pub fn get(&self) -> Option<C> {
        self.store.read().try_get(self.key).cloned()
    }

    pub fn with<R>(&self, read: impl FnOnce(&C) -> R) -> Option<R> {
        self.store.read().try_get(self.key).map(read)
    }

    /// Overwrite the value. Returns `false` if the entity no longer holds `C`.
    pub fn set(&self, value: C) -> bool {
        match self.store.write().try_get_mut(self.key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Mutate the value in place.
    pub fn update<R>(&self, update: impl FnOnce(&mut C) -> R) -> Option<R> {
        self.store.write().try_get_mut(self.key).map(update)
    }
}

impl<C: Component> Queryable for Write<C> {
    fn try_query(context: &Context) -> Option<Query<Self>> {
        let store = context.store::<C>()?;
        Some(Query::new(vec![Metadata::component::<C>()], move |entity, slot| Write {
            store: store.clone(),
            key: Key::new(entity, slot),
        }))
    }
}

/// Optional sub-shape. Always matches.
pub struct Maybe<Q>(pub Option<Q>);

impl<Q> Maybe<Q> {
    pub fn has(&self) -> bool {
        self.0.is_some()
    }

    pub fn value(&self) -> Option<&Q> {
        self.0.as_ref()
    }

    pub fn into_option(self) -> Option<Q> {
        self.0
    }
}

impl<Q: Queryable> Queryable for Maybe<Q> {
    fn try_query(context: &Context) -> Option<Query<Self>> {
        Some(match context.query::<Q>() {
            Some(inner) => {
                let types = inner.types().to_vec();
                Query::new(types, move |entity, slot| Maybe(Some(inner.get(entity, slot))))
            }
            None => Query::new(Vec::new(), |_, _| Maybe(None)),
        })
    }
}

macro_rules! all_queryable {
    ($($name:ident),+) => {
        impl<$($name: Queryable),+> Queryable for ($($name,)+) {
            #[allow(non_snake_case)]
            fn try_query(context: &Context) -> Option<Query<Self>> {
                $(let $name = context.query::<$name>()?;)+
                let mut types = Vec::new();
                $(types.extend_from_slice($name.types());)+
                types.sort();
                types.dedup();
                Some(Query::new(types, move |entity, slot| ($($name.get(entity, slot),)+)))
            }
        }
    };
}

all_queryable!(A);
all_queryable!(A, B);
all_queryable!(A, B, C);
all_queryable!(A, B, C, D);
all_queryable!(A, B, C, D, E);
all_queryable!(A, B, C, D, E, F);

/// Alternatives over a tuple of [`Maybe`] shapes. The first alternative that
/// matches (left to right) is populated, the others are `None`.
pub struct Any<T>(pub T);

impl<T> Any<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

macro_rules! any_queryable {
    ($($name:ident),+) => {
        impl<$($name: Queryable),+> Queryable for Any<($(Maybe<$name>,)+)> {
            #[allow(non_snake_case)]
            fn try_query(context: &Context) -> Option<Query<Self>> {
                let mut matched = false;
                $(
                    let $name = if matched {
                        None
                    } else {
                        let query = context.query::<$name>();
                        matched = query.is_some();
                        query
                    };
                )+
                if !matched {
                    return None;
                }
                let mut types = Vec::new();
                $(if let Some(query) = &$name { types.extend_from_slice(query.types()); })+
                Some(Query::new(types, move |entity, slot| {
                    Any(($(Maybe($name.as_ref().map(|query| query.get(entity, slot))),)+))
                }))
            }
        }
    };
}

any_queryable!(A, B);
any_queryable!(A, B, C);
any_queryable!(A, B, C, D);
any_queryable!(A, B, C, D, E);
any_queryable!(A, B, C, D, E, F);

/// Filter: the segment holds `K`, or any declared implementor of `K`.
pub struct Has<K: ?Sized>(PhantomData<fn(&K)>);

impl<K: ?Sized + 'static> Queryable for Has<K> {
    fn try_query(context: &Context) -> Option<Query<Self>> {
        context
            .segment()
            .mask()
            .has_any(&mask_of::<K>())
            .then(|| Query::new(Vec::new(), |_, _| Has(PhantomData)))
    }
}

/// Filter: the segment holds neither `K` nor any implementor of it.
pub struct Not<K: ?Sized>(PhantomData<fn(&K)>);

impl<K: ?Sized + 'static> Queryable for Not<K> {
    fn try_query(context: &Context) -> Option<Query<Self>> {
        context
            .segment()
            .mask()
            .has_none(&mask_of::<K>())
            .then(|| Query::new(Vec::new(), |_, _| Not(PhantomData)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Storage;

    #[derive(Debug, Clone, PartialEq)]
    struct A(i32);
    impl Component for A {}

    #[derive(Debug, Clone, PartialEq)]
    struct B(i32);
    impl Component for B {
        const STORAGE: Storage = Storage::Dictionary;
    }

    #[derive(Debug, Clone, PartialEq)]
    struct C(i32);
    impl Component for C {}

    fn segment_of(world: &World, entity: Entity) -> Arc<Segment> {
        world.segment_of(entity).unwrap()
    }

    fn matches<Q: Queryable>(world: &World, segment: &Arc<Segment>) -> bool {
        Context::new(world, segment).query::<Q>().is_some()
    }

    // -- composition laws ---------------------------------------------------

    #[test]
    fn all_requires_every_element() {
        let world = World::new();
        let entity = world.spawn((A(1), B(2)));
        let segment = segment_of(&world, entity);

        assert!(matches::<(Read<A>, Read<B>)>(&world, &segment));
        assert!(!matches::<(Read<A>, Read<C>)>(&world, &segment));
        assert!(matches::<Maybe<Read<C>>>(&world, &segment));
        assert!(matches::<Any<(Maybe<Read<C>>, Maybe<Read<A>>)>>(&world, &segment));
        assert!(!matches::<Any<(Maybe<Read<C>>, Maybe<Write<C>>)>>(&world, &segment));
    }

    #[test]
    fn accessors_read_and_write_through_stores() {
        let world = World::new();
        let entity = world.spawn((A(1), B(2)));
        let segment = segment_of(&world, entity);
        let slot = world.slot_of(entity).unwrap();

        let query = Context::new(&world, &segment)
            .query::<(Entity, Write<A>, Read<B>)>()
            .unwrap();
        let (found, a, b) = query.get(entity, slot);
        assert_eq!(found, entity);
        assert_eq!(b.get(), Some(B(2)));
        assert!(a.set(A(10)));
        a.update(|value| value.0 += 1);
        assert_eq!(world.get::<A>(entity), Some(A(11)));
        assert_eq!(query.types().len(), 2);
    }

    #[test]
    fn any_populates_first_match_only() {
        let world = World::new();
        let entity = world.spawn((A(1), C(3)));
        let segment = segment_of(&world, entity);
        let slot = world.slot_of(entity).unwrap();

        let query = Context::new(&world, &segment)
            .query::<Any<(Maybe<Read<B>>, Maybe<Read<C>>, Maybe<Read<A>>)>>()
            .unwrap();
        let Any((b, c, a)) = query.get(entity, slot);
        assert!(!b.has());
        assert_eq!(c.value().and_then(Read::get), Some(C(3)));
        assert!(!a.has());
    }

    #[test]
    fn filters_use_abstract_masks() {
        trait Marker {}
        crate::component::implement::<dyn Marker, C>();

        let world = World::new();
        let with_c = segment_of(&world, world.spawn((A(0), C(0))));
        let without = segment_of(&world, world.spawn((A(0),)));

        assert!(matches::<Has<dyn Marker>>(&world, &with_c));
        assert!(!matches::<Has<dyn Marker>>(&world, &without));
        assert!(matches::<Not<dyn Marker>>(&world, &without));
        assert!(matches::<(Read<A>, Not<C>)>(&world, &without));
    }

    #[test]
    fn results_are_cached_per_segment() {
        let world = World::new();
        let segment = segment_of(&world, world.spawn((A(0),)));
        let before = world.queriers().cached();
        assert!(matches::<Read<A>>(&world, &segment));
        assert!(matches::<Read<A>>(&world, &segment));
        assert_eq!(world.queriers().cached(), before + 1);
    }

    #[test]
    fn registered_querier_overrides_structural_matching() {
        fn reject(_: &Context) -> Option<Query<Read<A>>> {
            None
        }

        let world = World::new();
        let segment = segment_of(&world, world.spawn((A(0),)));
        world.queriers().set::<Read<A>>(reject);
        assert!(!matches::<Read<A>>(&world, &segment));
        assert!(world.queriers().remove::<Read<A>>());
        assert!(matches::<Read<A>>(&world, &segment));
    }
}
