//! Deferred structural mutations.
//!
//! Systems that run while groups are being iterated must not change segment
//! membership directly. They enqueue [`Resolvable`] values instead; the world
//! drains the queue at resolve points.
//!
//! Values of the same type are packed together in one queue, while a shared
//! order list keeps global FIFO order across types. Items enqueued *while*
//! the queue drains are processed in the same [`Resolvers::resolve`] call.
//! Debug builds cap the number of items drained per call.

use crate::capability::Capabilities;
use crate::component::Component;
use crate::entity::Entity;
use crate::world::World;
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Resolvable / Resolver
// ---------------------------------------------------------------------------

/// A deferred action.
pub trait Resolvable: Send + Sized + 'static {
    /// Default action, used when no resolver is registered or declared.
    fn resolve(self, world: &World);

    /// A resolver declared by the type itself.
    fn resolver() -> Option<Arc<dyn Resolver<Self>>> {
        None
    }
}

/// Custom handling for a resolvable type, registered with [`Resolvers::set`].
pub trait Resolver<T>: Send + Sync + 'static {
    fn resolve(&self, item: T, world: &World);
}

impl<T, F> Resolver<T> for F
where
    F: Fn(T, &World) + Send + Sync + 'static,
{
    fn resolve(&self, item: T, world: &World) {
        self(item, world)
    }
}

struct Direct;

impl<T: Resolvable> Resolver<T> for Direct {
    fn resolve(&self, item: T, world: &World) {
        item.resolve(world)
    }
}

// ---------------------------------------------------------------------------
// Packs
// ---------------------------------------------------------------------------

trait Pack: Send + Sync {
    fn resolve_next(&self, world: &World, capabilities: &Capabilities);
    fn len(&self) -> usize;
    fn clear(&self);
    fn as_any(&self) -> &dyn Any;
}

struct Packed<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T: Resolvable> Pack for Packed<T> {
    fn resolve_next(&self, world: &World, capabilities: &Capabilities) {
        let Some(item) = self.items.lock().pop_front() else {
            return;
        };
        let resolver = capabilities.get::<T, Arc<dyn Resolver<T>>>(T::resolver, || {
            Some(Arc::new(Direct) as Arc<dyn Resolver<T>>)
        });
        match resolver {
            Ok(resolver) => resolver.resolve(item, world),
            Err(error) => tracing::warn!(%error, "resolvable dropped"),
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn clear(&self) {
        self.items.lock().clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct Queue {
    order: VecDeque<usize>,
    packs: Vec<Arc<dyn Pack>>,
    lookup: HashMap<TypeId, usize>,
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

pub struct Resolvers {
    capabilities: Capabilities,
    queue: Mutex<Queue>,
    limit: usize,
}

impl Resolvers {
    /// `limit` bounds the items drained per call in debug builds.
    pub fn new(limit: usize) -> Self {
        Self {
            capabilities: Capabilities::new("resolver"),
            queue: Mutex::new(Queue::default()),
            limit,
        }
    }

    /// Override how `T` is resolved.
    pub fn set<T: Resolvable>(&self, resolver: impl Resolver<T>) -> bool {
        let resolver: Arc<dyn Resolver<T>> = Arc::new(resolver);
        self.capabilities.set::<T, _>(resolver)
    }

    pub fn has<T: Resolvable>(&self) -> bool {
        self.capabilities.has::<T>()
    }

    pub fn remove<T: Resolvable>(&self) -> bool {
        self.capabilities.remove::<T>()
    }

    /// Enqueue `item` behind everything already deferred.
    pub fn defer<T: Resolvable>(&self, item: T) {
        let mut queue = self.queue.lock();
        let index = match queue.lookup.get(&TypeId::of::<T>()) {
            Some(&index) => index,
            None => {
                let index = queue.packs.len();
                queue.packs.push(Arc::new(Packed::<T> {
                    items: Mutex::new(VecDeque::new()),
                }));
                queue.lookup.insert(TypeId::of::<T>(), index);
                index
            }
        };
        if let Some(packed) = queue.packs[index].as_any().downcast_ref::<Packed<T>>() {
            packed.items.lock().push_back(item);
            queue.order.push_back(index);
        }
    }

    /// Enqueue a closure.
    pub fn defer_with(&self, action: impl FnOnce(&World) + Send + 'static) {
        self.defer(Deferred(Box::new(action)));
    }

    /// Drain the queue in FIFO order. Returns the number of items resolved.
    pub fn resolve(&self, world: &World) -> usize {
        let mut count = 0;
        loop {
            let pack = {
                let mut queue = self.queue.lock();
                if cfg!(debug_assertions) && count >= self.limit && !queue.order.is_empty() {
                    tracing::error!(
                        limit = self.limit,
                        pending = queue.order.len(),
                        "resolve limit reached; remaining items stay queued"
                    );
                    break;
                }
                let Some(index) = queue.order.pop_front() else {
                    break;
                };
                queue.packs[index].clone()
            };
            pack.resolve_next(world, &self.capabilities);
            count += 1;
        }
        if count > 0 {
            tracing::trace!(count, "resolvables drained");
        }
        count
    }

    /// Number of pending items.
    pub fn len(&self) -> usize {
        self.queue.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending item without resolving it.
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.order.clear();
        for pack in &queue.packs {
            pack.clear();
        }
    }
}

impl fmt::Debug for Resolvers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.queue.lock();
        let packed: usize = queue.packs.iter().map(|pack| pack.len()).sum();
        f.debug_struct("Resolvers")
            .field("pending", &queue.order.len())
            .field("packed", &packed)
            .field("limit", &self.limit)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in resolvables
// ---------------------------------------------------------------------------

/// Destroy an entity.
#[derive(Debug, Clone, Copy)]
pub struct Destroy(pub Entity);

impl Resolvable for Destroy {
    fn resolve(self, world: &World) {
        world.destroy(self.0);
    }
}

/// Attach (or overwrite) a component.
#[derive(Debug, Clone)]
pub struct Insert<C: Component> {
    pub entity: Entity,
    pub value: C,
}

impl<C: Component> Resolvable for Insert<C> {
    fn resolve(self, world: &World) {
        if let Err(error) = world.set(self.entity, self.value) {
            tracing::warn!(%error, "deferred insert skipped");
        }
    }
}

/// Detach a component.
pub struct Remove<C: Component>(pub Entity, PhantomData<fn() -> C>);

impl<C: Component> Remove<C> {
    pub fn new(entity: Entity) -> Self {
        Self(entity, PhantomData)
    }
}

impl<C: Component> Resolvable for Remove<C> {
    fn resolve(self, world: &World) {
        world.remove::<C>(self.0);
    }
}

/// An arbitrary deferred closure.
pub struct Deferred(Box<dyn FnOnce(&World) + Send>);

impl Resolvable for Deferred {
    fn resolve(self, world: &World) {
        (self.0)(world)
    }
}

/// Cloneable handle for deferring work against one world.
#[derive(Clone)]
pub struct Defer {
    world: World,
}

impl Defer {
    pub fn new(world: World) -> Self {
        Self { world }
    }

    pub fn defer<T: Resolvable>(&self, item: T) {
        self.world.resolvers().defer(item);
    }

    pub fn with(&self, action: impl FnOnce(&World) + Send + 'static) {
        self.world.resolvers().defer_with(action);
    }

    pub fn destroy(&self, entity: Entity) {
        self.defer(Destroy(entity));
    }

    pub fn insert<C: Component>(&self, entity: Entity, value: C) {
        self.defer(Insert { entity, value });
    }

    pub fn remove<C: Component>(&self, entity: Entity) {
        self.defer(Remove::<C>::new(entity));
    }
}

impl fmt::Debug for Defer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Defer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Log(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl Resolvable for Log {
        fn resolve(self, _: &World) {
            self.1.lock().push(self.0);
        }
    }

    #[test]
    fn fifo_across_types() {
        let world = World::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let resolvers = world.resolvers();

        resolvers.defer(Log("d1", log.clone()));
        let closure_log = log.clone();
        resolvers.defer_with(move |_| closure_log.lock().push("d2"));
        resolvers.defer(Log("d3", log.clone()));

        assert_eq!(resolvers.len(), 3);
        assert_eq!(resolvers.resolve(&world), 3);
        assert_eq!(*log.lock(), vec!["d1", "d2", "d3"]);
        assert!(resolvers.is_empty());
        assert_eq!(resolvers.resolve(&world), 0);
    }

    #[test]
    fn re_entrant_items_drain_in_the_same_call() {
        let world = World::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        world.resolvers().defer_with(move |world| {
            inner.fetch_add(1, Ordering::SeqCst);
            let again = inner.clone();
            world
                .resolvers()
                .defer_with(move |_| {
                    again.fetch_add(1, Ordering::SeqCst);
                });
        });
        assert_eq!(world.resolvers().resolve(&world), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn registered_resolver_overrides_default() {
        let world = World::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = log.clone();
        world
            .resolvers()
            .set::<Log>(move |item: Log, _: &World| seen.lock().push(if item.0 == "a" { "override" } else { "other" }));
        world.resolvers().defer(Log("a", log.clone()));
        world.resolvers().resolve(&world);
        assert_eq!(*log.lock(), vec!["override"]);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn debug_limit_stops_runaway_cascades() {
        fn cascade(world: &World) {
            world.resolvers().defer_with(cascade);
        }
        let world = World::with_config(crate::world::WorldConfig {
            resolve_limit: 16,
            ..Default::default()
        });
        world.resolvers().defer_with(cascade);
        assert_eq!(world.resolvers().resolve(&world), 16);
        assert_eq!(world.resolvers().len(), 1);
        world.resolvers().clear();
        assert!(world.resolvers().is_empty());
    }
}
