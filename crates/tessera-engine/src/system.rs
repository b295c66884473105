//! Systems and dependency injection.
//!
//! A system is a plain struct holding handles into the world (groups,
//! emitters, receivers, resources). The scheduler creates one instance per
//! system node by *injecting* those handles, then calls the handlers the
//! system registered for each phase.
//!
//! ```
//! use tessera_engine::prelude::*;
//!
//! #[derive(Debug, Clone)]
//! struct Position(f32);
//! impl Component for Position {}
//!
//! #[derive(Debug, Clone)]
//! struct Velocity(f32);
//! impl Component for Velocity {}
//!
//! struct Motion {
//!     bodies: Group<(Write<Position>, Read<Velocity>)>,
//! }
//!
//! impl System for Motion {
//!     fn inject(context: &Context) -> Result<Self, Error> {
//!         Ok(Self { bodies: context.inject()? })
//!     }
//!
//!     fn phases(phases: &mut Phases<Self>) {
//!         phases.on(|motion: &mut Self, _: &Run| {
//!             motion.bodies.each(|(position, velocity)| {
//!                 if let Some(v) = velocity.get() {
//!                     position.update(|p| p.0 += v.0);
//!                 }
//!             });
//!         });
//!     }
//!
//!     fn depend(dependers: &Dependers) -> Vec<Dependency> {
//!         dependers.of::<Group<(Write<Position>, Read<Velocity>)>>()
//!     }
//! }
//!
//! let world = World::new();
//! let entity = world.spawn((Position(0.0), Velocity(2.0)));
//! let scheduler = Scheduler::new(world.clone(), Node::system::<Motion>());
//! assert!(scheduler.run(&Run).unwrap());
//! assert_eq!(world.get::<Position>(entity).map(|p| p.0), Some(2.0));
//! ```

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_ecs::boxes::Resource;
use tessera_ecs::capability::Capabilities;
use tessera_ecs::group::Group;
use tessera_ecs::message::{Emitter, Message, Receiver};
use tessera_ecs::query::Queryable;
use tessera_ecs::resolver::Defer;
use tessera_ecs::world::World;

use crate::dependency::{Dependency, Dependers};
use crate::node::Node;
use crate::phase::Phase;
use crate::Error;

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

pub trait System: Send + Sized + 'static {
    /// Build the instance, usually by injecting each field.
    fn inject(context: &Context) -> Result<Self, Error>;

    /// Register the handlers this system runs, per phase.
    fn phases(phases: &mut Phases<Self>);

    /// What the system touches. Systems that do not say are assumed to touch
    /// anything, so they never run in parallel with another node.
    fn depend(_: &Dependers) -> Vec<Dependency> {
        vec![Dependency::Unknown]
    }
}

type Handler<S> = Arc<dyn Fn(&mut S, &(dyn Any + Send + Sync)) + Send + Sync>;

/// Phase handlers of a system type, in registration order.
pub struct Phases<S> {
    handlers: Vec<(TypeId, Handler<S>)>,
}

impl<S: 'static> Phases<S> {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Run `handler` whenever the scheduler runs phase `P`. Several handlers
    /// for the same phase run in registration order.
    pub fn on<P: Phase>(
        &mut self,
        handler: impl Fn(&mut S, &P) + Send + Sync + 'static,
    ) -> &mut Self {
        let handler: Handler<S> = Arc::new(move |system: &mut S, phase: &(dyn Any + Send + Sync)| {
            if let Some(phase) = phase.downcast_ref::<P>() {
                handler(system, phase);
            }
        });
        self.handlers.push((TypeId::of::<P>(), handler));
        self
    }

    pub fn has(&self, phase: TypeId) -> bool {
        self.handlers.iter().any(|(id, _)| *id == phase)
    }

    pub(crate) fn handlers(&self, phase: TypeId) -> Vec<Handler<S>> {
        self.handlers
            .iter()
            .filter(|(id, _)| *id == phase)
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// One injected system and its handlers, shared by the runners of every phase.
pub(crate) struct Instance<S> {
    pub(crate) system: Mutex<S>,
    pub(crate) phases: Phases<S>,
}

impl<S: System> Instance<S> {
    pub(crate) fn create(context: &Context) -> Result<Self, Error> {
        let system = context.injectors.system::<S>(context)?;
        let mut phases = Phases::new();
        S::phases(&mut phases);
        Ok(Self {
            system: Mutex::new(system),
            phases,
        })
    }
}

// ---------------------------------------------------------------------------
// Injection
// ---------------------------------------------------------------------------

/// What an injected value can see while it is being created.
pub struct Context<'a> {
    world: &'a World,
    injectors: &'a Injectors,
    node: &'a Node,
}

impl<'a> Context<'a> {
    pub fn new(world: &'a World, injectors: &'a Injectors, node: &'a Node) -> Self {
        Self {
            world,
            injectors,
            node,
        }
    }

    pub fn world(&self) -> &'a World {
        self.world
    }

    /// The system node being instantiated.
    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn inject<T: Inject>(&self) -> Result<T, Error> {
        self.injectors.inject::<T>(self)
    }
}

/// A value that can be created from the world for a system field.
pub trait Inject: Sized + 'static {
    fn inject(context: &Context) -> Result<Self, Error>;

    fn injector() -> Option<Arc<dyn Injector<Self>>> {
        None
    }
}

pub trait Injector<T>: Send + Sync + 'static {
    fn inject(&self, context: &Context) -> Result<T, Error>;
}

impl<T, F> Injector<T> for F
where
    F: Fn(&Context) -> Result<T, Error> + Send + Sync + 'static,
{
    fn inject(&self, context: &Context) -> Result<T, Error> {
        self(context)
    }
}

struct Declared<T>(PhantomData<fn() -> T>);

impl<T: Inject> Injector<T> for Declared<T> {
    fn inject(&self, context: &Context) -> Result<T, Error> {
        T::inject(context)
    }
}

struct Instantiate<S>(PhantomData<fn() -> S>);

impl<S: System> Injector<S> for Instantiate<S> {
    fn inject(&self, context: &Context) -> Result<S, Error> {
        S::inject(context)
    }
}

/// Registry of injectors, keyed by the injected type.
#[derive(Debug)]
pub struct Injectors {
    capabilities: Capabilities,
}

impl Injectors {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new("injector"),
        }
    }

    /// Override how `T` (a handle type or a whole system type) is created.
    pub fn set<T: 'static>(&self, injector: impl Injector<T>) -> bool {
        self.capabilities
            .set::<T, Arc<dyn Injector<T>>>(Arc::new(injector))
    }

    pub fn has<T: 'static>(&self) -> bool {
        self.capabilities.has::<T>()
    }

    pub fn remove<T: 'static>(&self) -> bool {
        self.capabilities.remove::<T>()
    }

    pub fn inject<T: Inject>(&self, context: &Context) -> Result<T, Error> {
        let injector = self.capabilities.get::<T, Arc<dyn Injector<T>>>(T::injector, || {
            Some(Arc::new(Declared::<T>(PhantomData)) as Arc<dyn Injector<T>>)
        })?;
        injector.inject(context)
    }

    /// Create the system `S`: its registration, else [`System::inject`].
    pub fn system<S: System>(&self, context: &Context) -> Result<S, Error> {
        let injector = self.capabilities.get::<S, Arc<dyn Injector<S>>>(
            || Some(Arc::new(Instantiate::<S>(PhantomData)) as Arc<dyn Injector<S>>),
            || None,
        )?;
        injector.inject(context)
    }

    pub fn version(&self) -> usize {
        self.capabilities.version()
    }
}

impl Default for Injectors {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in injections
// ---------------------------------------------------------------------------

impl Inject for World {
    fn inject(context: &Context) -> Result<Self, Error> {
        Ok(context.world().clone())
    }
}

impl<Q: Queryable> Inject for Group<Q> {
    fn inject(context: &Context) -> Result<Self, Error> {
        Ok(context.world().group::<Q>())
    }
}

impl<M: Message> Inject for Emitter<M> {
    fn inject(context: &Context) -> Result<Self, Error> {
        Ok(context.world().messages().emitter::<M>())
    }
}

impl<M: Message> Inject for Receiver<M> {
    fn inject(context: &Context) -> Result<Self, Error> {
        Ok(context.world().messages().receiver::<M>())
    }
}

impl<T: Default + Send + Sync + 'static> Inject for Resource<T> {
    fn inject(context: &Context) -> Result<Self, Error> {
        Ok(context.world().resource::<T>())
    }
}

impl Inject for Defer {
    fn inject(context: &Context) -> Result<Self, Error> {
        Ok(context.world().deferrer())
    }
}

macro_rules! tuple_inject {
    ($($t:ident),+) => {
        impl<$($t: Inject),+> Inject for ($($t,)+) {
            fn inject(context: &Context) -> Result<Self, Error> {
                Ok(($(context.inject::<$t>()?,)+))
            }
        }
    };
}

tuple_inject!(A);
tuple_inject!(A, B);
tuple_inject!(A, B, C);
tuple_inject!(A, B, C, D);
tuple_inject!(A, B, C, D, E);
tuple_inject!(A, B, C, D, E, F);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Dispose, Run};
    use tessera_ecs::component::Component;
    use tessera_ecs::query::Read;

    #[derive(Clone)]
    struct Score(u32);
    impl Component for Score {}

    #[derive(Clone)]
    struct Scored;
    impl Message for Scored {}

    struct Counter {
        scores: Group<Read<Score>>,
        scored: Emitter<Scored>,
        runs: usize,
    }

    impl System for Counter {
        fn inject(context: &Context) -> Result<Self, Error> {
            let (scores, scored) = context.inject()?;
            Ok(Self {
                scores,
                scored,
                runs: 0,
            })
        }

        fn phases(phases: &mut Phases<Self>) {
            phases
                .on(|counter: &mut Self, _: &Run| counter.runs += 1)
                .on(|counter: &mut Self, _: &Run| counter.scored.emit(Scored));
        }
    }

    #[test]
    fn instances_inject_fields_and_collect_handlers() {
        let world = World::new();
        world.spawn((Score(3),));
        let injectors = Injectors::new();
        let node = Node::system::<Counter>();
        let context = Context::new(&world, &injectors, &node);

        let instance = Instance::<Counter>::create(&context).unwrap();
        assert_eq!(instance.system.lock().scores.count(), 1);
        assert!(instance.phases.has(TypeId::of::<Run>()));
        assert!(!instance.phases.has(TypeId::of::<Dispose>()));

        let received = world.messages().receiver::<Scored>();
        let handlers = instance.phases.handlers(TypeId::of::<Run>());
        assert_eq!(handlers.len(), 2);
        let mut system = instance.system.lock();
        for handler in &handlers {
            handler(&mut *system, &Run);
        }
        assert_eq!(system.runs, 1);
        assert_eq!(received.len(), 1);
    }

    #[test]
    fn registered_injectors_take_precedence() {
        let world = World::new();
        let injectors = Injectors::new();
        let node = Node::system::<Counter>();
        let context = Context::new(&world, &injectors, &node);

        fn disabled(_: &Context) -> Result<Counter, Error> {
            Err(Error::Inject {
                system: "Counter",
                reason: "disabled".into(),
            })
        }
        injectors.set::<Counter>(disabled);
        assert!(matches!(
            Instance::<Counter>::create(&context),
            Err(Error::Inject { .. })
        ));
        assert!(injectors.remove::<Counter>());
        assert!(Instance::<Counter>::create(&context).is_ok());
    }
}
