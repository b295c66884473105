//! Declared data dependencies and conflict detection.
//!
//! Every handle a system can hold (groups, emitters, receivers, resources)
//! implements [`Depend`], describing which component types it reads or writes
//! and which messages it emits or reacts to. The scheduler compares these
//! sets to decide which nodes may run at the same time.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tessera_ecs::boxes::Resource;
use tessera_ecs::capability::Capabilities;
use tessera_ecs::component::{Component, Metadata};
use tessera_ecs::entity::Entity;
use tessera_ecs::group::Group;
use tessera_ecs::message::{Emitter, Message, Receiver};
use tessera_ecs::query::{Any, Has, Maybe, Not, Queryable, Read, Write};
use tessera_ecs::resolver::Defer;
use tessera_ecs::world::World;

use crate::system::System;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// Touches the world in ways that cannot be described; never parallel.
    Unknown,
    Read(Metadata),
    Write(Metadata),
    Emit(Metadata),
    React(Metadata),
}

impl Dependency {
    pub fn read<T: ?Sized + 'static>() -> Self {
        Self::Read(Metadata::of::<T>())
    }

    pub fn write<T: ?Sized + 'static>() -> Self {
        Self::Write(Metadata::of::<T>())
    }

    pub fn emit<M: Message>() -> Self {
        Self::Emit(Metadata::of::<M>())
    }

    pub fn react<M: Message>() -> Self {
        Self::React(Metadata::of::<M>())
    }

    /// The type this dependency is about, `None` for [`Dependency::Unknown`].
    pub fn target(&self) -> Option<Metadata> {
        match *self {
            Self::Unknown => None,
            Self::Read(meta) | Self::Write(meta) | Self::Emit(meta) | Self::React(meta) => {
                Some(meta)
            }
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown"),
            Self::Read(meta) => write!(f, "Read({meta})"),
            Self::Write(meta) => write!(f, "Write({meta})"),
            Self::Emit(meta) => write!(f, "Emit({meta})"),
            Self::React(meta) => write!(f, "React({meta})"),
        }
    }
}

/// Append `more` to `into`, skipping entries already present.
pub fn merge(into: &mut Vec<Dependency>, more: impl IntoIterator<Item = Dependency>) {
    for dependency in more {
        if !into.contains(&dependency) {
            into.push(dependency);
        }
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    Unknown,
    WriteWrite,
    WriteRead,
    ReadWrite,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown access",
            Self::WriteWrite => "both write",
            Self::WriteRead => "left writes what right reads",
            Self::ReadWrite => "left reads what right writes",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictKind,
    /// The contended type; `None` for [`ConflictKind::Unknown`].
    pub target: Option<Metadata>,
}

/// First reason the two dependency sets cannot run concurrently, if any.
///
/// Emits and reacts never conflict on their own; the analyzers fold the
/// dependencies of reacting systems into the emitter instead.
pub fn conflict(left: &[Dependency], right: &[Dependency]) -> Option<Conflict> {
    if left.contains(&Dependency::Unknown) || right.contains(&Dependency::Unknown) {
        return Some(Conflict {
            kind: ConflictKind::Unknown,
            target: None,
        });
    }
    for l in left {
        for r in right {
            let kind = match (l, r) {
                (Dependency::Write(a), Dependency::Write(b)) if a == b => ConflictKind::WriteWrite,
                (Dependency::Write(a), Dependency::Read(b)) if a == b => ConflictKind::WriteRead,
                (Dependency::Read(a), Dependency::Write(b)) if a == b => ConflictKind::ReadWrite,
                _ => continue,
            };
            return Some(Conflict {
                kind,
                target: l.target(),
            });
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Depend / Depender / Dependers
// ---------------------------------------------------------------------------

/// Structural dependency description of a type.
pub trait Depend: 'static {
    fn depend(dependers: &Dependers) -> Vec<Dependency>;

    /// A custom depender declared by the type itself, consulted before
    /// [`Depend::depend`].
    fn depender() -> Option<Arc<dyn Depender>> {
        None
    }
}

pub trait Depender: Send + Sync + 'static {
    fn depend(&self, dependers: &Dependers) -> Vec<Dependency>;
}

impl<F> Depender for F
where
    F: Fn(&Dependers) -> Vec<Dependency> + Send + Sync + 'static,
{
    fn depend(&self, dependers: &Dependers) -> Vec<Dependency> {
        self(dependers)
    }
}

struct Structural<T>(PhantomData<fn() -> T>);

impl<T: Depend> Depender for Structural<T> {
    fn depend(&self, dependers: &Dependers) -> Vec<Dependency> {
        T::depend(dependers)
    }
}

/// Registry of dependency descriptions, keyed by type.
#[derive(Debug)]
pub struct Dependers {
    capabilities: Capabilities,
}

impl Dependers {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new("depender"),
        }
    }

    /// Override the dependencies reported for `T`.
    pub fn set<T: ?Sized + 'static>(&self, depender: impl Depender) -> bool {
        self.capabilities
            .set::<T, Arc<dyn Depender>>(Arc::new(depender))
    }

    pub fn has<T: ?Sized + 'static>(&self) -> bool {
        self.capabilities.has::<T>()
    }

    pub fn remove<T: ?Sized + 'static>(&self) -> bool {
        self.capabilities.remove::<T>()
    }

    /// Dependencies of `T`: its registration, else its declared depender,
    /// else its structural description.
    pub fn of<T: Depend>(&self) -> Vec<Dependency> {
        let depender = self.capabilities.get::<T, Arc<dyn Depender>>(T::depender, || {
            Some(Arc::new(Structural::<T>(PhantomData)) as Arc<dyn Depender>)
        });
        self.run(depender)
    }

    /// Dependencies of the system type `S`: its registration, else
    /// [`System::depend`].
    pub fn system<S: System>(&self) -> Vec<Dependency> {
        let depender = self.capabilities.get::<S, Arc<dyn Depender>>(
            || Some(Arc::new(S::depend) as Arc<dyn Depender>),
            || None,
        );
        self.run(depender)
    }

    pub(crate) fn system_by_id(
        &self,
        key: std::any::TypeId,
        name: &'static str,
        declared: fn(&Dependers) -> Vec<Dependency>,
    ) -> Vec<Dependency> {
        let depender = self.capabilities.get_by_id::<Arc<dyn Depender>>(
            key,
            name,
            || Some(Arc::new(declared) as Arc<dyn Depender>),
            || None,
        );
        self.run(depender)
    }

    fn run(&self, depender: Result<Arc<dyn Depender>, tessera_ecs::EcsError>) -> Vec<Dependency> {
        match depender {
            Ok(depender) => depender.depend(self),
            Err(error) => {
                tracing::warn!(%error, "falling back to unknown dependencies");
                vec![Dependency::Unknown]
            }
        }
    }

    pub fn version(&self) -> usize {
        self.capabilities.version()
    }
}

impl Default for Dependers {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in descriptions
// ---------------------------------------------------------------------------

impl Depend for Entity {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        Vec::new()
    }
}

impl<C: Component> Depend for Read<C> {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        vec![Dependency::Read(Metadata::component::<C>())]
    }
}

impl<C: Component> Depend for Write<C> {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        vec![Dependency::Write(Metadata::component::<C>())]
    }
}

impl<Q: Depend> Depend for Maybe<Q> {
    fn depend(dependers: &Dependers) -> Vec<Dependency> {
        dependers.of::<Q>()
    }
}

impl<T: Depend> Depend for Any<T> {
    fn depend(dependers: &Dependers) -> Vec<Dependency> {
        dependers.of::<T>()
    }
}

impl<K: ?Sized + 'static> Depend for Has<K> {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        Vec::new()
    }
}

impl<K: ?Sized + 'static> Depend for Not<K> {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        Vec::new()
    }
}

impl<Q: Queryable + Depend> Depend for Group<Q> {
    fn depend(dependers: &Dependers) -> Vec<Dependency> {
        dependers.of::<Q>()
    }
}

impl<M: Message> Depend for Emitter<M> {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        vec![Dependency::emit::<M>()]
    }
}

impl<M: Message> Depend for Receiver<M> {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        vec![Dependency::react::<M>()]
    }
}

impl<T: Send + Sync + 'static> Depend for Resource<T> {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        vec![Dependency::write::<T>()]
    }
}

impl Depend for Defer {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        Vec::new()
    }
}

impl Depend for World {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        vec![Dependency::Unknown]
    }
}

impl Depend for () {
    fn depend(_: &Dependers) -> Vec<Dependency> {
        Vec::new()
    }
}

macro_rules! tuple_depend {
    ($($t:ident),+) => {
        impl<$($t: Depend),+> Depend for ($($t,)+) {
            fn depend(dependers: &Dependers) -> Vec<Dependency> {
                let mut all = Vec::new();
                $(merge(&mut all, dependers.of::<$t>());)+
                all
            }
        }
    };
}

tuple_depend!(A);
tuple_depend!(A, B);
tuple_depend!(A, B, C);
tuple_depend!(A, B, C, D);
tuple_depend!(A, B, C, D, E);
tuple_depend!(A, B, C, D, E, F);
tuple_depend!(A, B, C, D, E, F, G);
tuple_depend!(A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Position;
    impl Component for Position {}

    #[derive(Clone)]
    struct Velocity;
    impl Component for Velocity {}

    #[derive(Clone)]
    struct Hit;
    impl Message for Hit {}

    #[test]
    fn shapes_describe_their_access() {
        let dependers = Dependers::new();
        let deps = dependers.of::<Group<(Entity, Write<Position>, Read<Velocity>, Not<Hit>)>>();
        assert_eq!(
            deps,
            vec![Dependency::write::<Position>(), Dependency::read::<Velocity>()]
        );
        assert_eq!(dependers.of::<Emitter<Hit>>(), vec![Dependency::emit::<Hit>()]);
        assert_eq!(dependers.of::<(Receiver<Hit>, Defer)>(), vec![Dependency::react::<Hit>()]);
        assert_eq!(dependers.of::<World>(), vec![Dependency::Unknown]);
    }

    #[test]
    fn tuples_merge_duplicates() {
        let dependers = Dependers::new();
        let deps = dependers.of::<(Read<Position>, Maybe<Read<Position>>)>();
        assert_eq!(deps, vec![Dependency::read::<Position>()]);
    }

    #[test]
    fn registration_overrides_structure() {
        let dependers = Dependers::new();
        dependers.set::<Read<Velocity>>(|_: &Dependers| vec![Dependency::write::<Velocity>()]);
        let deps = dependers.of::<(Read<Velocity>,)>();
        assert_eq!(deps, vec![Dependency::write::<Velocity>()]);
        assert!(dependers.remove::<Read<Velocity>>());
        assert_eq!(dependers.of::<Read<Velocity>>(), vec![Dependency::read::<Velocity>()]);
    }

    #[test]
    fn conflicts_between_sets() {
        let w = [Dependency::write::<Position>()];
        let r = [Dependency::read::<Position>()];
        let other = [Dependency::write::<Velocity>()];

        assert_eq!(conflict(&w, &w).map(|c| c.kind), Some(ConflictKind::WriteWrite));
        assert_eq!(conflict(&w, &r).map(|c| c.kind), Some(ConflictKind::WriteRead));
        assert_eq!(conflict(&r, &w).map(|c| c.kind), Some(ConflictKind::ReadWrite));
        assert_eq!(conflict(&r, &r), None);
        assert_eq!(conflict(&w, &other), None);
        assert_eq!(
            conflict(&[Dependency::Unknown], &[]).map(|c| c.kind),
            Some(ConflictKind::Unknown)
        );
        assert_eq!(
            conflict(&w, &r).and_then(|c| c.target),
            Some(Metadata::component::<Position>())
        );
        assert_eq!(conflict(&[Dependency::emit::<Hit>()], &[Dependency::react::<Hit>()]), None);
    }
}
