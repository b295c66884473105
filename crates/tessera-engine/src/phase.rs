//! Phases: the marker values a scheduler run is driven with.
//!
//! A system reacts to a phase by registering a handler for its type in
//! [`System::phases`](crate::system::System::phases). The same node tree is
//! built once per phase type; phases whose [`Phase::RESOLVE`] is set also let
//! `Resolve` nodes drain the world's deferred queue.

use std::any::TypeId;
use std::fmt;

use tessera_ecs::component::short_name;

pub trait Phase: Send + Sync + 'static {
    /// Whether `Resolve` nodes call [`World::resolve`](tessera_ecs::world::World::resolve)
    /// during this phase.
    const RESOLVE: bool = false;
}

/// Runtime description of a phase type, passed to builders.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseInfo {
    pub type_id: TypeId,
    pub name: &'static str,
    pub resolve: bool,
}

impl PhaseInfo {
    pub fn of<P: Phase>() -> Self {
        Self {
            type_id: TypeId::of::<P>(),
            name: short_name(std::any::type_name::<P>()),
            resolve: P::RESOLVE,
        }
    }

    pub fn is<P: Phase>(&self) -> bool {
        self.type_id == TypeId::of::<P>()
    }
}

impl fmt::Debug for PhaseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhaseInfo({}", self.name)?;
        if self.resolve {
            f.write_str(", resolve")?;
        }
        f.write_str(")")
    }
}

// ---------------------------------------------------------------------------
// Built-in phases
// ---------------------------------------------------------------------------

/// Runs once before the first [`Run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Initialize;

/// One frame of the main loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Run;

/// Runs once after the last [`Run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispose;

impl Phase for Initialize {
    const RESOLVE: bool = true;
}

impl Phase for Run {
    const RESOLVE: bool = true;
}

impl Phase for Dispose {
    const RESOLVE: bool = true;
}
