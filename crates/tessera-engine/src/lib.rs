//! Tessera Engine -- phase-driven scheduling of systems over a Tessera world.
//!
//! This crate builds on [`tessera_ecs`] to provide the execution side: a tree
//! of [`Node`](node::Node)s describing how systems are ordered, grouped,
//! gated and timed, analyzed for data conflicts and built into one runner
//! per [`Phase`](phase::Phase).
//!
//! # Quick Start
//!
//! ```
//! use tessera_engine::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Health(u32);
//! impl Component for Health {}
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Poison;
//! impl Component for Poison {}
//!
//! struct Damage {
//!     victims: Group<(Entity, Write<Health>, Has<Poison>)>,
//!     defer: Defer,
//! }
//!
//! impl System for Damage {
//!     fn inject(context: &Context) -> Result<Self, Error> {
//!         let (victims, defer) = context.inject()?;
//!         Ok(Self { victims, defer })
//!     }
//!
//!     fn phases(phases: &mut Phases<Self>) {
//!         phases.on(|damage: &mut Self, _: &Run| {
//!             damage.victims.each(|(entity, health, _)| {
//!                 let left = health.update(|h| {
//!                     h.0 = h.0.saturating_sub(5);
//!                     h.0
//!                 });
//!                 if left == Some(0) {
//!                     damage.defer.destroy(entity);
//!                 }
//!             });
//!         });
//!     }
//!
//!     fn depend(dependers: &Dependers) -> Vec<Dependency> {
//!         dependers.of::<(Group<(Entity, Write<Health>, Has<Poison>)>, Defer)>()
//!     }
//! }
//!
//! let world = World::new();
//! let healthy = world.spawn((Health(10),));
//! let poisoned = world.spawn((Health(10), Poison));
//!
//! let scheduler = Scheduler::new(
//!     world.clone(),
//!     Node::resolve([Node::automatic([Node::system::<Damage>()])]),
//! );
//! scheduler.run(&Run).unwrap();
//! scheduler.run(&Run).unwrap();
//!
//! assert!(world.has(healthy));
//! assert!(!world.has(poisoned));
//! ```

#![deny(unsafe_code)]

pub mod analyze;
pub mod build;
pub mod dependency;
pub mod node;
pub mod phase;
pub mod scheduler;
pub mod system;

use dependency::ConflictKind;
use tessera_ecs::EcsError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use tessera_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced while analyzing, building or instantiating a node tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Two children of a parallel node touch the same data incompatibly.
    #[error("'{left}' and '{right}' cannot run in parallel: {kind} '{type_name}'")]
    Conflict {
        left: String,
        right: String,
        kind: ConflictKind,
        type_name: String,
    },

    /// A child of a parallel node does not declare what it touches.
    #[error("'{node}' has unknown dependencies and cannot run in parallel inside '{parent}'")]
    Unknown { node: String, parent: String },

    /// A system could not be instantiated.
    #[error("cannot inject system '{system}': {reason}")]
    Inject {
        system: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Ecs(#[from] EcsError),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use tessera_ecs::prelude::*;

    pub use crate::analyze::{Analyze, Analyzers};
    pub use crate::build::{Build, Builders, OnProfile, Runner};
    pub use crate::dependency::{Conflict, ConflictKind, Depend, Dependency, Depender, Dependers};
    pub use crate::node::{Node, Value};
    pub use crate::phase::{Dispose, Initialize, Phase, PhaseInfo, Run};
    pub use crate::scheduler::{Scheduler, SchedulerConfig};
    pub use crate::system::{Context, Inject, Injector, Injectors, Phases, System};
    pub use crate::Error;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    // -- test types ---------------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Log(Vec<&'static str>);

    macro_rules! logging_system {
        ($name:ident, $label:literal) => {
            struct $name {
                log: Resource<Arc<Mutex<Log>>>,
            }

            impl System for $name {
                fn inject(context: &Context) -> Result<Self, Error> {
                    Ok(Self {
                        log: context.inject()?,
                    })
                }

                fn phases(phases: &mut Phases<Self>) {
                    phases.on(|system: &mut Self, _: &Run| {
                        system.log.read().lock().0.push($label);
                    });
                }
            }
        };
    }

    logging_system!(First, "first");
    logging_system!(Second, "second");

    fn log_of(world: &World) -> Vec<&'static str> {
        world.resource::<Arc<Mutex<Log>>>().read().lock().0.clone()
    }

    // -- composition --------------------------------------------------------

    #[test]
    fn sequences_run_in_order() {
        let world = World::new();
        let scheduler = Scheduler::new(
            world.clone(),
            Node::sequence([
                Node::system::<Second>(),
                Node::system::<First>(),
                Node::system::<Second>(),
            ]),
        );
        assert!(scheduler.run(&Run).unwrap());
        assert_eq!(log_of(&world), vec!["second", "first", "second"]);
        assert_eq!(scheduler.instances(), 3);
    }

    #[test]
    fn state_nodes_check_their_predicate_each_run() {
        let world = World::new();
        let enabled = Arc::new(AtomicBool::new(true));
        let flag = enabled.clone();
        let scheduler = Scheduler::new(
            world.clone(),
            Node::state(move || flag.load(Ordering::SeqCst), [Node::system::<First>()]),
        );

        scheduler.run(&Run).unwrap();
        enabled.store(false, Ordering::SeqCst);
        scheduler.run(&Run).unwrap();
        enabled.store(true, Ordering::SeqCst);
        scheduler.run(&Run).unwrap();
        assert_eq!(log_of(&world), vec!["first", "first"]);
    }

    #[test]
    fn map_nodes_transform_or_drop_their_runner() {
        let world = World::new();
        let twice = Node::map(
            |inner| {
                Some(Runner::from_fn(move |phase| {
                    inner.run_erased(phase);
                    inner.run_erased(phase);
                }))
            },
            [Node::system::<First>()],
        );
        let dropped = Node::map(|_| None, [Node::system::<Second>()]);
        let scheduler = Scheduler::new(world.clone(), Node::sequence([twice, dropped]));

        scheduler.run(&Run).unwrap();
        assert_eq!(log_of(&world), vec!["first", "first"]);
    }

    #[test]
    fn resolve_nodes_drain_deferred_work() {
        let world = World::new();
        let entity = world.create();
        world.defer(Destroy(entity));

        let scheduler = Scheduler::new(world.clone(), Node::resolve([]));
        assert!(scheduler.run(&Run).unwrap());
        assert!(!world.has(entity));
    }

    #[test]
    fn profile_nodes_report_timings() {
        let world = World::new();
        let reports = world.messages().receiver::<OnProfile>();
        let node = Node::profile([Node::system::<First>()]).with_name("frame");
        let scheduler = Scheduler::new(world.clone(), node.clone());

        scheduler.run(&Run).unwrap();
        let report = reports.pop().unwrap();
        assert_eq!(report.node, "frame");
        assert_eq!(report.id, node.id());
        assert_eq!(report.phase, "Run");
        assert!(reports.is_empty());
    }

    #[test]
    fn empty_trees_have_nothing_to_run() {
        let scheduler = Scheduler::new(World::new(), Node::parallel([Node::sequence([])]));
        assert!(scheduler.runner::<Initialize>().unwrap().is_none());
        assert!(!scheduler.run(&Initialize).unwrap());
    }

    // -- errors -------------------------------------------------------------

    #[test]
    fn error_messages_name_the_nodes() {
        let err = Error::Conflict {
            left: "a".into(),
            right: "b".into(),
            kind: ConflictKind::WriteWrite,
            type_name: "Position".into(),
        };
        assert_eq!(
            err.to_string(),
            "'a' and 'b' cannot run in parallel: both write 'Position'"
        );

        let err: Error = EcsError::StaleEntity {
            entity: Entity::new(1, 1),
        }
        .into();
        assert!(matches!(err, Error::Ecs(_)));
    }
}
