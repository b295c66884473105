//! Turning node trees into runners.
//!
//! Building happens once per phase type. Each node is built by the builder
//! resolved for its value type, bottom-up; a node with nothing to do in a
//! phase builds to `None` and disappears from its parent's runner.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tessera_ecs::capability::Capabilities;
use tessera_ecs::message::Message;

use crate::analyze::groups;
use crate::node::{Map, Node, State, SystemNode, Value};
use crate::phase::{Phase, PhaseInfo};
use crate::scheduler::Scheduler;
use crate::system::System;
use crate::Error;

type Run = Arc<dyn Fn(&(dyn Any + Send + Sync)) + Send + Sync>;

/// A built, phase-specific piece of work.
///
/// `instance` is whatever the runner closes over (a system instance, the
/// runners it combines), kept reachable for inspection.
#[derive(Clone)]
pub struct Runner {
    instance: Arc<dyn Any + Send + Sync>,
    run: Run,
}

impl Runner {
    pub fn new(
        instance: Arc<dyn Any + Send + Sync>,
        run: impl Fn(&(dyn Any + Send + Sync)) + Send + Sync + 'static,
    ) -> Self {
        Self {
            instance,
            run: Arc::new(run),
        }
    }

    /// A runner with no instance of interest.
    pub fn from_fn(run: impl Fn(&(dyn Any + Send + Sync)) + Send + Sync + 'static) -> Self {
        Self::new(Arc::new(()), run)
    }

    pub fn instance(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.instance
    }

    pub fn run<P: Phase>(&self, phase: &P) {
        let phase: &(dyn Any + Send + Sync) = phase;
        (self.run)(phase);
    }

    /// Run with an already type-erased phase value.
    pub fn run_erased(&self, phase: &(dyn Any + Send + Sync)) {
        (self.run)(phase);
    }
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner").finish_non_exhaustive()
    }
}

/// `runners` one after the other; `None` when there is nothing to run.
pub fn sequence(mut runners: Vec<Runner>) -> Option<Runner> {
    match runners.len() {
        0 => None,
        1 => runners.pop(),
        _ => {
            let shared = Arc::new(runners);
            let run = shared.clone();
            Some(Runner::new(shared, move |phase| {
                for runner in run.iter() {
                    runner.run_erased(phase);
                }
            }))
        }
    }
}

/// `runners` on the rayon pool, or in order when `concurrent` is off.
pub fn parallel(runners: Vec<Runner>, concurrent: bool) -> Option<Runner> {
    if !concurrent || runners.len() < 2 {
        return sequence(runners);
    }
    let shared = Arc::new(runners);
    let run = shared.clone();
    Some(Runner::new(shared, move |phase| {
        run.par_iter().for_each(|runner| runner.run_erased(phase));
    }))
}

// ---------------------------------------------------------------------------
// Build / Builders
// ---------------------------------------------------------------------------

pub trait Build: Send + Sync + 'static {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error>;
}

impl<F> Build for F
where
    F: Fn(&Node, &Node, &Scheduler, &PhaseInfo) -> Result<Option<Runner>, Error>
        + Send
        + Sync
        + 'static,
{
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        self(node, root, scheduler, phase)
    }
}

/// Registry of builders, keyed by node value type.
#[derive(Debug)]
pub struct Builders {
    capabilities: Capabilities,
}

impl Builders {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new("builder"),
        }
    }

    pub fn set<V: Value>(&self, builder: impl Build) -> bool {
        self.capabilities
            .set::<V, Arc<dyn Build>>(Arc::new(builder))
    }

    pub fn has<V: Value>(&self) -> bool {
        self.capabilities.has::<V>()
    }

    pub fn remove<V: Value>(&self) -> bool {
        self.capabilities.remove::<V>()
    }

    /// The builder for `node`: its value type's registration, else the one
    /// the value declares, else [`SequenceBuilder`].
    pub fn get(&self, node: &Node) -> Result<Arc<dyn Build>, Error> {
        let builder = self.capabilities.get_by_id::<Arc<dyn Build>>(
            node.kind(),
            node.kind_name(),
            || node.value().builder(),
            || Some(Arc::new(SequenceBuilder)),
        )?;
        Ok(builder)
    }

    pub fn version(&self) -> usize {
        self.capabilities.version()
    }
}

impl Default for Builders {
    fn default() -> Self {
        Self::new()
    }
}

/// Built runners of every child of `node` that has work in `phase`.
pub fn children(
    node: &Node,
    root: &Node,
    scheduler: &Scheduler,
    phase: &PhaseInfo,
) -> Result<Vec<Runner>, Error> {
    let mut runners = Vec::with_capacity(node.children().len());
    for child in node.children() {
        if let Some(runner) = scheduler.build_in(child, root, phase)? {
            runners.push(runner);
        }
    }
    Ok(runners)
}

// ---------------------------------------------------------------------------
// Built-in builders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceBuilder;

impl Build for SequenceBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        Ok(sequence(children(node, root, scheduler, phase)?))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelBuilder;

impl Build for ParallelBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        let runners = children(node, root, scheduler, phase)?;
        Ok(parallel(runners, scheduler.config().parallel))
    }
}

/// Runs conflict-free groups of children in parallel, groups in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutomaticBuilder;

impl Build for AutomaticBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        let groups = groups(node, root, scheduler)?;
        let names: Vec<Vec<&str>> = groups
            .iter()
            .map(|group| group.iter().map(Node::name).collect())
            .collect();
        tracing::debug!(node = %node, groups = ?names, "automatic groups");

        let mut stages = Vec::with_capacity(groups.len());
        for group in &groups {
            let mut runners = Vec::with_capacity(group.len());
            for child in group {
                if let Some(runner) = scheduler.build_in(child, root, phase)? {
                    runners.push(runner);
                }
            }
            if let Some(stage) = parallel(runners, scheduler.config().parallel) {
                stages.push(stage);
            }
        }
        Ok(sequence(stages))
    }
}

/// Children, run only while the node's predicate holds at call time.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateBuilder;

impl Build for StateBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        let inner = sequence(children(node, root, scheduler, phase)?);
        let (Some(state), Some(inner)) = (node.value_as::<State>(), inner.clone()) else {
            return Ok(inner);
        };
        let enabled = state.predicate();
        Ok(Some(Runner::new(inner.instance().clone(), move |phase| {
            if enabled() {
                inner.run_erased(phase);
            }
        })))
    }
}

/// Children, then [`World::resolve`](tessera_ecs::world::World::resolve) in
/// phases that allow it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveBuilder;

impl Build for ResolveBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        let inner = sequence(children(node, root, scheduler, phase)?);
        if !phase.resolve {
            return Ok(inner);
        }
        let world = scheduler.world().clone();
        let name = node.name().to_string();
        Ok(Some(Runner::from_fn(move |phase| {
            if let Some(inner) = &inner {
                inner.run_erased(phase);
            }
            let resolved = world.resolve();
            tracing::trace!(node = %name, resolved, "resolved deferred items");
        })))
    }
}

/// Reported by profile nodes after each run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnProfile {
    pub node: String,
    pub id: u64,
    pub phase: &'static str,
    pub elapsed: Duration,
}

impl Message for OnProfile {}

/// Children, timed. Emits [`OnProfile`] on the world's message bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileBuilder;

impl Build for ProfileBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        let Some(inner) = sequence(children(node, root, scheduler, phase)?) else {
            return Ok(None);
        };
        let emitter = scheduler.world().messages().emitter::<OnProfile>();
        let name = node.name().to_string();
        let id = node.id();
        let phase_name = phase.name;
        Ok(Some(Runner::new(inner.instance().clone(), move |phase| {
            let start = Instant::now();
            inner.run_erased(phase);
            let elapsed = start.elapsed();
            tracing::trace!(
                node = %name,
                phase = phase_name,
                elapsed_us = elapsed.as_micros() as u64,
                "profiled"
            );
            emitter.emit(OnProfile {
                node: name.clone(),
                id,
                phase: phase_name,
                elapsed,
            });
        })))
    }
}

/// Children, with the node's transform applied to their runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapBuilder;

impl Build for MapBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        let inner = sequence(children(node, root, scheduler, phase)?);
        match (node.value_as::<Map>(), inner) {
            (Some(map), Some(inner)) => Ok(map.apply(inner)),
            (_, inner) => Ok(inner),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBuilder;

impl Build for SystemBuilder {
    fn build(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        match node.value_as::<SystemNode>() {
            Some(system) => system.build(node, scheduler, phase),
            None => SequenceBuilder.build(node, root, scheduler, phase),
        }
    }
}

/// Runner for the instance of `S` behind `node`, `None` if `S` has no
/// handler for `phase`.
pub(crate) fn system_runner<S: System>(
    node: &Node,
    scheduler: &Scheduler,
    phase: &PhaseInfo,
) -> Result<Option<Runner>, Error> {
    let instance = scheduler.instance::<S>(node)?;
    let handlers = instance.phases.handlers(phase.type_id);
    if handlers.is_empty() {
        return Ok(None);
    }
    let shared = instance.clone();
    Ok(Some(Runner::new(instance, move |phase| {
        let mut system = shared.system.lock();
        for handler in &handlers {
            handler(&mut *system, phase);
        }
    })))
}
