//! The scheduler: analysis and building of one node tree against one world.
//!
//! A [`Scheduler`] owns the registries consulted while analyzing and
//! building (analyzers, builders, dependers, injectors) and caches:
//!
//! 1. dependency analyses per `(node, root)` pair,
//! 2. one runner per phase type,
//! 3. one system instance per system node, shared by every phase.
//!
//! The first two are dropped whenever a registry changes. System instances
//! survive, so state a system keeps between phases is never lost.
//!
//! # Example
//!
//! ```
//! use tessera_engine::prelude::*;
//!
//! struct Hello;
//! impl System for Hello {
//!     fn inject(_: &Context) -> Result<Self, Error> {
//!         Ok(Hello)
//!     }
//!     fn phases(phases: &mut Phases<Self>) {
//!         phases.on(|_: &mut Self, _: &Initialize| {});
//!     }
//! }
//!
//! let scheduler = Scheduler::new(World::new(), Node::sequence([Node::system::<Hello>()]));
//! assert!(scheduler.run(&Initialize).unwrap());
//! // Nothing handles `Dispose`, so there is nothing to run.
//! assert!(!scheduler.run(&Dispose).unwrap());
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tessera_ecs::world::World;

use crate::analyze::{groups, Analyzers};
use crate::build::{Builders, Runner};
use crate::dependency::{Dependency, Dependers};
use crate::node::Node;
use crate::phase::{Phase, PhaseInfo};
use crate::system::{Context, Injectors, Instance, System};
use crate::Error;

// ---------------------------------------------------------------------------
// SchedulerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run `Parallel` and `Automatic` groups on the rayon pool. When off,
    /// they still validate but run their children in order.
    pub parallel: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { parallel: true }
    }
}

// ---------------------------------------------------------------------------
// Memo
// ---------------------------------------------------------------------------

type Stamp = [usize; 4];

/// A cache that empties itself when the registry stamp changes.
struct Memo<K, V> {
    stamp: Stamp,
    entries: HashMap<K, V>,
}

impl<K: Eq + Hash, V: Clone> Memo<K, V> {
    fn new() -> Self {
        Self {
            stamp: [0; 4],
            entries: HashMap::new(),
        }
    }

    fn refresh(&mut self, stamp: Stamp) {
        if self.stamp != stamp {
            self.entries.clear();
            self.stamp = stamp;
        }
    }

    fn get(&mut self, stamp: Stamp, key: &K) -> Option<V> {
        self.refresh(stamp);
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, stamp: Stamp, key: K, value: V) {
        self.refresh(stamp);
        self.entries.insert(key, value);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    world: World,
    root: Node,
    config: SchedulerConfig,
    analyzers: Analyzers,
    builders: Builders,
    dependers: Dependers,
    injectors: Injectors,
    analyses: Mutex<Memo<(u64, u64), Result<Vec<Dependency>, Error>>>,
    runners: Mutex<Memo<TypeId, Option<Runner>>>,
    instances: Mutex<HashMap<u64, Arc<dyn Any + Send + Sync>>>,
}

impl Scheduler {
    pub fn new(world: World, root: Node) -> Self {
        Self::with_config(world, root, SchedulerConfig::default())
    }

    pub fn with_config(world: World, root: Node, config: SchedulerConfig) -> Self {
        tracing::debug!(root = %root, nodes = root.nodes().len(), ?config, "scheduler created");
        Self {
            world,
            root,
            config,
            analyzers: Analyzers::new(),
            builders: Builders::new(),
            dependers: Dependers::new(),
            injectors: Injectors::new(),
            analyses: Mutex::new(Memo::new()),
            runners: Mutex::new(Memo::new()),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn analyzers(&self) -> &Analyzers {
        &self.analyzers
    }

    pub fn builders(&self) -> &Builders {
        &self.builders
    }

    pub fn dependers(&self) -> &Dependers {
        &self.dependers
    }

    pub fn injectors(&self) -> &Injectors {
        &self.injectors
    }

    fn stamp(&self) -> Stamp {
        [
            self.analyzers.version(),
            self.builders.version(),
            self.dependers.version(),
            self.injectors.version(),
        ]
    }

    // -- analysis -----------------------------------------------------------

    /// Dependencies of `node` within this scheduler's tree.
    pub fn analyze(&self, node: &Node) -> Result<Vec<Dependency>, Error> {
        self.analyze_in(node, &self.root)
    }

    /// Dependencies of `node` within the tree rooted at `root`, memoized.
    pub fn analyze_in(&self, node: &Node, root: &Node) -> Result<Vec<Dependency>, Error> {
        let stamp = self.stamp();
        let key = (node.id(), root.id());
        if let Some(found) = self.analyses.lock().get(stamp, &key) {
            return found;
        }

        let analyzer = self.analyzers.get(node)?;
        let result = analyzer.analyze(node, root, self);
        match &result {
            Ok(dependencies) => {
                tracing::trace!(node = %node, ?dependencies, "analyzed");
            }
            Err(error) => {
                tracing::debug!(node = %node, %error, "analysis failed");
            }
        }
        self.analyses.lock().insert(stamp, key, result.clone());
        result
    }

    /// How an `Automatic` node's children would be grouped.
    pub fn groups(&self, node: &Node) -> Result<Vec<Vec<Node>>, Error> {
        groups(node, &self.root, self)
    }

    // -- building -----------------------------------------------------------

    /// Build `node` for `phase` with the builder resolved for its value.
    pub fn build_in(
        &self,
        node: &Node,
        root: &Node,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        let builder = self.builders.get(node)?;
        builder.build(node, root, self, phase)
    }

    /// The runner for phase `P`, built on first use.
    ///
    /// The whole tree is analyzed first, so an illegal `Parallel` node fails
    /// here before anything runs.
    pub fn runner<P: Phase>(&self) -> Result<Option<Runner>, Error> {
        let phase = PhaseInfo::of::<P>();
        let stamp = self.stamp();
        if let Some(found) = self.runners.lock().get(stamp, &phase.type_id) {
            return Ok(found);
        }

        self.analyze(&self.root)?;
        let runner = self.build_in(&self.root, &self.root, &phase)?;
        tracing::debug!(
            phase = phase.name,
            root = %self.root,
            empty = runner.is_none(),
            "runner built"
        );
        self.runners
            .lock()
            .insert(stamp, phase.type_id, runner.clone());
        Ok(runner)
    }

    /// Run phase `P` once. Returns whether anything handled it.
    pub fn run<P: Phase>(&self, phase: &P) -> Result<bool, Error> {
        match self.runner::<P>()? {
            Some(runner) => {
                runner.run(phase);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Forget cached analyses and runners. System instances are kept.
    pub fn invalidate(&self) {
        self.analyses.lock().clear();
        self.runners.lock().clear();
    }

    // -- instances ----------------------------------------------------------

    /// The instance of `S` for `node`, injected on first request.
    pub(crate) fn instance<S: System>(&self, node: &Node) -> Result<Arc<Instance<S>>, Error> {
        let existing = self.instances.lock().get(&node.id()).cloned();
        if let Some(instance) = existing.and_then(|found| found.downcast::<Instance<S>>().ok()) {
            return Ok(instance);
        }

        let context = Context::new(&self.world, &self.injectors, node);
        let instance = Arc::new(Instance::<S>::create(&context)?);
        tracing::debug!(
            node = %node,
            handlers = instance.phases.len(),
            "system injected"
        );
        self.instances.lock().insert(node.id(), instance.clone());
        Ok(instance)
    }

    /// Number of system instances created so far.
    pub fn instances(&self) -> usize {
        self.instances.lock().len()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("instances", &self.instances())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{Dispose, Initialize, Run};
    use crate::system::Phases;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static INJECTED: AtomicUsize = AtomicUsize::new(0);

    struct Lifecycle {
        phases_seen: Vec<&'static str>,
    }

    impl System for Lifecycle {
        fn inject(_: &Context) -> Result<Self, Error> {
            INJECTED.fetch_add(1, Ordering::SeqCst);
            Ok(Self {
                phases_seen: Vec::new(),
            })
        }

        fn phases(phases: &mut Phases<Self>) {
            phases
                .on(|system: &mut Self, _: &Initialize| system.phases_seen.push("init"))
                .on(|system: &mut Self, _: &Run| system.phases_seen.push("run"));
        }
    }

    #[test]
    fn one_instance_serves_every_phase() {
        let node = Node::system::<Lifecycle>();
        let scheduler = Scheduler::new(World::new(), Node::sequence([node.clone()]));
        let before = INJECTED.load(Ordering::SeqCst);

        assert!(scheduler.run(&Initialize).unwrap());
        assert!(scheduler.run(&Run).unwrap());
        assert!(scheduler.run(&Run).unwrap());
        assert!(!scheduler.run(&Dispose).unwrap());

        assert_eq!(INJECTED.load(Ordering::SeqCst) - before, 1);
        assert_eq!(scheduler.instances(), 1);
        let instance = scheduler.instance::<Lifecycle>(&node).unwrap();
        assert_eq!(instance.system.lock().phases_seen, vec!["init", "run", "run"]);
    }

    #[test]
    fn runners_are_cached_until_registries_change() {
        let scheduler = Scheduler::new(World::new(), Node::system::<Lifecycle>());
        let first = scheduler.runner::<Run>().unwrap().unwrap();
        let second = scheduler.runner::<Run>().unwrap().unwrap();
        assert!(Arc::ptr_eq(first.instance(), second.instance()));

        // A new registration rebuilds the runner but keeps the instance.
        scheduler
            .dependers()
            .set::<Lifecycle>(|_: &Dependers| Vec::new());
        let third = scheduler.runner::<Run>().unwrap().unwrap();
        assert!(Arc::ptr_eq(first.instance(), third.instance()));
        assert_eq!(scheduler.analyze(scheduler.root()).unwrap(), Vec::new());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SchedulerConfig::default());
        let config: SchedulerConfig = serde_json::from_str(r#"{"parallel": false}"#).unwrap();
        assert!(!config.parallel);
    }
}
