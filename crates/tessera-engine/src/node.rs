//! Execution trees.
//!
//! A [`Node`] is an immutable, cheaply cloned tree element: a *value* saying
//! what kind of node it is plus ordered children. How a node is analyzed and
//! turned into a runner is looked up by the type of its value, so new node
//! kinds only need a [`Value`] implementation (or a registration on the
//! scheduler's analyzers and builders).
//!
//! | Constructor            | Behavior                                            |
//! |------------------------|-----------------------------------------------------|
//! | [`Node::sequence`]     | children one after the other                        |
//! | [`Node::parallel`]     | children concurrently; fails analysis on conflicts  |
//! | [`Node::automatic`]    | children in conflict-free parallel groups            |
//! | [`Node::system`]       | one system instance                                 |
//! | [`Node::state`]        | children only while a predicate holds               |
//! | [`Node::resolve`]      | children, then drain the deferred queue; runs alone |
//! | [`Node::profile`]      | children, timed and reported                        |
//! | [`Node::map`]          | children, with their runner transformed             |

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tessera_ecs::component::short_name;

use crate::analyze::{Analyze, ParallelAnalyzer, ResolveAnalyzer, SystemAnalyzer};
use crate::build::{
    system_runner, AutomaticBuilder, Build, MapBuilder, ParallelBuilder, ProfileBuilder,
    ResolveBuilder, Runner, StateBuilder, SystemBuilder,
};
use crate::dependency::{Dependency, Dependers};
use crate::phase::PhaseInfo;
use crate::scheduler::Scheduler;
use crate::system::System;
use crate::Error;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The kind of a node. Analyzers and builders are resolved by its type.
pub trait Value: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Analyzer used when none is registered for this value type.
    fn analyzer(&self) -> Option<Arc<dyn Analyze>> {
        None
    }

    /// Builder used when none is registered for this value type.
    fn builder(&self) -> Option<Arc<dyn Build>> {
        None
    }
}

#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    name: String,
    kind: TypeId,
    kind_name: &'static str,
    value: Arc<dyn Value>,
    children: Vec<Node>,
}

impl Node {
    pub fn new<V: Value>(
        name: impl Into<String>,
        value: V,
        children: impl IntoIterator<Item = Node>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                kind: TypeId::of::<V>(),
                kind_name: std::any::type_name::<V>(),
                value: Arc::new(value),
                children: children.into_iter().collect(),
            }),
        }
    }

    /// Unique for the process lifetime.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn value(&self) -> &dyn Value {
        &*self.inner.value
    }

    /// Type of the value, the key analyzers and builders are registered under.
    pub fn kind(&self) -> TypeId {
        self.inner.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.inner.kind_name
    }

    pub fn is<V: Value>(&self) -> bool {
        self.inner.kind == TypeId::of::<V>()
    }

    pub fn value_as<V: Value>(&self) -> Option<&V> {
        self.value().as_any().downcast_ref::<V>()
    }

    pub fn children(&self) -> &[Node] {
        &self.inner.children
    }

    /// A copy of this node under another name. The copy is a distinct node.
    pub fn with_name(&self, name: impl Into<String>) -> Node {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                kind: self.inner.kind,
                kind_name: self.inner.kind_name,
                value: self.inner.value.clone(),
                children: self.inner.children.clone(),
            }),
        }
    }

    /// Every node below this one, depth first, in child order.
    pub fn descendants(&self) -> Vec<Node> {
        let mut all = Vec::new();
        let mut stack: Vec<&Node> = self.children().iter().rev().collect();
        while let Some(node) = stack.pop() {
            all.push(node.clone());
            stack.extend(node.children().iter().rev());
        }
        all
    }

    /// This node followed by its descendants.
    pub fn nodes(&self) -> Vec<Node> {
        let mut all = vec![self.clone()];
        all.extend(self.descendants());
        all
    }

    // -- constructors -------------------------------------------------------

    pub fn sequence(children: impl IntoIterator<Item = Node>) -> Self {
        Self::new("sequence", Sequence, children)
    }

    pub fn parallel(children: impl IntoIterator<Item = Node>) -> Self {
        Self::new("parallel", Parallel, children)
    }

    pub fn automatic(children: impl IntoIterator<Item = Node>) -> Self {
        Self::new("automatic", Automatic, children)
    }

    pub fn system<S: System>() -> Self {
        let name = short_name(std::any::type_name::<S>());
        Self::new(name, SystemNode::of::<S>(), [])
    }

    pub fn state(
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        children: impl IntoIterator<Item = Node>,
    ) -> Self {
        Self::new(
            "state",
            State {
                enabled: Arc::new(enabled),
            },
            children,
        )
    }

    pub fn resolve(children: impl IntoIterator<Item = Node>) -> Self {
        Self::new("resolve", Resolve, children)
    }

    pub fn profile(children: impl IntoIterator<Item = Node>) -> Self {
        Self::new("profile", Profile, children)
    }

    pub fn map(
        map: impl Fn(Runner) -> Option<Runner> + Send + Sync + 'static,
        children: impl IntoIterator<Item = Node>,
    ) -> Self {
        Self::new("map", Map { map: Arc::new(map) }, children)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut node = f.debug_struct("Node");
        node.field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("kind", &short_name(self.inner.kind_name));
        if !self.inner.children.is_empty() {
            node.field("children", &self.inner.children);
        }
        node.finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.inner.name, self.inner.id)
    }
}

// ---------------------------------------------------------------------------
// Built-in values
// ---------------------------------------------------------------------------

/// Children run one after the other. Also the fallback for unknown values.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sequence;

impl Value for Sequence {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Parallel;

impl Value for Parallel {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn analyzer(&self) -> Option<Arc<dyn Analyze>> {
        Some(Arc::new(ParallelAnalyzer))
    }

    fn builder(&self) -> Option<Arc<dyn Build>> {
        Some(Arc::new(ParallelBuilder))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Automatic;

impl Value for Automatic {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn builder(&self) -> Option<Arc<dyn Build>> {
        Some(Arc::new(AutomaticBuilder))
    }
}

pub struct State {
    enabled: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl State {
    pub fn is_enabled(&self) -> bool {
        (self.enabled)()
    }

    pub(crate) fn predicate(&self) -> Arc<dyn Fn() -> bool + Send + Sync> {
        self.enabled.clone()
    }
}

impl Value for State {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn builder(&self) -> Option<Arc<dyn Build>> {
        Some(Arc::new(StateBuilder))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Resolve;

impl Value for Resolve {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn analyzer(&self) -> Option<Arc<dyn Analyze>> {
        Some(Arc::new(ResolveAnalyzer))
    }

    fn builder(&self) -> Option<Arc<dyn Build>> {
        Some(Arc::new(ResolveBuilder))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Profile;

impl Value for Profile {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn builder(&self) -> Option<Arc<dyn Build>> {
        Some(Arc::new(ProfileBuilder))
    }
}

pub struct Map {
    map: Arc<dyn Fn(Runner) -> Option<Runner> + Send + Sync>,
}

impl Map {
    pub fn apply(&self, runner: Runner) -> Option<Runner> {
        (self.map)(runner)
    }
}

impl Value for Map {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn builder(&self) -> Option<Arc<dyn Build>> {
        Some(Arc::new(MapBuilder))
    }
}

type BuildSystem = fn(&Node, &Scheduler, &PhaseInfo) -> Result<Option<Runner>, Error>;

/// A leaf holding one system type.
#[derive(Clone, Copy)]
pub struct SystemNode {
    pub system: TypeId,
    pub system_name: &'static str,
    depend: fn(&Dependers) -> Vec<Dependency>,
    build: BuildSystem,
}

impl SystemNode {
    pub fn of<S: System>() -> Self {
        Self {
            system: TypeId::of::<S>(),
            system_name: std::any::type_name::<S>(),
            depend: S::depend,
            build: system_runner::<S>,
        }
    }

    /// Direct dependencies of the system, honoring registrations in `dependers`.
    pub fn depend(&self, dependers: &Dependers) -> Vec<Dependency> {
        dependers.system_by_id(self.system, self.system_name, self.depend)
    }

    pub(crate) fn build(
        &self,
        node: &Node,
        scheduler: &Scheduler,
        phase: &PhaseInfo,
    ) -> Result<Option<Runner>, Error> {
        (self.build)(node, scheduler, phase)
    }
}

impl fmt::Debug for SystemNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SystemNode({})", short_name(self.system_name))
    }
}

impl Value for SystemNode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn analyzer(&self) -> Option<Arc<dyn Analyze>> {
        Some(Arc::new(SystemAnalyzer))
    }

    fn builder(&self) -> Option<Arc<dyn Build>> {
        Some(Arc::new(SystemBuilder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trees_keep_child_order() {
        let a = Node::sequence([]).with_name("a");
        let b = Node::parallel([]).with_name("b");
        let c = Node::resolve([]).with_name("c");
        let root = Node::sequence([Node::sequence([a.clone(), b.clone()]), c.clone()]);

        let names: Vec<_> = root.descendants().iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["sequence", "a", "b", "c"]);
        assert_eq!(root.nodes().len(), 5);
        assert!(b.is::<Parallel>());
        assert!(b.value_as::<Parallel>().is_some());
        assert!(b.value_as::<Sequence>().is_none());
    }

    #[test]
    fn renamed_nodes_are_distinct() {
        let a = Node::profile([Node::sequence([])]);
        let b = a.with_name("frame");
        assert_ne!(a, b);
        assert_eq!(b.name(), "frame");
        assert_eq!(b.children(), a.children());
        assert_eq!(b.kind(), a.kind());
        assert_eq!(a, a.clone());
    }

    #[test]
    fn state_predicates_are_live() {
        use std::sync::atomic::AtomicBool;

        let flag = Arc::new(AtomicBool::new(false));
        let node = {
            let flag = flag.clone();
            Node::state(move || flag.load(Ordering::SeqCst), [])
        };
        let state = node.value_as::<State>().unwrap();
        assert!(!state.is_enabled());
        flag.store(true, Ordering::SeqCst);
        assert!(state.is_enabled());
    }
}
