//! Dependency analysis of node trees.
//!
//! Analysis answers "what does this subtree touch?" and, for parallel nodes,
//! whether their children may actually run together. Results are memoized by
//! the [`Scheduler`] per `(node, root)` pair.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tessera_ecs::capability::Capabilities;
use tessera_ecs::component::Metadata;

use crate::dependency::{conflict, merge, Dependency};
use crate::node::{Node, SystemNode, Value};
use crate::scheduler::Scheduler;
use crate::Error;

pub trait Analyze: Send + Sync + 'static {
    /// Dependencies of `node`, analyzed inside the tree rooted at `root`.
    fn analyze(&self, node: &Node, root: &Node, scheduler: &Scheduler)
        -> Result<Vec<Dependency>, Error>;
}

impl<F> Analyze for F
where
    F: Fn(&Node, &Node, &Scheduler) -> Result<Vec<Dependency>, Error> + Send + Sync + 'static,
{
    fn analyze(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
    ) -> Result<Vec<Dependency>, Error> {
        self(node, root, scheduler)
    }
}

/// Registry of analyzers, keyed by node value type.
#[derive(Debug)]
pub struct Analyzers {
    capabilities: Capabilities,
}

impl Analyzers {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities::new("analyzer"),
        }
    }

    pub fn set<V: Value>(&self, analyzer: impl Analyze) -> bool {
        self.capabilities
            .set::<V, Arc<dyn Analyze>>(Arc::new(analyzer))
    }

    pub fn has<V: Value>(&self) -> bool {
        self.capabilities.has::<V>()
    }

    pub fn remove<V: Value>(&self) -> bool {
        self.capabilities.remove::<V>()
    }

    /// The analyzer for `node`: its value type's registration, else the one
    /// the value declares, else [`Union`].
    pub fn get(&self, node: &Node) -> Result<Arc<dyn Analyze>, Error> {
        let analyzer = self.capabilities.get_by_id::<Arc<dyn Analyze>>(
            node.kind(),
            node.kind_name(),
            || node.value().analyzer(),
            || Some(Arc::new(Union)),
        )?;
        Ok(analyzer)
    }

    pub fn version(&self) -> usize {
        self.capabilities.version()
    }
}

impl Default for Analyzers {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in analyzers
// ---------------------------------------------------------------------------

/// Union of the children's dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct Union;

impl Analyze for Union {
    fn analyze(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
    ) -> Result<Vec<Dependency>, Error> {
        let mut all = Vec::new();
        for child in node.children() {
            merge(&mut all, scheduler.analyze_in(child, root)?);
        }
        Ok(all)
    }
}

/// Union of the children plus [`Dependency::Unknown`].
///
/// Draining the resolver queue may touch any store, so a resolve point never
/// shares a parallel group with anything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveAnalyzer;

impl Analyze for ResolveAnalyzer {
    fn analyze(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
    ) -> Result<Vec<Dependency>, Error> {
        let mut all = Union.analyze(node, root, scheduler)?;
        merge(&mut all, vec![Dependency::Unknown]);
        Ok(all)
    }
}

/// A system's own dependencies plus those of every system in the tree that
/// reacts to a message it emits, followed transitively.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAnalyzer;

impl Analyze for SystemAnalyzer {
    fn analyze(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
    ) -> Result<Vec<Dependency>, Error> {
        let Some(system) = node.value_as::<SystemNode>() else {
            return Union.analyze(node, root, scheduler);
        };
        let dependers = scheduler.dependers();
        let mut all = system.depend(dependers);

        let mut others = Vec::new();
        for other in root.nodes() {
            if other == *node {
                continue;
            }
            if let Some(reactor) = other.value_as::<SystemNode>() {
                others.push(reactor.depend(dependers));
            }
        }

        let mut pending: VecDeque<Metadata> = emits(&all).collect();
        let mut seen = HashSet::new();
        let mut included = vec![false; others.len()];
        while let Some(message) = pending.pop_front() {
            if !seen.insert(message) {
                continue;
            }
            for (index, dependencies) in others.iter().enumerate() {
                if included[index] || !dependencies.contains(&Dependency::React(message)) {
                    continue;
                }
                included[index] = true;
                pending.extend(emits(dependencies));
                merge(&mut all, dependencies.iter().copied());
            }
        }
        Ok(all)
    }
}

fn emits(dependencies: &[Dependency]) -> impl Iterator<Item = Metadata> + '_ {
    dependencies.iter().filter_map(|dependency| match dependency {
        Dependency::Emit(message) => Some(*message),
        _ => None,
    })
}

/// Union of the children, after checking that they may run concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelAnalyzer;

impl Analyze for ParallelAnalyzer {
    fn analyze(
        &self,
        node: &Node,
        root: &Node,
        scheduler: &Scheduler,
    ) -> Result<Vec<Dependency>, Error> {
        let sets = node
            .children()
            .iter()
            .map(|child| scheduler.analyze_in(child, root))
            .collect::<Result<Vec<_>, _>>()?;
        validate(node, node.children(), &sets)?;
        let mut all = Vec::new();
        for set in sets {
            merge(&mut all, set);
        }
        Ok(all)
    }
}

/// Check that `children` (with dependency sets `sets`) may run concurrently.
///
/// A lone child is always fine. Otherwise any child with unknown
/// dependencies, or any pair of children that conflict, is an error.
pub fn validate(parent: &Node, children: &[Node], sets: &[Vec<Dependency>]) -> Result<(), Error> {
    if children.len() < 2 {
        return Ok(());
    }
    for (child, set) in children.iter().zip(sets) {
        if set.contains(&Dependency::Unknown) {
            return Err(Error::Unknown {
                node: child.name().to_string(),
                parent: parent.name().to_string(),
            });
        }
    }
    for (i, left) in sets.iter().enumerate() {
        for (j, right) in sets.iter().enumerate().skip(i + 1) {
            if let Some(found) = conflict(left, right) {
                return Err(Error::Conflict {
                    left: children[i].name().to_string(),
                    right: children[j].name().to_string(),
                    kind: found.kind,
                    type_name: found
                        .target
                        .map(|meta| meta.to_string())
                        .unwrap_or_default(),
                });
            }
        }
    }
    Ok(())
}

/// Split items into consecutive groups whose members may run together.
///
/// Each round takes every remaining item that conflicts with no remaining
/// item before it. Conflicting items therefore keep their relative order,
/// and items with unknown dependencies end up alone.
///
/// Groups are layers of a dependency order, not greedy runs grown in both
/// directions. With longer conflict chains an item can land in a later group
/// than a greedy grouping would put it in.
pub fn partition(sets: &[Vec<Dependency>]) -> Vec<Vec<usize>> {
    let mut remaining: Vec<usize> = (0..sets.len()).collect();
    let mut groups = Vec::new();
    while !remaining.is_empty() {
        let mut ready = Vec::new();
        let mut blocked = Vec::new();
        for (position, &item) in remaining.iter().enumerate() {
            let free = remaining[..position]
                .iter()
                .all(|&before| conflict(&sets[before], &sets[item]).is_none());
            if free {
                ready.push(item);
            } else {
                blocked.push(item);
            }
        }
        groups.push(ready);
        remaining = blocked;
    }
    groups
}

/// The children of `node` split with [`partition`] on their analyzed
/// dependencies.
pub fn groups(node: &Node, root: &Node, scheduler: &Scheduler) -> Result<Vec<Vec<Node>>, Error> {
    let children = node.children();
    let sets = children
        .iter()
        .map(|child| scheduler.analyze_in(child, root))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(partition(&sets)
        .into_iter()
        .map(|group| group.into_iter().map(|index| children[index].clone()).collect())
        .collect())
}
