//! Groups: a query shape matched across every segment of a world.

use crate::entity::Entity;
use crate::query::{Context, Query, Queryable};
use crate::segment::Segment;
use crate::world::World;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

struct State<Q> {
    /// Number of world segments already examined.
    seen: usize,
    matches: Vec<(Arc<Segment>, Query<Q>)>,
}

/// Iterates every entity whose segment matches `Q`.
///
/// New segments are picked up lazily on the next call; entities destroyed
/// this frame are still visited until the world resolves.
pub struct Group<Q: Queryable> {
    world: World,
    state: RwLock<State<Q>>,
}

impl<Q: Queryable> Group<Q> {
    pub fn new(world: World) -> Self {
        Self {
            world,
            state: RwLock::new(State {
                seen: 0,
                matches: Vec::new(),
            }),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    fn refresh(&self) -> Vec<(Arc<Segment>, Query<Q>)> {
        let segments = self.world.segments();
        {
            let state = self.state.read();
            if state.seen == segments.len() {
                return state.matches.clone();
            }
        }
        let mut state = self.state.write();
        for segment in &segments[state.seen.min(segments.len())..] {
            if let Some(query) = Context::new(&self.world, segment).query::<Q>() {
                state.matches.push((segment.clone(), query));
            }
        }
        state.seen = segments.len();
        state.matches.clone()
    }

    /// Matching segments.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.refresh().into_iter().map(|(segment, _)| segment).collect()
    }

    /// Iterate items in segment order, then slot order.
    pub fn iter(&self) -> impl Iterator<Item = Q> {
        self.refresh().into_iter().flat_map(|(segment, query)| {
            (0..segment.len()).filter_map(move |slot| {
                let entity = segment.entity(slot)?;
                Some(query.get(entity, slot))
            })
        })
    }

    pub fn each(&self, mut run: impl FnMut(Q)) {
        for item in self.iter() {
            run(item);
        }
    }

    /// Entities currently enumerable in matching segments.
    pub fn entities(&self) -> Vec<Entity> {
        self.refresh()
            .iter()
            .flat_map(|(segment, _)| segment.entities().into_iter().map(|(_, entity)| entity))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.refresh()
            .iter()
            .map(|(segment, _)| segment.entities().len())
            .sum()
    }

    /// The item for `entity`, if it is live and its segment matches.
    pub fn get(&self, entity: Entity) -> Option<Q> {
        let (segment, slot) = self.world.location(entity)?;
        self.refresh()
            .into_iter()
            .find(|(matched, _)| matched.index() == segment)
            .map(|(_, query)| query.get(entity, slot))
    }

    pub fn has(&self, entity: Entity) -> bool {
        self.world.location(entity).is_some_and(|(segment, _)| {
            self.refresh()
                .iter()
                .any(|(matched, _)| matched.index() == segment)
        })
    }
}

impl<Q: Queryable> fmt::Debug for Group<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("shape", &std::any::type_name::<Q>())
            .field("segments", &self.state.read().matches.len())
            .finish()
    }
}
