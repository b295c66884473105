//! Tessera ECS -- segment-based Entity Component System with generational ids.
//!
//! Entities live in *segments*, one per distinct set of component types.
//! Component values are kept in per-type [`Store`](store::Store)s, either
//! inside the segment (dense, indexed by segment slot) or world-wide (indexed
//! by entity index or by a dictionary). Queries are composed from small
//! shapes (`Read`, `Write`, `Maybe`, tuples, `Any`, filters) and matched once
//! per segment.
//!
//! Structural changes made while iterating go through the deferred
//! [`Resolvers`](resolver::Resolvers) queue and are applied by
//! [`World::resolve`](world::World::resolve).
//!
//! # Quick Start
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//! impl Component for Position {}
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//! impl Component for Velocity {}
//!
//! let world = World::new();
//! let entity = world.spawn((Position { x: 0.0, y: 0.0 }, Velocity { dx: 1.0, dy: 0.0 }));
//!
//! for (position, velocity) in world.group::<(Write<Position>, Read<Velocity>)>().iter() {
//!     let Some(v) = velocity.get() else { continue };
//!     position.update(|p| p.x += v.dx);
//! }
//!
//! assert_eq!(world.get::<Position>(entity), Some(Position { x: 1.0, y: 0.0 }));
//! ```

#![deny(unsafe_code)]

pub mod bitmask;
pub mod boxes;
pub mod capability;
pub mod component;
pub mod entity;
pub mod family;
pub mod group;
pub mod message;
pub mod module;
pub mod query;
pub mod resolver;
pub mod segment;
pub mod store;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
///
/// Plain lookups report absence with `bool` / `Option`; these variants cover
/// operations whose caller must be told *why* they failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::Entity },

    /// No explicit, declared or fallback implementation could be found.
    #[error("no {capability} implementation for '{key}' (none registered, declared or defaulted)")]
    MissingCapability {
        capability: &'static str,
        key: &'static str,
    },

    /// An explicit registration exists but has a different type than requested.
    #[error("{capability} registered for '{key}' is not a '{expected}'")]
    CapabilityMismatch {
        capability: &'static str,
        key: &'static str,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bitmask::BitMask;
    pub use crate::boxes::{Boxes, Resource};
    pub use crate::capability::Capabilities;
    pub use crate::component::{Component, Metadata, Storage};
    pub use crate::entity::Entity;
    pub use crate::family::Families;
    pub use crate::group::Group;
    pub use crate::message::{
        Emitter, Message, Messages, OnAdd, OnAdopt, OnCreate, OnPostDestroy, OnPreDestroy,
        OnReject, OnRemove, OnSegment, Receiver,
    };
    pub use crate::module::{Module, Modules};
    pub use crate::query::{Any, Has, Maybe, Not, Query, Queryable, Read, Write};
    pub use crate::resolver::{Defer, Destroy, Insert, Remove, Resolvable, Resolver, Resolvers};
    pub use crate::segment::Segment;
    pub use crate::world::{Bundle, World, WorldConfig};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
