//! Component types and the process-wide type registry.
//!
//! Every type used as a component (or as a filter key) receives a stable
//! index the first time it is seen. Indices are handed out monotonically
//! under a single write lock and are never reused, so a [`BitMask`] of
//! indices identifies a set of types for the lifetime of the process.

use crate::bitmask::BitMask;
use crate::store::{AnyStore, Store};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// How a component type's values are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Storage {
    /// Dense per-segment arrays indexed by the entity's segment slot.
    Segment,
    /// One global array indexed by the entity's registry index.
    Entity,
    /// One global entity-to-slot map.
    Dictionary,
}

/// A value type that can be attached to entities.
///
/// ```
/// use tessera_ecs::component::{Component, Storage};
///
/// #[derive(Clone)]
/// struct Position { x: f32, y: f32 }
/// impl Component for Position {}
///
/// #[derive(Clone)]
/// struct Name(String);
/// impl Component for Name {
///     const STORAGE: Storage = Storage::Dictionary;
/// }
/// ```
pub trait Component: Clone + Send + Sync + 'static {
    const STORAGE: Storage = Storage::Segment;
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Registry record for one type.
///
/// Equality, hashing and ordering use the index only.
#[derive(Clone, Copy)]
pub struct Metadata {
    pub index: usize,
    pub type_id: TypeId,
    pub name: &'static str,
    /// `None` for types only used as keys (filters, abstract types).
    pub storage: Option<Storage>,
    factory: Option<fn() -> Arc<dyn AnyStore>>,
}

impl Metadata {
    /// Record for any `'static` type, registering it on first use.
    pub fn of<T: ?Sized + 'static>() -> Metadata {
        let type_id = TypeId::of::<T>();
        if let Some(meta) = REGISTRY.read().find(type_id) {
            return meta;
        }
        REGISTRY
            .write()
            .register(type_id, std::any::type_name::<T>(), None)
    }

    /// Record for a component type, including its storage and store factory.
    pub fn component<T: Component>() -> Metadata {
        let type_id = TypeId::of::<T>();
        if let Some(meta) = REGISTRY.read().find(type_id) {
            if meta.storage.is_some() {
                return meta;
            }
        }
        REGISTRY.write().register(
            type_id,
            std::any::type_name::<T>(),
            Some((T::STORAGE, Store::<T>::shared as fn() -> Arc<dyn AnyStore>)),
        )
    }

    /// Look up a record by index.
    pub fn get(index: usize) -> Option<Metadata> {
        REGISTRY.read().infos.get(index).copied()
    }

    /// Create an empty store for this type, if it is a component.
    pub fn create_store(&self) -> Option<Arc<dyn AnyStore>> {
        self.factory.map(|factory| factory())
    }

    /// Whether this is the record of `T`.
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for Metadata {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Metadata {}

impl Hash for Metadata {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl PartialOrd for Metadata {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Metadata {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", short_name(self.name), self.index)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(short_name(self.name))
    }
}

/// Strip module paths from a type name (`a::b::Position` -> `Position`).
pub fn short_name(name: &str) -> &str {
    let head = name.split('<').next().unwrap_or(name);
    match head.rfind("::") {
        Some(at) if head.len() == name.len() => &name[at + 2..],
        _ => name,
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registry {
    by_type: HashMap<TypeId, usize>,
    infos: Vec<Metadata>,
    /// Abstract key -> union of its implementors' bits.
    abstracts: HashMap<TypeId, BitMask>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));

type Factory = (Storage, fn() -> Arc<dyn AnyStore>);

impl Registry {
    fn find(&self, type_id: TypeId) -> Option<Metadata> {
        self.by_type.get(&type_id).map(|&index| self.infos[index])
    }

    fn register(&mut self, type_id: TypeId, name: &'static str, factory: Option<Factory>) -> Metadata {
        // Another writer may have won the race between our read and write.
        if let Some(&index) = self.by_type.get(&type_id) {
            let meta = &mut self.infos[index];
            if meta.storage.is_none() {
                if let Some((storage, create)) = factory {
                    meta.storage = Some(storage);
                    meta.factory = Some(create);
                }
            }
            return *meta;
        }

        let index = self.infos.len();
        let meta = Metadata {
            index,
            type_id,
            name,
            storage: factory.map(|(storage, _)| storage),
            factory: factory.map(|(_, create)| create),
        };
        self.infos.push(meta);
        self.by_type.insert(type_id, index);
        tracing::debug!(index, name, "type registered");
        meta
    }
}

/// Declare `C` an implementor of the abstract key `A`.
///
/// `A` is typically a `dyn Trait`. Filters over `A` then match any segment
/// that holds at least one implementor.
pub fn implement<A: ?Sized + 'static, C: Component>() {
    let bit = Metadata::component::<C>().index;
    REGISTRY
        .write()
        .abstracts
        .entry(TypeId::of::<A>())
        .or_default()
        .add(bit);
}

/// Mask of `K`: its own bit plus the bits of all declared implementors.
pub fn mask_of<K: ?Sized + 'static>() -> BitMask {
    let mut mask = BitMask::with(Metadata::of::<K>().index);
    if let Some(abstracts) = REGISTRY.read().abstracts.get(&TypeId::of::<K>()) {
        mask.add_all(abstracts);
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Alpha;
    impl Component for Alpha {}

    #[derive(Clone)]
    struct Beta;
    impl Component for Beta {
        const STORAGE: Storage = Storage::Dictionary;
    }

    trait Shape {}

    #[test]
    fn indices_are_stable_and_distinct() {
        let a = Metadata::component::<Alpha>();
        let b = Metadata::component::<Beta>();
        assert_ne!(a.index, b.index);
        assert_eq!(Metadata::component::<Alpha>(), a);
        assert_eq!(Metadata::of::<Alpha>(), a);
        assert_eq!(Metadata::get(a.index).map(|m| m.type_id), Some(a.type_id));
        assert_eq!(b.storage, Some(Storage::Dictionary));
        assert!(a.is::<Alpha>());
    }

    #[test]
    fn key_only_types_upgrade_on_component_registration() {
        #[derive(Clone)]
        struct Late;
        impl Component for Late {}

        let key = Metadata::of::<Late>();
        assert_eq!(key.storage, None);
        assert!(key.create_store().is_none());
        let component = Metadata::component::<Late>();
        assert_eq!(component.index, key.index);
        assert_eq!(component.storage, Some(Storage::Segment));
        assert!(component.create_store().is_some());
    }

    #[test]
    fn abstract_masks_collect_implementors() {
        implement::<dyn Shape, Alpha>();
        implement::<dyn Shape, Beta>();
        let mask = mask_of::<dyn Shape>();
        assert!(mask.has(Metadata::of::<Alpha>().index));
        assert!(mask.has(Metadata::of::<Beta>().index));
        assert_eq!(mask_of::<Alpha>(), BitMask::with(Metadata::of::<Alpha>().index));
    }

    #[test]
    fn short_names() {
        assert_eq!(short_name("a::b::Position"), "Position");
        assert_eq!(short_name("Position"), "Position");
        assert_eq!(short_name("a::Read<b::C>"), "a::Read<b::C>");
    }
}
