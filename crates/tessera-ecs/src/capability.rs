//! Type-keyed capability registries with three-tier resolution.
//!
//! Several subsystems need "the implementation of X for type T": queriers,
//! resolvers, dependers, injectors, analyzers and builders. They all share
//! one lookup rule:
//!
//! 1. an implementation explicitly registered for `T` with [`Capabilities::set`];
//! 2. otherwise a default declared by `T` itself (usually a trait method);
//! 3. otherwise a generic fallback supplied by the caller.

use crate::EcsError;
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Entry {
    key: TypeId,
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

pub struct Capabilities {
    name: &'static str,
    entries: RwLock<Vec<Entry>>,
    version: AtomicUsize,
}

impl Capabilities {
    /// `name` identifies the capability in errors and logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(Vec::new()),
            version: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register `implementation` for key `K`. Returns `true` if `K` had no
    /// registration before.
    pub fn set<K: ?Sized + 'static, I: Send + Sync + 'static>(&self, implementation: I) -> bool {
        let key = TypeId::of::<K>();
        let value: Arc<dyn Any + Send + Sync> = Arc::new(implementation);
        let mut entries = self.entries.write();
        self.version.fetch_add(1, Ordering::AcqRel);
        match entries.iter_mut().find(|entry| entry.key == key) {
            Some(entry) => {
                tracing::debug!(capability = self.name, key = entry.name, "capability replaced");
                entry.value = value;
                false
            }
            None => {
                entries.push(Entry {
                    key,
                    name: std::any::type_name::<K>(),
                    value,
                });
                true
            }
        }
    }

    pub fn has<K: ?Sized + 'static>(&self) -> bool {
        let key = TypeId::of::<K>();
        self.entries.read().iter().any(|entry| entry.key == key)
    }

    pub fn remove<K: ?Sized + 'static>(&self) -> bool {
        let key = TypeId::of::<K>();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.key != key);
        let removed = entries.len() != before;
        if removed {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    /// Resolve the implementation for `K`.
    ///
    /// The registry lock is released before `declared` or `fallback` run, so
    /// they may consult this registry recursively.
    pub fn get<K, I>(
        &self,
        declared: impl FnOnce() -> Option<I>,
        fallback: impl FnOnce() -> Option<I>,
    ) -> Result<I, EcsError>
    where
        K: ?Sized + 'static,
        I: Clone + Send + Sync + 'static,
    {
        self.get_by_id(TypeId::of::<K>(), std::any::type_name::<K>(), declared, fallback)
    }

    /// [`get`](Self::get) for a key only known at runtime.
    pub fn get_by_id<I>(
        &self,
        key: TypeId,
        name: &'static str,
        declared: impl FnOnce() -> Option<I>,
        fallback: impl FnOnce() -> Option<I>,
    ) -> Result<I, EcsError>
    where
        I: Clone + Send + Sync + 'static,
    {
        let explicit = self
            .entries
            .read()
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value.clone());

        if let Some(value) = explicit {
            return value
                .downcast_ref::<I>()
                .cloned()
                .ok_or_else(|| EcsError::CapabilityMismatch {
                    capability: self.name,
                    key: name,
                    expected: std::any::type_name::<I>(),
                });
        }
        declared()
            .or_else(fallback)
            .ok_or(EcsError::MissingCapability {
                capability: self.name,
                key: name,
            })
    }

    /// Every explicit registration, in registration order.
    pub fn implementations(&self) -> Vec<(&'static str, Arc<dyn Any + Send + Sync>)> {
        self.entries
            .read()
            .iter()
            .map(|entry| (entry.name, entry.value.clone()))
            .collect()
    }

    /// Bumped on every `set` and successful `remove`; used to invalidate
    /// caches built from this registry.
    pub fn version(&self) -> usize {
        self.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.entries.read().iter().map(|entry| entry.name).collect();
        f.debug_struct("Capabilities")
            .field("name", &self.name)
            .field("entries", &names)
            .finish()
    }
}
