//! Type-keyed service container attached to a world.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A world-level service. Modules that buffer work override `resolve`,
/// which the world calls at every resolve point.
pub trait Module: Send + Sync + 'static {
    /// Flush pending work. Returns `true` if anything changed.
    fn resolve(&self) -> bool {
        false
    }
}

struct Entry {
    key: TypeId,
    name: &'static str,
    module: Arc<dyn Module>,
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
pub struct Modules {
    entries: RwLock<Vec<Entry>>,
}

impl Modules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_get<M: Module>(&self) -> Option<Arc<M>> {
        let key = TypeId::of::<M>();
        let any = self
            .entries
            .read()
            .iter()
            .find(|entry| entry.key == key)?
            .any
            .clone();
        any.downcast::<M>().ok()
    }

    /// Register `module`. A replacement keeps the original registration
    /// position. Returns `true` if `M` was not registered before.
    pub fn set<M: Module>(&self, module: M) -> bool {
        let key = TypeId::of::<M>();
        let module = Arc::new(module);
        let entry = Entry {
            key,
            name: std::any::type_name::<M>(),
            module: module.clone(),
            any: module,
        };
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|existing| existing.key == key) {
            Some(existing) => {
                *existing = entry;
                false
            }
            None => {
                entries.push(entry);
                true
            }
        }
    }

    pub fn remove<M: Module>(&self) -> bool {
        let key = TypeId::of::<M>();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.key != key);
        entries.len() != before
    }

    pub fn has<M: Module>(&self) -> bool {
        let key = TypeId::of::<M>();
        self.entries.read().iter().any(|entry| entry.key == key)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve every module in registration order.
    pub fn resolve(&self) -> bool {
        let modules: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|entry| entry.module.clone())
            .collect();
        modules
            .iter()
            .fold(false, |changed, module| module.resolve() | changed)
    }
}

impl fmt::Debug for Modules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.entries.read().iter().map(|entry| entry.name).collect();
        f.debug_struct("Modules").field("entries", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct First(Arc<Mutex<Vec<&'static str>>>);
    impl Module for First {
        fn resolve(&self) -> bool {
            self.0.lock().push("first");
            true
        }
    }

    struct Second(Arc<Mutex<Vec<&'static str>>>);
    impl Module for Second {
        fn resolve(&self) -> bool {
            self.0.lock().push("second");
            false
        }
    }

    struct Inert;
    impl Module for Inert {}

    #[test]
    fn resolve_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let modules = Modules::new();
        assert!(modules.set(Second(log.clone())));
        assert!(modules.set(First(log.clone())));
        assert!(modules.set(Inert));
        // Replacing keeps position.
        assert!(!modules.set(Second(log.clone())));

        assert!(modules.resolve());
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    #[test]
    fn get_remove_clear() {
        let modules = Modules::new();
        assert!(modules.try_get::<Inert>().is_none());
        modules.set(Inert);
        assert!(modules.try_get::<Inert>().is_some());
        assert!(modules.has::<Inert>());
        assert!(modules.remove::<Inert>());
        assert!(!modules.remove::<Inert>());
        modules.set(Inert);
        modules.clear();
        assert!(modules.is_empty());
    }
}
