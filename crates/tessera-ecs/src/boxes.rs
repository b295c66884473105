//! Boxes: a keyed value store shared by everything in a world.
//!
//! Entries are keyed by value type plus a string key, so several values of
//! one type can coexist. The map sits behind a reader/writer lock: any number
//! of readers, or exactly one writer.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Entry = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct Boxes {
    entries: RwLock<HashMap<(TypeId, String), Entry>>,
}

impl Boxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`. Returns `true` if the slot was empty.
    pub fn set<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) -> bool {
        self.entries
            .write()
            .insert((TypeId::of::<T>(), key.into()), Arc::new(value))
            .is_none()
    }

    pub fn try_get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.entries.read();
        let entry = entries.get(&(TypeId::of::<T>(), key.to_owned()))?;
        entry.clone().downcast::<T>().ok()
    }

    /// Fetch the value under `key`, inserting `create()` if it is missing.
    /// Check and insert happen under one write lock.
    pub fn get_or_insert_with<T: Send + Sync + 'static>(
        &self,
        key: &str,
        create: impl FnOnce() -> T,
    ) -> Arc<T> {
        let slot = (TypeId::of::<T>(), key.to_owned());
        let found = |entries: &HashMap<(TypeId, String), Entry>| {
            entries
                .get(&slot)
                .and_then(|entry| entry.clone().downcast::<T>().ok())
        };
        if let Some(value) = found(&self.entries.read()) {
            return value;
        }
        let mut entries = self.entries.write();
        if let Some(value) = found(&entries) {
            return value;
        }
        let value = Arc::new(create());
        entries.insert(slot.clone(), value.clone());
        value
    }

    pub fn remove<T: Send + Sync + 'static>(&self, key: &str) -> bool {
        self.entries
            .write()
            .remove(&(TypeId::of::<T>(), key.to_owned()))
            .is_some()
    }

    pub fn has<T: Send + Sync + 'static>(&self, key: &str) -> bool {
        self.entries
            .read()
            .contains_key(&(TypeId::of::<T>(), key.to_owned()))
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
}

impl fmt::Debug for Boxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Boxes").field("len", &self.len()).finish()
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A world-wide singleton value, stored in [`Boxes`] under the empty key.
pub struct Resource<T> {
    value: Arc<RwLock<T>>,
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Resource<T> {
    pub(crate) fn attach(boxes: &Boxes, create: impl FnOnce() -> T) -> Self {
        Self {
            value: boxes.get_or_insert_with("", || RwLock::new(create())),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.value.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.value.write()
    }

    /// Copy of the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.read().clone()
    }

    pub fn set(&self, value: T) {
        *self.value.write() = value;
    }
}

impl<T: fmt::Debug> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Resource").field(&*self.value.read()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_by_type_and_name() {
        let boxes = Boxes::new();
        assert!(boxes.set("speed", 3u32));
        assert!(boxes.set("speed", "fast"));
        assert!(!boxes.set("speed", 4u32));
        assert_eq!(boxes.try_get::<u32>("speed").as_deref(), Some(&4));
        assert_eq!(boxes.try_get::<&str>("speed").as_deref(), Some(&"fast"));
        assert!(boxes.try_get::<u64>("speed").is_none());
        assert_eq!(boxes.len(), 2);

        assert!(boxes.remove::<u32>("speed"));
        assert!(!boxes.has::<u32>("speed"));
        boxes.clear();
        assert!(boxes.is_empty());
    }

    #[test]
    fn resources_share_one_value() {
        let boxes = Boxes::new();
        let a = Resource::<Vec<u32>>::attach(&boxes, Vec::new);
        let b = Resource::<Vec<u32>>::attach(&boxes, || vec![99]);
        a.write().push(1);
        assert_eq!(b.get(), vec![1]);
        b.set(vec![7]);
        assert_eq!(*a.read(), vec![7]);
    }
}
