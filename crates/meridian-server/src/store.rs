use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;

/// Opaque value kept in the [`Store`].
pub type StoreValue = Arc<dyn Any + Send + Sync>;

/// Server-scoped key/value map shared by initializers and handlers.
///
/// Cloning yields another handle on the same map. Last write wins; there is
/// no removal.
#[derive(Clone, Default)]
pub struct Store {
    entries: Arc<DashMap<String, StoreValue>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: StoreValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<StoreValue> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Typed read. `None` when the key is missing or holds another type.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.get(key)?.downcast::<T>().ok()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("len", &self.len()).finish()
    }
}
