//! Shared in-memory string storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A thread-safe string-to-string store. Clones share the same data, so a
/// test or an embedding process can observe what the state machine applied.
#[derive(Clone, Debug, Default)]
pub struct KvStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current value under `key`, empty if absent.
    pub fn get(&self, key: &str) -> String {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.lock().insert(key.to_owned(), value.to_owned());
    }

    /// Concatenates `value` to whatever is stored under `key`.
    pub fn append(&self, key: &str, value: &str) {
        self.lock()
            .entry(key.to_owned())
            .or_default()
            .push_str(value);
    }

    /// Removes `key`, returning the prior value (empty if absent).
    pub fn delete(&self, key: &str) -> String {
        self.lock().remove(key).unwrap_or_default()
    }

    /// Length of the value under `key`, 0 if absent.
    pub fn len(&self, key: &str) -> usize {
        self.lock().get(key).map(String::len).unwrap_or(0)
    }
}
