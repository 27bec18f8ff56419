//! Name-to-factory registry.
//!
//! One [`Registry`] instance exists per plugin kind, process-wide.
//! Entries are registered during startup (before the first service runs)
//! and treated as immutable afterwards; the steady state is concurrent
//! reads under a read-biased lock.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Concurrent map from short plugin name to factory.
pub struct Registry<F> {
    inner: RwLock<HashMap<String, F>>,
}

impl<F: Clone> Registry<F> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a factory under `name`. Duplicate names are rejected so
    /// a plugin cannot silently shadow a builtin.
    pub fn register(&self, name: impl Into<String>, factory: F) -> Result<()> {
        let name = name.into();
        let mut map = self.inner.write().expect("registry lock poisoned");
        if map.contains_key(&name) {
            return Err(Error::Protocol(format!("duplicate registration: {name}")));
        }
        map.insert(name, factory);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<F> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn unregister(&self, name: &str) {
        self.inner
            .write()
            .expect("registry lock poisoned")
            .remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl<F: Clone> Default for Registry<F> {
    fn default() -> Self {
        Self::new()
    }
}
