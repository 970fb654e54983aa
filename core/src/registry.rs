//! Name → capability registry.
//!
//! Hosts populate a registry at startup (native functions, module loaders,
//! and the like) and look capabilities up by name afterwards. It is an
//! ordinary value passed by reference rather than process-wide state, so tests
//! and separate engines each get their own.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("capability name must not be empty")]
    EmptyName,
    #[error("capability '{0}' is already registered")]
    Duplicate(String),
}

/// Read-mostly map from name to capability.
pub struct Registry<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> Registry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, T>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, T>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a capability. Fails if the name is blank or already taken.
    pub fn register(&self, name: impl Into<String>, capability: T) -> Result<(), RegistryError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut entries = self.write();
        if entries.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(capability = %name, "Registered capability");
        entries.insert(name, capability);
        Ok(())
    }

    /// Insert or overwrite a capability, returning the previous one.
    pub fn replace(&self, name: impl Into<String>, capability: T) -> Option<T> {
        self.write().insert(name.into(), capability)
    }

    pub fn remove(&self, name: &str) -> Option<T> {
        self.write().remove(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl<T: Clone> Registry<T> {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<T> {
        self.read().get(name).cloned()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .finish()
    }
}
