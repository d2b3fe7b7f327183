//! Explicit backend registration table.
//!
//! Backends register a constructor under a name; callers pick a backend by
//! name at connection time. The table is an ordinary value built at startup
//! and passed to whoever connects, so there is no process-wide state and
//! registration order does not matter.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::store::Store;

/// Builds a store from endpoints and connection settings.
pub type Constructor =
    Arc<dyn Fn(&[String], &StoreConfig) -> Result<Arc<dyn Store>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct BackendRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> &mut Self
    where
        F: Fn(&[String], &StoreConfig) -> Result<Arc<dyn Store>> + Send + Sync + 'static,
    {
        debug!(backend = name, "Registered store backend");
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered backend names, sorted.
    pub fn backends(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Connect to the backend registered under `name`.
    pub fn connect(
        &self,
        name: &str,
        endpoints: &[String],
        config: &StoreConfig,
    ) -> Result<Arc<dyn Store>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| StoreError::BackendNotSupported(name.to_string()))?;
        config.validate()?;
        constructor(endpoints, config)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
