//! etcd v2 backend for kvcoord.
//!
//! Talks to the `/v2/keys` HTTP API with endpoint failover, basic auth and
//! optional TLS. Register it with [`register`] and connect through a
//! [`kvcoord_core::BackendRegistry`].

mod client;
mod store;
mod watch;

use std::sync::Arc;

use kvcoord_core::{BackendRegistry, Store};

pub use store::EtcdStore;

/// Name under which [`register`] installs this backend.
pub const NAME: &str = "etcd";

/// Register the etcd backend under [`NAME`].
pub fn register(registry: &mut BackendRegistry) -> &mut BackendRegistry {
    registry.register(NAME, |endpoints, config| {
        Ok(Arc::new(EtcdStore::new(endpoints, config)?) as Arc<dyn Store>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvcoord_core::{StoreConfig, StoreError};

    #[test]
    fn test_register_requires_endpoints() {
        let mut registry = BackendRegistry::new();
        register(&mut registry);
        assert!(matches!(
            registry.connect(NAME, &[], &StoreConfig::default()),
            Err(StoreError::Config(_))
        ));
    }
}
