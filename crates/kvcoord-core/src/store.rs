use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::types::{BackendEvent, KvPair, SessionId, Snapshot, WatchTarget, WriteOptions};

/// Raw change stream produced by a backend. Dropping it ends the backend
/// subscription.
pub type BackendEventStream = Pin<Box<dyn Stream<Item = Result<BackendEvent>> + Send>>;

/// Capability interface every pluggable backend implements.
///
/// The coordination layer (sessions, watches, locks) is written once against
/// this trait and never branches on which backend is behind it. Errors are
/// reserved for connectivity and protocol failures:
/// - absent keys are `Ok(None)` / `Ok(false)`
/// - compare-and-swap mismatches are `Ok(None)` / `Ok(false)`
///
/// Object-safe, used as `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name, as registered.
    fn name(&self) -> &str;

    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<KvPair>>;

    /// Unconditionally write a key.
    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<KvPair>;

    /// Delete a key. Returns `false` if it did not exist.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// All pairs under a prefix, sorted by key.
    ///
    /// A key that is not a directory lists as itself. A missing prefix lists
    /// as empty.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;

    /// Delete every key under a prefix.
    async fn delete_tree(&self, prefix: &str) -> Result<()>;

    /// Compare-and-swap write.
    ///
    /// With `previous == None` the write only succeeds if the key is absent;
    /// otherwise only if the key's current `last_index` equals
    /// `previous.last_index`. Returns the new pair, or `None` on mismatch.
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
        options: &WriteOptions,
    ) -> Result<Option<KvPair>>;

    /// Compare-and-swap delete. Returns `false` if the key is absent or was
    /// modified since `previous`.
    async fn atomic_delete(&self, key: &str, previous: &KvPair) -> Result<bool>;

    /// Current state of a key or prefix together with the store revision.
    async fn snapshot(&self, target: &WatchTarget) -> Result<Snapshot>;

    /// Subscribe to changes committed after `after_index` (`0` = from now).
    async fn watch_raw(&self, target: WatchTarget, after_index: u64)
        -> Result<BackendEventStream>;

    /// Establish a lease of `ttl`. Keys written with the returned id are
    /// removed when the lease expires or is revoked.
    async fn grant_session(&self, ttl: Duration) -> Result<SessionId>;

    /// Renew a lease. Fails with `SessionLost` if the lease is gone.
    async fn keep_alive(&self, session: SessionId) -> Result<()>;

    /// End a lease now, removing every key bound to it.
    async fn revoke_session(&self, session: SessionId) -> Result<()>;

    /// Release backend resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
