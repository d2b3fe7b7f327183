//! Caller-facing entry point bundling a store with the coordination layer.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::lock::Lock;
use crate::session::{LostSignal, SessionHandle, SessionManager};
use crate::store::Store;
use crate::types::{normalize_key, KvPair, LockOptions, WatchTarget, WriteOptions};
use crate::watch::{WatchMultiplexer, WatchStream};

/// Successive values of one key.
pub type PairStream = Pin<Box<dyn Stream<Item = Result<KvPair>> + Send>>;

/// Successive full snapshots of a subtree.
pub type TreeStream = Pin<Box<dyn Stream<Item = Result<Vec<KvPair>>> + Send>>;

/// A store plus the session manager and watch multiplexer that run on it.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    sessions: SessionManager,
    watches: WatchMultiplexer,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            sessions: SessionManager::new(store.clone()),
            watches: WatchMultiplexer::new(store.clone()),
            store,
        }
    }

    pub fn with_parts(
        store: Arc<dyn Store>,
        sessions: SessionManager,
        watches: WatchMultiplexer,
    ) -> Self {
        Self {
            store,
            sessions,
            watches,
        }
    }

    /// The underlying store, for plain key-value calls.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn watches(&self) -> &WatchMultiplexer {
        &self.watches
    }

    /// Create a lock on `key`. Nothing is written until [`Lock::lock`].
    pub fn new_lock(&self, key: &str, options: LockOptions) -> Result<Lock> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(StoreError::InvalidKey("lock key must not be empty".to_string()));
        }
        Ok(Lock::new(
            self.store.clone(),
            self.sessions.clone(),
            self.watches.clone(),
            key,
            options,
        ))
    }

    /// Typed change events for a key or prefix.
    pub async fn watch_events(
        &self,
        target: WatchTarget,
        cancel: &CancellationToken,
    ) -> Result<WatchStream> {
        Ok(self.watches.subscribe(target, cancel).await?.events)
    }

    /// Values of `key`: the current one (if any), then every new one.
    /// Deletions carry no value and are not reported.
    pub async fn watch(&self, key: &str, cancel: &CancellationToken) -> Result<PairStream> {
        let target = WatchTarget::key(key);
        let subscription = self.watches.subscribe(target, cancel).await?;
        let initial = subscription.snapshot.pairs.into_iter().next();

        let updates = subscription.events.filter_map(|event| async move {
            match event {
                Ok(event) => event.pair.map(Ok),
                Err(e) => Some(Err(e)),
            }
        });

        Ok(Box::pin(
            futures::stream::iter(initial.map(Ok)).chain(updates),
        ))
    }

    /// The subtree under `prefix`: first as it is now (possibly empty), then
    /// again in full after every change.
    pub async fn watch_tree(&self, prefix: &str, cancel: &CancellationToken) -> Result<TreeStream> {
        let target = WatchTarget::prefix(prefix);
        let subscription = self.watches.subscribe(target, cancel).await?;

        let mut tree: BTreeMap<String, KvPair> = subscription
            .snapshot
            .pairs
            .into_iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        let mut events = subscription.events;

        Ok(Box::pin(async_stream::stream! {
            yield Ok(tree.values().cloned().collect::<Vec<KvPair>>());
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        match event.pair {
                            Some(pair) => {
                                tree.insert(event.key, pair);
                            }
                            None => {
                                tree.remove(&event.key);
                            }
                        }
                        yield Ok(tree.values().cloned().collect::<Vec<KvPair>>());
                    }
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }

    /// Write a key that lives only as long as the returned handle keeps its
    /// session alive.
    #[instrument(skip(self, value), level = "debug")]
    pub async fn put_ephemeral(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<EphemeralKey> {
        let session = self.sessions.open(ttl, None).await?;
        match self
            .store
            .put(key, value, &WriteOptions::with_session(session.id()))
            .await
        {
            Ok(pair) => {
                debug!(key = %pair.key, session = %session.id(), "Wrote ephemeral key");
                Ok(EphemeralKey { pair, session })
            }
            Err(e) => {
                let _ = session.release().await;
                Err(e)
            }
        }
    }
}

/// A key bound to a renewed session. Dropping it lets the key expire;
/// [`EphemeralKey::release`] removes it immediately.
#[derive(Debug)]
pub struct EphemeralKey {
    pair: KvPair,
    session: SessionHandle,
}

impl EphemeralKey {
    pub fn pair(&self) -> &KvPair {
        &self.pair
    }

    pub fn lost_signal(&self) -> LostSignal {
        self.session.lost_signal()
    }

    pub async fn release(self) -> Result<()> {
        self.session.release().await
    }
}
