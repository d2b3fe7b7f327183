#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kvcoord_core::{
    BackendEventStream, Coordinator, KvPair, Result, SessionId, Snapshot, Store, StoreError,
    WatchTarget, WriteOptions,
};
use kvcoord_memory::MemoryStore;

pub fn setup() -> (Arc<MemoryStore>, Coordinator) {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(store.clone());
    (store, coordinator)
}

pub fn keys(pairs: &[KvPair]) -> Vec<&str> {
    pairs.iter().map(|p| p.key.as_str()).collect()
}

/// Memory store whose renewals can be made to fail or hang on demand.
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing_renewals: AtomicU32,
    hanging_renewals: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_renewals: AtomicU32::new(0),
            hanging_renewals: AtomicBool::new(false),
        }
    }

    /// Fail the next `n` keep-alive calls with a transport error.
    pub fn fail_renewals(&self, n: u32) {
        self.failing_renewals.store(n, Ordering::SeqCst);
    }

    /// Make every later keep-alive call block forever, like a request to
    /// a partitioned node.
    pub fn hang_renewals(&self) {
        self.hanging_renewals.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<KvPair> {
        self.inner.put(key, value, options).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.inner.list(prefix).await
    }

    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        self.inner.delete_tree(prefix).await
    }

    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
        options: &WriteOptions,
    ) -> Result<Option<KvPair>> {
        self.inner.atomic_put(key, value, previous, options).await
    }

    async fn atomic_delete(&self, key: &str, previous: &KvPair) -> Result<bool> {
        self.inner.atomic_delete(key, previous).await
    }

    async fn snapshot(&self, target: &WatchTarget) -> Result<Snapshot> {
        self.inner.snapshot(target).await
    }

    async fn watch_raw(
        &self,
        target: WatchTarget,
        after_index: u64,
    ) -> Result<BackendEventStream> {
        self.inner.watch_raw(target, after_index).await
    }

    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        self.inner.grant_session(ttl).await
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        if self.hanging_renewals.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let remaining = self.failing_renewals.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_renewals.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::BackendUnavailable(
                "connection refused".to_string(),
            ));
        }
        self.inner.keep_alive(session).await
    }

    async fn revoke_session(&self, session: SessionId) -> Result<()> {
        self.inner.revoke_session(session).await
    }
}
