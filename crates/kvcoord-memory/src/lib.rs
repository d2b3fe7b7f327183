//! In-process reference backend.
//!
//! Keeps every key in a single ordered map with a global revision counter,
//! leases with deadlines, and a bounded event history for watch replay. A
//! background reaper expires leases and TTL keys; every operation also
//! reaps lazily so expiry never depends on the reaper's tick.
//!
//! The fault-injection hooks (`compact`, `pause_notifications`,
//! `invalidate_watches`, `expire_session`) let tests drive the paths a real
//! cluster only reaches under compaction or partitions.

mod state;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kvcoord_core::{
    normalize_key, BackendEvent, BackendEventStream, BackendRegistry, KvPair, Result, SessionId,
    Snapshot, Store, StoreError, WatchTarget, WriteOptions, DEFAULT_HISTORY_LIMIT,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use state::{Notice, State};

/// Name under which [`register`] installs this backend.
pub const NAME: &str = "memory";

/// Default interval between background expiry sweeps.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(50);

/// Default capacity of the live notification channel. A watcher that falls
/// further behind is invalidated.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Tuning for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Number of past events kept for watch replay.
    pub history_limit: usize,
    pub reap_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            reap_interval: DEFAULT_REAP_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Register the memory backend under [`NAME`]. Endpoints are ignored.
pub fn register(registry: &mut BackendRegistry) -> &mut BackendRegistry {
    registry.register(NAME, |_endpoints, config| {
        let options = MemoryOptions {
            history_limit: config.history_limit,
            ..MemoryOptions::default()
        };
        Ok(Arc::new(MemoryStore::with_options(options)) as Arc<dyn Store>)
    })
}

/// In-process [`Store`] with etcd-like revision, lease and watch semantics.
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    reaper: CancellationToken,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(MemoryOptions::default())
    }

    /// Create a store. The background reaper only starts when called inside
    /// a Tokio runtime; expiry is still enforced lazily without it.
    pub fn with_options(options: MemoryOptions) -> Self {
        let state = Arc::new(Mutex::new(State::new(
            options.history_limit,
            options.channel_capacity,
        )));
        let reaper = CancellationToken::new();

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap_loop(
                Arc::downgrade(&state),
                options.reap_interval,
                reaper.clone(),
            ));
        } else {
            debug!("No runtime, background reaper disabled");
        }

        Self { state, reaper }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock the state after expiring anything whose deadline has passed.
    fn current(&self) -> Result<MutexGuard<'_, State>> {
        let mut st = self.lock();
        st.ensure_open()?;
        st.reap(Instant::now());
        Ok(st)
    }

    /// Current store revision.
    pub fn revision(&self) -> u64 {
        self.lock().revision()
    }

    /// Forget history at or below `revision`. Watches resuming from an
    /// older index are invalidated.
    pub fn compact(&self, revision: u64) {
        self.lock().compact(revision);
        info!(revision, "Compacted history");
    }

    /// Stop delivering live notifications. Changes keep being recorded in
    /// history.
    pub fn pause_notifications(&self) {
        self.lock().set_paused(true);
    }

    /// Tell every live watch to resynchronise, and resume notifications.
    pub fn invalidate_watches(&self) {
        let mut st = self.lock();
        st.set_paused(false);
        st.invalidate_watches();
    }

    /// Revoke a lease out-of-band, as an operator or a partition would.
    pub fn expire_session(&self, session: SessionId) -> Result<()> {
        let count = self.lock().revoke(session)?;
        warn!(session = %session, keys = count, "Session expired out-of-band");
        Ok(())
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

async fn reap_loop(
    state: std::sync::Weak<Mutex<State>>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(state) = state.upgrade() else {
            break;
        };
        let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
        st.reap(Instant::now());
    }
    debug!("Reaper stopped");
}

fn checked_key(key: &str) -> Result<String> {
    let key = normalize_key(key);
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(key)
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        NAME
    }

    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        Ok(self.current()?.get(&normalize_key(key)))
    }

    #[instrument(skip(self, value, options), level = "debug", fields(len = value.len()))]
    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<KvPair> {
        let key = checked_key(key)?;
        let now = Instant::now();
        self.current()?
            .put(&key, value, options.session, options.effective_ttl(), now)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.current()?.remove(&normalize_key(key)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        Ok(self.current()?.list(&normalize_key(prefix)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let mut st = self.current()?;
        let keys: Vec<String> = st
            .list(&normalize_key(prefix))
            .into_iter()
            .map(|p| p.key)
            .collect();
        for key in &keys {
            st.remove(key);
        }
        debug!(count = keys.len(), "Deleted tree");
        Ok(())
    }

    #[instrument(skip(self, value, previous, options), level = "debug")]
    async fn atomic_put(
        &self,
        key: &str,
        value: &[u8],
        previous: Option<&KvPair>,
        options: &WriteOptions,
    ) -> Result<Option<KvPair>> {
        let key = checked_key(key)?;
        let now = Instant::now();
        let mut st = self.current()?;

        let current = st.current_index(&key);
        let matches = match (previous, current) {
            (None, None) => true,
            (Some(prev), Some(index)) => prev.last_index == index,
            _ => false,
        };
        if !matches {
            debug!(key = %key, ?current, "Compare-and-swap put rejected");
            return Ok(None);
        }

        st.put(&key, value, options.session, options.effective_ttl(), now)
            .map(Some)
    }

    #[instrument(skip(self, previous), level = "debug")]
    async fn atomic_delete(&self, key: &str, previous: &KvPair) -> Result<bool> {
        let key = normalize_key(key);
        let mut st = self.current()?;
        if st.current_index(&key) != Some(previous.last_index) {
            return Ok(false);
        }
        Ok(st.remove(&key))
    }

    async fn snapshot(&self, target: &WatchTarget) -> Result<Snapshot> {
        let st = self.current()?;
        Ok(Snapshot {
            pairs: st.select(target),
            index: st.revision(),
        })
    }

    #[instrument(skip(self), level = "debug", fields(watch = %target))]
    async fn watch_raw(
        &self,
        target: WatchTarget,
        after_index: u64,
    ) -> Result<BackendEventStream> {
        let (replay, mut last, mut rx) = self.current()?.open_watch(&target, after_index)?;

        Ok(Box::pin(async_stream::stream! {
            let Some(replay) = replay else {
                debug!(watch = %target, after_index, "Requested revision compacted");
                yield Ok::<_, StoreError>(BackendEvent::Invalidated);
                return;
            };
            for event in replay {
                last = event.index;
                yield Ok(BackendEvent::Change(event));
            }
            loop {
                match rx.recv().await {
                    Ok(Notice::Event(event)) => {
                        if event.index > last && target.matches(&event.key) {
                            last = event.index;
                            yield Ok(BackendEvent::Change(event));
                        }
                    }
                    Ok(Notice::Invalidate) => {
                        yield Ok(BackendEvent::Invalidated);
                        return;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(watch = %target, skipped, "Watcher lagged behind");
                        yield Ok(BackendEvent::Invalidated);
                        return;
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        }))
    }

    #[instrument(skip(self), level = "debug")]
    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl("session ttl must be positive".to_string()));
        }
        let id = self.current()?.grant(ttl, Instant::now());
        debug!(session = %id, "Granted session");
        Ok(id)
    }

    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        self.current()?.keep_alive(session, Instant::now())
    }

    #[instrument(skip(self), level = "debug")]
    async fn revoke_session(&self, session: SessionId) -> Result<()> {
        let count = self.current()?.revoke(session)?;
        debug!(session = %session, keys = count, "Revoked session");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.reaper.cancel();
        self.lock().close();
        info!("Memory store closed");
        Ok(())
    }
}
