//! Watch multiplexer.
//!
//! Every subscriber gets its own task and its own backend watch, started at
//! the revision of the snapshot it was handed, so there is no shared cursor
//! between subscribers. Within a subscription events arrive in backend order
//! and at most once. When the backend invalidates a watch the task re-reads
//! the target, emits synthetic events for whatever it missed and resumes.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::error::{Result, StoreError};
use crate::store::{BackendEventStream, Store};
use crate::types::{BackendEvent, KvPair, Snapshot, WatchEvent, WatchTarget};

/// Events buffered per subscriber before the backend watch is back-pressured.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Fans backend watches out to independent subscribers.
#[derive(Clone)]
pub struct WatchMultiplexer {
    store: Arc<dyn Store>,
    subscribers: Arc<Mutex<HashMap<u64, WatchTarget>>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

/// A new subscription: the state it started from, and what changed since.
pub struct Subscription {
    pub snapshot: Snapshot,
    pub events: WatchStream,
}

impl WatchMultiplexer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_buffer(store, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn with_buffer(store: Arc<dyn Store>, buffer: usize) -> Self {
        Self {
            store,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// Subscribe to a key or prefix.
    ///
    /// The subscription ends without error when `cancel` fires or the
    /// returned stream is dropped. Backend failures are delivered once as an
    /// `Err` item, after which the stream ends.
    pub async fn subscribe(
        &self,
        target: WatchTarget,
        cancel: &CancellationToken,
    ) -> Result<Subscription> {
        let snapshot = self.store.snapshot(&target).await?;
        let raw = self.store.watch_raw(target.clone(), snapshot.index).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_table().insert(id, target.clone());

        let (tx, rx) = mpsc::channel(self.buffer);
        let token = cancel.child_token();

        let subscriber = Subscriber {
            store: self.store.clone(),
            target: target.clone(),
            known: snapshot
                .pairs
                .iter()
                .map(|p| (p.key.clone(), p.clone()))
                .collect(),
            resume: snapshot.index,
            tx,
            cancel: token.clone(),
            _entry: TableEntry {
                id,
                table: self.subscribers.clone(),
            },
        };
        tokio::spawn(subscriber.run(raw));

        debug!(subscriber = id, watch = %target, index = snapshot.index, "Watch subscribed");

        Ok(Subscription {
            snapshot,
            events: WatchStream {
                rx: ReceiverStream::new(rx),
                _guard: token.drop_guard(),
            },
        })
    }

    /// Targets of the subscriptions that are still running.
    pub fn active_subscriptions(&self) -> Vec<WatchTarget> {
        let table = self.lock_table();
        let mut ids: Vec<_> = table.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter().filter_map(|id| table.get(&id).cloned()).collect()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, WatchTarget>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Ordered change events for one subscriber.
pub struct WatchStream {
    rx: ReceiverStream<Result<WatchEvent>>,
    _guard: DropGuard,
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// Removes a subscriber from the table when its task ends, however it ends.
struct TableEntry {
    id: u64,
    table: Arc<Mutex<HashMap<u64, WatchTarget>>>,
}

impl Drop for TableEntry {
    fn drop(&mut self) {
        let mut table = self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        table.remove(&self.id);
    }
}

struct Subscriber {
    store: Arc<dyn Store>,
    target: WatchTarget,
    /// Last known state of every key under the target.
    known: BTreeMap<String, KvPair>,
    /// Highest revision already reflected in `known`.
    resume: u64,
    tx: mpsc::Sender<Result<WatchEvent>>,
    cancel: CancellationToken,
    _entry: TableEntry,
}

impl Subscriber {
    async fn run(mut self, mut raw: BackendEventStream) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = raw.next() => item,
            };

            match item {
                Some(Ok(BackendEvent::Change(event))) => {
                    if event.index <= self.resume || !self.target.matches(&event.key) {
                        trace!(watch = %self.target, index = event.index, "Skipping replayed event");
                        continue;
                    }
                    self.apply(&event);
                    self.resume = event.index;
                    if !self.deliver(Ok(event)).await {
                        break;
                    }
                }
                Some(Ok(BackendEvent::Invalidated)) => {
                    warn!(watch = %self.target, resume = self.resume, "Watch invalidated, resynchronising");
                    match self.resync().await {
                        Ok((missed, reopened)) => {
                            raw = reopened;
                            let mut open = true;
                            for event in missed {
                                if !self.deliver(Ok(event)).await {
                                    open = false;
                                    break;
                                }
                            }
                            if !open {
                                break;
                            }
                        }
                        Err(e) => {
                            self.deliver(Err(e)).await;
                            break;
                        }
                    }
                }
                Some(Err(e)) => {
                    self.deliver(Err(e)).await;
                    break;
                }
                None => {
                    let e = StoreError::BackendUnavailable(format!(
                        "watch on {} closed by backend",
                        self.target
                    ));
                    self.deliver(Err(e)).await;
                    break;
                }
            }
        }
        debug!(watch = %self.target, "Watch subscriber finished");
    }

    fn apply(&mut self, event: &WatchEvent) {
        match &event.pair {
            Some(pair) => {
                self.known.insert(event.key.clone(), pair.clone());
            }
            None => {
                self.known.remove(&event.key);
            }
        }
    }

    /// Re-read the target, compute what was missed and reopen the backend watch.
    async fn resync(&mut self) -> Result<(Vec<WatchEvent>, BackendEventStream)> {
        let snapshot = self.store.snapshot(&self.target).await?;
        let missed = missed_events(&self.known, &snapshot);

        self.known = snapshot
            .pairs
            .into_iter()
            .map(|p| (p.key.clone(), p))
            .collect();
        self.resume = snapshot.index;

        let raw = self
            .store
            .watch_raw(self.target.clone(), snapshot.index)
            .await?;
        debug!(
            watch = %self.target,
            index = snapshot.index,
            missed = missed.len(),
            "Watch resynchronised"
        );
        Ok((missed, raw))
    }

    /// Send to the subscriber. Returns `false` once nobody is listening.
    async fn deliver(&self, item: Result<WatchEvent>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

/// Synthetic events turning `known` into `snapshot`, in revision order.
fn missed_events(known: &BTreeMap<String, KvPair>, snapshot: &Snapshot) -> Vec<WatchEvent> {
    let current: BTreeMap<&str, &KvPair> = snapshot
        .pairs
        .iter()
        .map(|p| (p.key.as_str(), p))
        .collect();

    let mut events = Vec::new();
    for key in known.keys() {
        if !current.contains_key(key.as_str()) {
            events.push(WatchEvent::deleted(key.clone(), snapshot.index));
        }
    }
    for (key, pair) in &current {
        match known.get(*key) {
            None => events.push(WatchEvent::created((*pair).clone())),
            Some(old) if old.last_index != pair.last_index => {
                events.push(WatchEvent::modified((*pair).clone()))
            }
            Some(_) => {}
        }
    }

    for event in &mut events {
        event.synthetic = true;
    }
    events.sort_by_key(|e| e.index);
    events
}
