//! Distributed mutual-exclusion lock built from CAS writes, sessions and watches.
//!
//! Acquisition writes the lock key with "create only if absent". A contender
//! that loses subscribes to the key and tries again each time it sees the key
//! deleted. There is no queue: whichever retry reaches the backend first
//! wins, so a contender can starve under heavy contention.
//!
//! A lock with a TTL binds its key to a session. If the session is lost the
//! key may already be gone server-side, and the holder learns about it
//! through [`LockLost`] and [`Lock::is_held`].

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::session::{LostSignal, SessionHandle, SessionManager};
use crate::store::Store;
use crate::types::{EventKind, KvPair, LockOptions, SessionId, WatchTarget, WriteOptions};
use crate::watch::{WatchMultiplexer, WatchStream};

/// Lifecycle of a [`Lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Acquiring,
    Held,
    Releasing,
    /// The last acquisition attempt failed (backend error or session loss).
    Failed,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockState::Idle => "idle",
            LockState::Acquiring => "acquiring",
            LockState::Held => "held",
            LockState::Releasing => "releasing",
            LockState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of [`Lock::lock`].
#[derive(Debug)]
pub enum Acquisition {
    /// The lock is held. The signal fires if it is later lost involuntarily.
    Acquired(LockLost),
    /// The caller cancelled the wait. Nothing was left behind.
    Cancelled,
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }
}

/// Fires when a held lock is lost without the holder unlocking it.
#[derive(Debug, Clone)]
pub struct LockLost {
    key: String,
    signal: LostSignal,
}

impl LockLost {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_lost(&self) -> bool {
        self.signal.is_lost()
    }

    /// Wait until the lock is lost and return why. Never resolves for locks
    /// without a TTL, or after a voluntary unlock.
    pub async fn lost(&mut self) -> String {
        self.signal.lost().await
    }
}

struct HeldLock {
    pair: KvPair,
    session: Option<SessionHandle>,
    lost: LostSignal,
}

/// A lock on one key, scoped to one store connection.
pub struct Lock {
    store: Arc<dyn Store>,
    sessions: SessionManager,
    watches: WatchMultiplexer,
    key: String,
    options: LockOptions,
    state: LockState,
    held: Option<HeldLock>,
}

impl Lock {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        sessions: SessionManager,
        watches: WatchMultiplexer,
        key: String,
        options: LockOptions,
    ) -> Self {
        Self {
            store,
            sessions,
            watches,
            key,
            options,
            state: LockState::Idle,
            held: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current state. A held lock whose session was lost reports `Idle`.
    pub fn state(&self) -> LockState {
        if self.state == LockState::Held && self.lost_reason().is_some() {
            return LockState::Idle;
        }
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// The pair written when the lock was acquired.
    pub fn held_pair(&self) -> Option<&KvPair> {
        self.held.as_ref().map(|h| &h.pair)
    }

    /// Session backing the current hold, for locks with a TTL.
    pub fn session_id(&self) -> Option<SessionId> {
        self.held
            .as_ref()
            .and_then(|h| h.session.as_ref())
            .map(SessionHandle::id)
    }

    fn lost_reason(&self) -> Option<String> {
        self.held.as_ref().and_then(|h| h.lost.reason())
    }

    /// Acquire the lock, waiting as long as it takes or until `stop` fires.
    ///
    /// Contention never surfaces as an error. Backend failures and session
    /// loss during the wait do, after any session opened for the attempt
    /// has been released.
    #[instrument(skip(self, stop), fields(key = %self.key), level = "debug")]
    pub async fn lock(&mut self, stop: &CancellationToken) -> Result<Acquisition> {
        if self.is_held() {
            if let Some(held) = &self.held {
                return Ok(Acquisition::Acquired(LockLost {
                    key: self.key.clone(),
                    signal: held.lost.clone(),
                }));
            }
        }
        // A previous hold that was lost leaves a dead session behind.
        if let Some(stale) = self.held.take() {
            self.discard(stale).await;
        }

        self.state = LockState::Acquiring;

        let session = match self.options.effective_ttl() {
            Some(ttl) => {
                let opened = tokio::select! {
                    _ = stop.cancelled() => {
                        self.state = LockState::Idle;
                        return Ok(Acquisition::Cancelled);
                    }
                    opened = self.sessions.open(ttl, self.options.renew_lock.clone()) => opened,
                };
                match opened {
                    Ok(session) => Some(session),
                    Err(e) => {
                        self.state = LockState::Failed;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        match self.acquire(stop, session.as_ref()).await {
            Ok(Some(pair)) => {
                let lost = session
                    .as_ref()
                    .map(SessionHandle::lost_signal)
                    .unwrap_or_else(LostSignal::never);
                info!(key = %self.key, index = pair.last_index, "Lock acquired");
                self.held = Some(HeldLock {
                    pair,
                    session,
                    lost: lost.clone(),
                });
                self.state = LockState::Held;
                Ok(Acquisition::Acquired(LockLost {
                    key: self.key.clone(),
                    signal: lost,
                }))
            }
            Ok(None) => {
                debug!(key = %self.key, "Lock acquisition cancelled");
                self.release_session(session).await;
                self.state = LockState::Idle;
                Ok(Acquisition::Cancelled)
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Lock acquisition failed");
                self.release_session(session).await;
                self.state = LockState::Failed;
                Err(e)
            }
        }
    }

    /// Create-if-absent until it succeeds. `Ok(None)` means cancelled.
    async fn acquire(
        &self,
        stop: &CancellationToken,
        session: Option<&SessionHandle>,
    ) -> Result<Option<KvPair>> {
        let options = WriteOptions {
            ttl: None,
            session: session.map(SessionHandle::id),
        };
        let mut lost = session
            .map(SessionHandle::lost_signal)
            .unwrap_or_else(LostSignal::never);
        let mut deletions: Option<WatchStream> = None;

        loop {
            if stop.is_cancelled() {
                return Ok(None);
            }

            let attempt = tokio::select! {
                _ = stop.cancelled() => return Ok(None),
                attempt = self.store.atomic_put(&self.key, &self.options.value, None, &options) => attempt?,
            };
            if let Some(pair) = attempt {
                return Ok(Some(pair));
            }
            debug!(key = %self.key, "Lock contended, waiting for release");

            if deletions.is_none() {
                let subscription = tokio::select! {
                    _ = stop.cancelled() => return Ok(None),
                    sub = self.watches.subscribe(WatchTarget::key(&self.key), stop) => sub?,
                };
                let gone = !subscription
                    .snapshot
                    .pairs
                    .iter()
                    .any(|p| p.key == self.key);
                deletions = Some(subscription.events);
                if gone {
                    // Released between our attempt and the subscription.
                    continue;
                }
            }
            let Some(stream) = deletions.as_mut() else {
                continue;
            };

            loop {
                tokio::select! {
                    _ = stop.cancelled() => return Ok(None),
                    reason = lost.lost() => return Err(StoreError::SessionLost(reason)),
                    event = stream.next() => match event {
                        Some(Ok(event)) if event.kind == EventKind::Deleted => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(e),
                        None => {
                            if stop.is_cancelled() {
                                return Ok(None);
                            }
                            return Err(StoreError::BackendUnavailable(format!(
                                "watch on lock key {} ended",
                                self.key
                            )));
                        }
                    },
                }
            }
        }
    }

    /// Release the lock if this holder still owns it.
    ///
    /// The key is deleted only if it still carries the revision this holder
    /// wrote, so a key re-acquired by someone else after a lost session is
    /// left alone. Unlocking a lock that is not held, or already lost, is a
    /// no-op. The lock always ends up `Idle`.
    #[instrument(skip(self), fields(key = %self.key), level = "debug")]
    pub async fn unlock(&mut self) -> Result<()> {
        let Some(held) = self.held.take() else {
            self.state = LockState::Idle;
            return Ok(());
        };

        self.state = LockState::Releasing;
        let deleted = self.store.atomic_delete(&self.key, &held.pair).await;
        let released = match held.session {
            Some(session) => session.release().await,
            None => Ok(()),
        };
        self.state = LockState::Idle;

        match deleted {
            Ok(true) => info!(key = %self.key, "Lock released"),
            Ok(false) => {
                debug!(key = %self.key, "Lock key already gone or reassigned, nothing to delete")
            }
            Err(e) => return Err(e),
        }
        released
    }

    async fn discard(&self, stale: HeldLock) {
        debug!(key = %self.key, "Discarding lost lock state");
        self.release_session(stale.session).await;
    }

    async fn release_session(&self, session: Option<SessionHandle>) {
        if let Some(session) = session {
            if let Err(e) = session.release().await {
                warn!(key = %self.key, error = %e, "Failed to release lock session");
            }
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("ttl", &self.options.ttl)
            .finish()
    }
}
