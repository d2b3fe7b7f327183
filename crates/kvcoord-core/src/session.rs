//! TTL session manager.
//!
//! A session is a backend lease kept alive by a background task that renews
//! it every `ttl / 3`. Renewal failures are retried on the following ticks.
//! The session is declared lost, and every [`LostSignal`] derived from it
//! resolves, on the first of:
//!
//! - `max_renewal_failures` consecutive failed renewals
//! - the backend saying the lease is gone
//! - a full TTL passing since the last renewal that was sent and succeeded,
//!   including while a renewal call is still hanging
//!
//! The deadline is measured from when the successful request was sent, so
//! the client never believes in a lease the backend may already have
//! expired.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::SessionId;

/// Consecutive renewal failures tolerated before a session is declared lost.
pub const DEFAULT_MAX_RENEWAL_FAILURES: u32 = 3;

/// Floor for the renewal period so tiny TTLs do not spin.
const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_renewal_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_renewal_failures: DEFAULT_MAX_RENEWAL_FAILURES,
        }
    }
}

/// A live session as seen by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub ttl: Duration,
    pub last_renewed: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionStatus {
    Active,
    Lost(String),
}

/// Renewal period for a TTL: a third of it, so one missed tick is survivable.
pub fn renewal_period(ttl: Duration) -> Duration {
    (ttl / 3).max(MIN_RENEWAL_PERIOD)
}

/// Opens sessions and tracks the ones that are still alive.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn Store>,
    config: SessionConfig,
    active: Arc<DashMap<SessionId, Session>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_config(store, SessionConfig::default())
    }

    pub fn with_config(store: Arc<dyn Store>, config: SessionConfig) -> Self {
        Self {
            store,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Grant a session of `ttl` and start renewing it.
    ///
    /// If `renew_stop` is cancelled, renewal stops and the session is
    /// declared lost once its TTL has run out.
    #[instrument(skip(self, renew_stop), level = "debug")]
    pub async fn open(
        &self,
        ttl: Duration,
        renew_stop: Option<CancellationToken>,
    ) -> Result<SessionHandle> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl(
                "session ttl must be greater than zero".to_string(),
            ));
        }

        let granted_at = Instant::now();
        let id = self.store.grant_session(ttl).await?;
        let session = Session {
            id,
            ttl,
            last_renewed: Utc::now(),
        };
        self.active.insert(id, session.clone());

        let (status_tx, status_rx) = watch::channel(SessionStatus::Active);
        let cancel = CancellationToken::new();

        let renewal = Renewal {
            store: self.store.clone(),
            active: self.active.clone(),
            id,
            ttl,
            max_failures: self.config.max_renewal_failures.max(1),
            status: status_tx,
        };
        let renew_stop = renew_stop.unwrap_or_else(CancellationToken::new);
        let task = tokio::spawn(renewal.run(granted_at, cancel.clone(), renew_stop));

        info!(
            session = %id,
            ttl_ms = ttl.as_millis() as u64,
            period_ms = renewal_period(ttl).as_millis() as u64,
            "Opened session"
        );

        Ok(SessionHandle {
            session,
            store: self.store.clone(),
            active: self.active.clone(),
            cancel,
            task: Some(task),
            status: status_rx,
        })
    }

    /// Sessions currently being renewed.
    pub fn active_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.active.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }
}

/// Background renewal loop for one session.
struct Renewal {
    store: Arc<dyn Store>,
    active: Arc<DashMap<SessionId, Session>>,
    id: SessionId,
    ttl: Duration,
    max_failures: u32,
    status: watch::Sender<SessionStatus>,
}

impl Renewal {
    async fn run(
        self,
        granted_at: Instant,
        cancel: CancellationToken,
        renew_stop: CancellationToken,
    ) {
        let period = renewal_period(self.ttl);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // When the last successful renewal (or the grant) was sent.
        let mut last_ok = granted_at;
        let mut failures: u32 = 0;

        loop {
            let deadline = last_ok + self.ttl;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(session = %self.id, "Session renewal cancelled");
                    return;
                }
                _ = renew_stop.cancelled() => {
                    info!(session = %self.id, "Session renewal stopped on request, letting it lapse");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep_until(deadline) => {}
                    }
                    self.mark_lost("renewal stopped and ttl elapsed".to_string());
                    return;
                }
                _ = ticker.tick() => {}
                _ = sleep_until(deadline) => {
                    self.mark_lost(format!("not renewed within ttl after {failures} failures"));
                    return;
                }
            }

            let sent_at = Instant::now();
            let renewed = tokio::select! {
                _ = cancel.cancelled() => return,
                result = timeout_at(deadline, self.store.keep_alive(self.id)) => result,
            };

            match renewed {
                Err(_) => {
                    self.mark_lost(format!(
                        "renewal did not complete within ttl ({} ms)",
                        self.ttl.as_millis()
                    ));
                    return;
                }
                Ok(Ok(())) => {
                    failures = 0;
                    last_ok = sent_at;
                    if let Some(mut session) = self.active.get_mut(&self.id) {
                        session.last_renewed = Utc::now();
                    }
                    debug!(session = %self.id, "Renewed session");
                }
                Ok(Err(StoreError::SessionLost(reason))) => {
                    self.mark_lost(reason);
                    return;
                }
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(
                        session = %self.id,
                        failures,
                        max_failures = self.max_failures,
                        error = %e,
                        "Session renewal failed"
                    );
                    if failures >= self.max_failures {
                        self.mark_lost(format!(
                            "{failures} consecutive renewal failures, last: {e}"
                        ));
                        return;
                    }
                }
            }
        }
    }

    fn mark_lost(&self, reason: String) {
        warn!(session = %self.id, reason = %reason, "Session lost");
        self.active.remove(&self.id);
        self.status.send_replace(SessionStatus::Lost(reason));
    }
}

/// Owner of a live session. Dropping it stops renewal without revoking;
/// use [`SessionHandle::release`] to end the lease immediately.
pub struct SessionHandle {
    session: Session,
    store: Arc<dyn Store>,
    active: Arc<DashMap<SessionId, Session>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn ttl(&self) -> Duration {
        self.session.ttl
    }

    pub fn is_lost(&self) -> bool {
        matches!(*self.status.borrow(), SessionStatus::Lost(_))
    }

    /// A cloneable signal that resolves when this session is lost.
    pub fn lost_signal(&self) -> LostSignal {
        LostSignal {
            status: Some(self.status.clone()),
        }
    }

    /// Stop renewal and revoke the lease so bound keys disappear now.
    ///
    /// Revoking a lease the backend already dropped is not an error.
    #[instrument(skip(self), fields(session = %self.session.id), level = "debug")]
    pub async fn release(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.active.remove(&self.session.id);

        match self.store.revoke_session(self.session.id).await {
            Ok(()) => {
                debug!("Revoked session");
                Ok(())
            }
            Err(StoreError::SessionLost(reason)) => {
                debug!(reason = %reason, "Session already gone on release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.active.remove(&self.session.id);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session", &self.session)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Resolves when the session it came from is lost.
///
/// A released session is not lost: waiting on its signal never resolves.
#[derive(Debug, Clone)]
pub struct LostSignal {
    status: Option<watch::Receiver<SessionStatus>>,
}

impl LostSignal {
    /// A signal that never fires, for locks without a TTL.
    pub fn never() -> Self {
        Self { status: None }
    }

    pub fn is_lost(&self) -> bool {
        self.reason().is_some()
    }

    /// Why the session was lost, if it was.
    pub fn reason(&self) -> Option<String> {
        let status = self.status.as_ref()?;
        let current = status.borrow();
        match &*current {
            SessionStatus::Lost(reason) => Some(reason.clone()),
            SessionStatus::Active => None,
        }
    }

    /// Wait for the loss and return its reason.
    pub async fn lost(&mut self) -> String {
        if let Some(status) = self.status.as_mut() {
            if let Ok(current) = status
                .wait_for(|s| matches!(s, SessionStatus::Lost(_)))
                .await
            {
                if let SessionStatus::Lost(reason) = &*current {
                    return reason.clone();
                }
            }
        }
        std::future::pending().await
    }
}
