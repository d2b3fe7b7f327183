use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// A key together with its value and the revision that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    /// Backend revision of the last mutation. Used as the CAS token.
    pub last_index: u64,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, last_index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            last_index,
        }
    }

    /// Value as UTF-8, lossily.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// Backend-assigned lease identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub i64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Options for plain writes.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Backend-side expiry without renewal. `None` or zero means no expiry.
    pub ttl: Option<Duration>,
    /// Bind the key to a live session; the key goes away with the session.
    pub session: Option<SessionId>,
}

impl WriteOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            session: None,
        }
    }

    pub fn with_session(session: SessionId) -> Self {
        Self {
            ttl: None,
            session: Some(session),
        }
    }

    /// The TTL, with zero treated as absent.
    pub fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// Options used when creating a [`crate::Lock`].
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Payload written into the lock key.
    pub value: Vec<u8>,
    /// Lock expiry, renewed while held. `None` or zero means the lock never expires.
    pub ttl: Option<Duration>,
    /// Cancelling this token stops renewal; the lock then lapses after its TTL.
    pub renew_lock: Option<CancellationToken>,
}

impl LockOptions {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn renew_lock(mut self, token: CancellationToken) -> Self {
        self.renew_lock = Some(token);
        self
    }

    pub fn effective_ttl(&self) -> Option<Duration> {
        self.ttl.filter(|ttl| !ttl.is_zero())
    }
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

/// A typed change notification for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub key: String,
    pub kind: EventKind,
    /// New state of the key; `None` for deletions.
    pub pair: Option<KvPair>,
    /// Revision at which the change was committed.
    pub index: u64,
    /// Produced by resynchronisation rather than delivered by the backend.
    #[serde(default)]
    pub synthetic: bool,
}

impl WatchEvent {
    pub fn created(pair: KvPair) -> Self {
        Self {
            key: pair.key.clone(),
            kind: EventKind::Created,
            index: pair.last_index,
            pair: Some(pair),
            synthetic: false,
        }
    }

    pub fn modified(pair: KvPair) -> Self {
        Self {
            kind: EventKind::Modified,
            ..Self::created(pair)
        }
    }

    pub fn deleted(key: impl Into<String>, index: u64) -> Self {
        Self {
            key: key.into(),
            kind: EventKind::Deleted,
            pair: None,
            index,
            synthetic: false,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == EventKind::Deleted
    }
}

/// Item of a raw backend watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Change(WatchEvent),
    /// The backend can no longer replay from the requested revision
    /// (compaction, history truncation, lagging subscriber). The watcher
    /// must re-read state before resuming.
    Invalidated,
}

/// The state of a key or prefix, and the store revision it was read at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub pairs: Vec<KvPair>,
    pub index: u64,
}

/// What a watch observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub fn key(key: &str) -> Self {
        WatchTarget::Key(normalize_key(key))
    }

    pub fn prefix(prefix: &str) -> Self {
        WatchTarget::Prefix(normalize_key(prefix))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            WatchTarget::Key(k) => k == key,
            WatchTarget::Prefix(p) => key_in_prefix(p, key),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            WatchTarget::Key(k) | WatchTarget::Prefix(k) => k,
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Key(k) => write!(f, "key:{k}"),
            WatchTarget::Prefix(p) => write!(f, "prefix:{p}/"),
        }
    }
}

/// Strip leading and trailing slashes.
pub fn normalize_key(key: &str) -> String {
    key.trim_matches('/').to_string()
}

/// Directory semantics: `a/b` is under `a` and under itself, `ab` is not under `a`.
/// The empty prefix contains every key.
pub fn key_in_prefix(prefix: &str, key: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
