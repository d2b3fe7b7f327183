use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use kvcoord_core::{
    key_in_prefix, EventKind, KvPair, Result, SessionId, StoreError, WatchEvent, WatchTarget,
};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

/// What live watchers receive.
#[derive(Debug, Clone)]
pub(crate) enum Notice {
    Event(WatchEvent),
    /// Every live watch must resynchronise.
    Invalidate,
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    mod_index: u64,
    lease: Option<SessionId>,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

/// Everything the store knows, guarded by one mutex that is never held
/// across an await point.
#[derive(Debug)]
pub(crate) struct State {
    revision: u64,
    data: BTreeMap<String, Entry>,
    leases: HashMap<SessionId, Lease>,
    next_lease: i64,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// Events at or below this revision can no longer be replayed.
    compacted: u64,
    notices: Option<broadcast::Sender<Notice>>,
    paused: bool,
}

impl State {
    pub(crate) fn new(history_limit: usize, channel_capacity: usize) -> Self {
        let (notices, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            revision: 0,
            data: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 0x1000,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            compacted: 0,
            notices: Some(notices),
            paused: false,
        }
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.notices.is_none() {
            return Err(StoreError::BackendUnavailable(
                "memory store is closed".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        self.notices = None;
    }

    fn pair(key: &str, entry: &Entry) -> KvPair {
        KvPair::new(key, entry.value.clone(), entry.mod_index)
    }

    pub(crate) fn get(&self, key: &str) -> Option<KvPair> {
        self.data.get(key).map(|e| Self::pair(key, e))
    }

    pub(crate) fn list(&self, prefix: &str) -> Vec<KvPair> {
        self.data
            .iter()
            .filter(|(k, _)| key_in_prefix(prefix, k))
            .map(|(k, e)| Self::pair(k, e))
            .collect()
    }

    pub(crate) fn select(&self, target: &WatchTarget) -> Vec<KvPair> {
        match target {
            WatchTarget::Key(key) => self.get(key).into_iter().collect(),
            WatchTarget::Prefix(prefix) => self.list(prefix),
        }
    }

    pub(crate) fn current_index(&self, key: &str) -> Option<u64> {
        self.data.get(key).map(|e| e.mod_index)
    }

    /// Write a key, optionally bound to a lease or given a plain TTL.
    pub(crate) fn put(
        &mut self,
        key: &str,
        value: &[u8],
        lease: Option<SessionId>,
        ttl: Option<Duration>,
        now: Instant,
    ) -> Result<KvPair> {
        if let Some(id) = lease {
            if !self.leases.contains_key(&id) {
                return Err(StoreError::SessionLost(format!("lease {id} not found")));
            }
        }

        let previous_lease = self.data.get(key).and_then(|e| e.lease);
        if previous_lease != lease {
            if let Some(old) = previous_lease.and_then(|id| self.leases.get_mut(&id)) {
                old.keys.remove(key);
            }
        }
        if let Some(new) = lease.and_then(|id| self.leases.get_mut(&id)) {
            new.keys.insert(key.to_string());
        }

        let kind = if self.data.contains_key(key) {
            EventKind::Modified
        } else {
            EventKind::Created
        };
        let index = self.next_revision();
        self.data.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                mod_index: index,
                lease,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );

        let pair = KvPair::new(key, value.to_vec(), index);
        let event = match kind {
            EventKind::Created => WatchEvent::created(pair.clone()),
            _ => WatchEvent::modified(pair.clone()),
        };
        self.record(event);
        Ok(pair)
    }

    /// Remove a key, returning whether it existed.
    pub(crate) fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.data.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        let index = self.next_revision();
        self.record(WatchEvent::deleted(key, index));
        true
    }

    pub(crate) fn grant(&mut self, ttl: Duration, now: Instant) -> SessionId {
        self.next_lease += 1;
        let id = SessionId(self.next_lease);
        self.leases.insert(
            id,
            Lease {
                ttl,
                deadline: now + ttl,
                keys: BTreeSet::new(),
            },
        );
        id
    }

    pub(crate) fn keep_alive(&mut self, id: SessionId, now: Instant) -> Result<()> {
        let lease = self
            .leases
            .get_mut(&id)
            .ok_or_else(|| StoreError::SessionLost(format!("lease {id} not found")))?;
        lease.deadline = now + lease.ttl;
        Ok(())
    }

    /// Drop a lease and every key bound to it.
    pub(crate) fn revoke(&mut self, id: SessionId) -> Result<usize> {
        let lease = self
            .leases
            .remove(&id)
            .ok_or_else(|| StoreError::SessionLost(format!("lease {id} not found")))?;
        let count = lease.keys.len();
        for key in lease.keys {
            self.remove(&key);
        }
        Ok(count)
    }

    /// Expire leases and TTL keys whose deadline has passed.
    pub(crate) fn reap(&mut self, now: Instant) {
        let expired_leases: Vec<SessionId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired_leases {
            if let Ok(count) = self.revoke(id) {
                debug!(lease = %id, keys = count, "Lease expired");
            }
        }

        let expired_keys: Vec<String> = self
            .data
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired_keys {
            trace!(key = %key, "Key ttl expired");
            self.remove(&key);
        }
    }

    /// Start a watch: replayable history after `after_index` and a live
    /// receiver, taken atomically so nothing falls between them.
    ///
    /// Returns `None` for the history when it has been compacted away.
    pub(crate) fn open_watch(
        &self,
        target: &WatchTarget,
        after_index: u64,
    ) -> Result<(Option<Vec<WatchEvent>>, u64, broadcast::Receiver<Notice>)> {
        let notices = self.notices.as_ref().ok_or_else(|| {
            StoreError::BackendUnavailable("memory store is closed".to_string())
        })?;
        let rx = notices.subscribe();

        if after_index == 0 {
            return Ok((Some(Vec::new()), self.revision, rx));
        }
        if after_index < self.compacted {
            return Ok((None, after_index, rx));
        }
        let replay = self
            .history
            .iter()
            .filter(|e| e.index > after_index && target.matches(&e.key))
            .cloned()
            .collect();
        Ok((Some(replay), after_index, rx))
    }

    pub(crate) fn compact(&mut self, revision: u64) {
        let revision = revision.min(self.revision);
        while self.history.front().is_some_and(|e| e.index <= revision) {
            self.history.pop_front();
        }
        self.compacted = self.compacted.max(revision);
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub(crate) fn invalidate_watches(&self) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(Notice::Invalidate);
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn record(&mut self, event: WatchEvent) {
        self.history.push_back(event.clone());
        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = self.compacted.max(dropped.index);
            }
        }
        if self.paused {
            return;
        }
        if let Some(notices) = &self.notices {
            // No receivers is fine.
            let _ = notices.send(Notice::Event(event));
        }
    }
}
