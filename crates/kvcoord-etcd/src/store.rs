use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use kvcoord_core::{
    key_in_prefix, normalize_key, BackendEventStream, KvPair, Result, SessionId, Snapshot, Store,
    StoreConfig, StoreError, WatchTarget, WriteOptions,
};
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::{ttl_secs, Call, EtcdClient, Reply, KEY_NOT_FOUND, NODE_EXISTS, TEST_FAILED};
use crate::watch;
use crate::NAME;

/// Keys written under an emulated session, with the `modifiedIndex` of the
/// generation this session wrote or last refreshed.
#[derive(Debug)]
struct Lease {
    ttl: Duration,
    keys: BTreeMap<String, u64>,
}

/// [`Store`] over the etcd v2 keys API.
///
/// v2 has no leases, so sessions are emulated: keys written with a session
/// get the session TTL, and renewing the session refreshes the TTL of each
/// of them with `prevIndex`, so only the generation the session wrote is
/// touched. A bound key that has disappeared or been rewritten means the
/// session is lost.
pub struct EtcdStore {
    client: Arc<EtcdClient>,
    leases: DashMap<SessionId, Lease>,
    next_lease: AtomicI64,
    closed: CancellationToken,
}

impl EtcdStore {
    pub fn new(endpoints: &[String], config: &StoreConfig) -> Result<Self> {
        let client = EtcdClient::new(endpoints, config)?;
        info!(endpoints = ?client.endpoints(), "Created etcd store");
        Ok(Self {
            client: Arc::new(client),
            leases: DashMap::new(),
            next_lease: AtomicI64::new(1),
            closed: CancellationToken::new(),
        })
    }

    async fn send(&self, call: Call<'_>) -> Result<Reply> {
        if self.closed.is_cancelled() {
            return Err(StoreError::BackendUnavailable(
                "etcd store is closed".to_string(),
            ));
        }
        self.client.send(call).await
    }

    /// TTL for a write: the session's when bound to one.
    fn write_ttl(&self, options: &WriteOptions) -> Result<Option<Duration>> {
        match options.session {
            Some(id) => {
                let lease = self
                    .leases
                    .get(&id)
                    .ok_or_else(|| StoreError::SessionLost(format!("session {id} not found")))?;
                Ok(Some(lease.ttl))
            }
            None => Ok(options.effective_ttl()),
        }
    }

    /// Record who owns the generation of `key` just written. A key belongs
    /// to at most one session, and a write without a session detaches it.
    fn bind(&self, options: &WriteOptions, pair: &KvPair) {
        for mut lease in self.leases.iter_mut() {
            if Some(*lease.key()) != options.session {
                lease.keys.remove(&pair.key);
            }
        }
        if let Some(mut lease) = options.session.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.insert(pair.key.clone(), pair.last_index);
        }
    }

    fn unbind(&self, key: &str) {
        for mut lease in self.leases.iter_mut() {
            lease.keys.remove(key);
        }
    }

    /// Lose a session whose key is no longer the generation it wrote.
    fn lose(&self, session: SessionId, key: &str, reason: &str) -> StoreError {
        warn!(session = %session, key = %key, reason, "Session key no longer owned");
        self.leases.remove(&session);
        StoreError::SessionLost(format!("key {key} of session {session} {reason}"))
    }

    fn write_call<'a>(key: &'a str, value: &[u8], ttl: Option<Duration>) -> Call<'a> {
        let call = Call::new(Method::PUT, key).form("value", String::from_utf8_lossy(value));
        match ttl {
            Some(ttl) => call.form("ttl", ttl_secs(ttl)),
            None => call,
        }
    }

    fn written(reply: Reply) -> Result<KvPair> {
        match reply {
            Reply::Ok(resp, _) => resp
                .node
                .map(|n| n.into_pair())
                .ok_or_else(|| StoreError::Protocol("etcd write returned no node".to_string())),
            Reply::Error(e) => Err(e.into()),
            Reply::Empty => Err(StoreError::Protocol("empty etcd response".to_string())),
        }
    }
}

fn checked_key(key: &str) -> Result<String> {
    let key = normalize_key(key);
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    Ok(key)
}

#[async_trait]
impl Store for EtcdStore {
    fn name(&self) -> &str {
        NAME
    }

    #[instrument(skip(self), level = "debug")]
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        let key = normalize_key(key);
        let reply = self
            .send(Call::new(Method::GET, &key).query("quorum", true))
            .await?;
        Ok(reply
            .found()?
            .and_then(|(resp, _)| resp.node)
            .filter(|node| !node.dir)
            .map(|node| node.into_pair()))
    }

    #[instrument(skip(self, value, options), level = "debug", fields(len = value.len()))]
    async fn put(&self, key: &str, value: &[u8], options: &WriteOptions) -> Result<KvPair> {
        let key = checked_key(key)?;
        let ttl = self.write_ttl(options)?;
        let reply = self.send(Self::write_call(&key, value, ttl)).await?;
        let pair = Self::written(reply)?;
        self.bind(options, &pair);
        Ok(pair)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, key: &str) -> Result<bool> {
        let key = normalize_key(key);
        let deleted = self
            .send(Call::new(Method::DELETE, &key))
            .await?
            .found()?
            .is_some();
        if deleted {
            self.unbind(&key);
        }
        Ok(deleted)
    }

    #[instrument(skip(self), level = "debug")]
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let prefix = normalize_key(prefix);
        let reply = self
            .send(
                Call::new(Method::GET, &prefix)
                    .query("recursive", true)
                    .query("sorted", true)
                    .query("quorum", true),
            )
            .await?;
        Ok(reply
            .found()?
            .and_then(|(resp, _)| resp.node)
            .map(|node| node.leaves())
            .unwrap_or_default())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_tree(&self, prefix: &str) -> Result<()> {
        let prefix = normalize_key(prefix);
        if prefix.is_empty() {
            // The root directory itself is read-only.
            for pair in self.list("").await? {
                self.delete(&pair.key).await?;
            }
        } else {
            self.send(Call::new(Method::DELETE, &prefix).query("recursive", true))
                .await?
                .found()?;
        }
        for mut lease in self.leases.iter_mut() {
            lease.keys.retain(|k, _| !key_in_prefix(&prefix, k));
        }
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
        let ttl = self.write_ttl(options)?;
        let call = match previous {
            None => Self::write_call(&key, value, ttl).query("prevExist", false),
            Some(prev) => Self::write_call(&key, value, ttl).query("prevIndex", prev.last_index),
        };

        match self.send(call).await? {
            Reply::Error(e)
                if matches!(e.error_code, KEY_NOT_FOUND | TEST_FAILED | NODE_EXISTS) =>
            {
                debug!(key = %key, code = e.error_code, "Compare-and-swap put rejected");
                Ok(None)
            }
            reply => {
                let pair = Self::written(reply)?;
                self.bind(options, &pair);
                Ok(Some(pair))
            }
        }
    }

    #[instrument(skip(self, previous), level = "debug")]
    async fn atomic_delete(&self, key: &str, previous: &KvPair) -> Result<bool> {
        let key = normalize_key(key);
        let call = Call::new(Method::DELETE, &key).query("prevIndex", previous.last_index);
        match self.send(call).await? {
            Reply::Error(e) if matches!(e.error_code, KEY_NOT_FOUND | TEST_FAILED) => Ok(false),
            reply => {
                reply.found()?;
                self.unbind(&key);
                Ok(true)
            }
        }
    }

    async fn snapshot(&self, target: &WatchTarget) -> Result<Snapshot> {
        let mut call = Call::new(Method::GET, target.path()).query("quorum", true);
        if matches!(target, WatchTarget::Prefix(_)) {
            call = call.query("recursive", true).query("sorted", true);
        }
        match self.send(call).await? {
            Reply::Ok(resp, index) => {
                let pairs = match (target, resp.node) {
                    (WatchTarget::Key(_), Some(node)) if !node.dir => vec![node.into_pair()],
                    (WatchTarget::Prefix(_), Some(node)) => node.leaves(),
                    _ => Vec::new(),
                };
                Ok(Snapshot { pairs, index })
            }
            Reply::Error(e) if e.error_code == KEY_NOT_FOUND => Ok(Snapshot {
                pairs: Vec::new(),
                index: e.index,
            }),
            Reply::Error(e) => Err(e.into()),
            Reply::Empty => Err(StoreError::Protocol("empty etcd response".to_string())),
        }
    }

    async fn watch_raw(
        &self,
        target: WatchTarget,
        after_index: u64,
    ) -> Result<BackendEventStream> {
        let after_index = if after_index == 0 {
            self.snapshot(&target).await?.index
        } else {
            after_index
        };
        Ok(watch::long_poll(
            self.client.clone(),
            target,
            after_index,
            self.closed.child_token(),
        ))
    }

    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl("session ttl must be positive".to_string()));
        }
        let id = SessionId(self.next_lease.fetch_add(1, Ordering::Relaxed));
        self.leases.insert(
            id,
            Lease {
                ttl,
                keys: BTreeMap::new(),
            },
        );
        debug!(session = %id, "Granted emulated session");
        Ok(id)
    }

    #[instrument(skip(self), level = "debug")]
    async fn keep_alive(&self, session: SessionId) -> Result<()> {
        let (ttl, keys) = {
            let lease = self
                .leases
                .get(&session)
                .ok_or_else(|| StoreError::SessionLost(format!("session {session} not found")))?;
            (
                lease.ttl,
                lease
                    .keys
                    .iter()
                    .map(|(k, i)| (k.clone(), *i))
                    .collect::<Vec<_>>(),
            )
        };

        for (key, index) in keys {
            let call = Call::new(Method::PUT, &key)
                .form("ttl", ttl_secs(ttl))
                .form("refresh", true)
                .form("prevIndex", index);
            match self.send(call).await? {
                Reply::Error(e) if e.error_code == KEY_NOT_FOUND => {
                    return Err(self.lose(session, &key, "expired"));
                }
                Reply::Error(e) if e.error_code == TEST_FAILED => {
                    return Err(self.lose(session, &key, "was rewritten by another writer"));
                }
                reply => {
                    let refreshed = Self::written(reply)?;
                    if let Some(mut lease) = self.leases.get_mut(&session) {
                        if let Some(owned) = lease.keys.get_mut(&key) {
                            *owned = refreshed.last_index;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn revoke_session(&self, session: SessionId) -> Result<()> {
        let (_, lease) = self
            .leases
            .remove(&session)
            .ok_or_else(|| StoreError::SessionLost(format!("session {session} not found")))?;
        for (key, index) in &lease.keys {
            let call = Call::new(Method::DELETE, key).query("prevIndex", index);
            match self.send(call).await? {
                Reply::Error(e) if matches!(e.error_code, KEY_NOT_FOUND | TEST_FAILED) => {
                    debug!(session = %session, key = %key, "Session key already gone or reassigned");
                }
                reply => {
                    reply.found()?;
                }
            }
        }
        debug!(session = %session, keys = lease.keys.len(), "Revoked emulated session");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        info!("etcd store closed");
        Ok(())
    }
}
