//! Long-poll watches over `?wait=true&waitIndex=N`.
//!
//! Each poll asks for the first change after the last index seen. etcd only
//! keeps the last 1000 events; asking for an older index yields error 401,
//! which is reported as `Invalidated` so the caller can resynchronise.

use std::sync::Arc;

use kvcoord_core::{
    normalize_key, BackendEvent, BackendEventStream, KvPair, StoreError, WatchEvent, WatchTarget,
};
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::{Call, EtcdClient, Reply, Response, EVENT_INDEX_CLEARED};

pub(crate) fn long_poll(
    client: Arc<EtcdClient>,
    target: WatchTarget,
    after_index: u64,
    cancel: CancellationToken,
) -> BackendEventStream {
    Box::pin(async_stream::stream! {
        let mut last = after_index;
        loop {
            let mut call = Call::new(Method::GET, target.path())
                .query("wait", true)
                .query("waitIndex", last + 1)
                .wait();
            if matches!(target, WatchTarget::Prefix(_)) {
                call = call.query("recursive", true);
            }

            let reply = tokio::select! {
                _ = cancel.cancelled() => break,
                reply = client.send(call) => reply,
            };

            match reply {
                Ok(Reply::Ok(resp, _)) => {
                    if let Some(node) = &resp.node {
                        last = last.max(node.modified_index);
                    }
                    let Some(event) = to_event(resp) else {
                        continue;
                    };
                    if target.matches(&event.key) {
                        yield Ok(BackendEvent::Change(event));
                    } else {
                        trace!(watch = %target, key = %event.key, "Ignoring event outside target");
                    }
                }
                Ok(Reply::Empty) => continue,
                Ok(Reply::Error(e)) if e.error_code == EVENT_INDEX_CLEARED => {
                    debug!(watch = %target, wait_index = last + 1, "etcd event index cleared");
                    yield Ok(BackendEvent::Invalidated);
                    break;
                }
                Ok(Reply::Error(e)) => {
                    yield Err(StoreError::from(e));
                    break;
                }
                Err(e) => {
                    warn!(watch = %target, error = %e, "etcd watch failed");
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

/// Map a v2 watch response to an event. Directory events carry nothing
/// a key watcher needs.
fn to_event(resp: Response) -> Option<WatchEvent> {
    let node = resp.node?;
    if node.dir {
        return None;
    }
    match resp.action.as_str() {
        "delete" | "expire" | "compareAndDelete" => Some(WatchEvent::deleted(
            normalize_key(&node.key),
            node.modified_index,
        )),
        action => {
            let pair: KvPair = node.into_pair();
            if action == "create" || resp.prev_node.is_none() {
                Some(WatchEvent::created(pair))
            } else {
                Some(WatchEvent::modified(pair))
            }
        }
    }
}
