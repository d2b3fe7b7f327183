//! Backend-agnostic key-value coordination.
//!
//! This crate defines the capability interface every backend implements and
//! the coordination layer written once on top of it:
//! - `Store`: get/put/delete/list, compare-and-swap, raw watches, sessions
//! - `SessionManager`: TTL leases renewed in the background
//! - `WatchMultiplexer`: ordered, cancellable, resynchronising watch streams
//! - `Lock`: distributed mutual exclusion
//! - `BackendRegistry`: explicit name → constructor table
//! - `Coordinator`: the caller-facing facade

mod client;
mod config;
mod error;
mod lock;
mod registry;
mod session;
mod store;
mod types;
mod watch;

pub use client::{Coordinator, EphemeralKey, PairStream, TreeStream};
pub use config::{
    StoreConfig, TlsConfig, DEFAULT_CLIENT_TTL, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_HISTORY_LIMIT,
};
pub use error::{Result, StoreError};
pub use lock::{Acquisition, Lock, LockLost, LockState};
pub use registry::{BackendRegistry, Constructor};
pub use session::{
    renewal_period, LostSignal, Session, SessionConfig, SessionHandle, SessionManager,
    DEFAULT_MAX_RENEWAL_FAILURES,
};
pub use store::{BackendEventStream, Store};
pub use types::{
    key_in_prefix, normalize_key, BackendEvent, EventKind, KvPair, LockOptions, SessionId,
    Snapshot, WatchEvent, WatchTarget, WriteOptions,
};
pub use watch::{Subscription, WatchMultiplexer, WatchStream, DEFAULT_SUBSCRIBER_BUFFER};

pub use tokio_util::sync::CancellationToken;
