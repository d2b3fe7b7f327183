//! etcd v2 HTTP client with endpoint failover.
//!
//! Every request goes to `/v2/keys/{key}` on the current endpoint. A
//! transport failure moves on to the next endpoint; the first one that
//! answers becomes current. API errors (`errorCode` bodies) are returned to
//! the caller as values so each operation can decide what they mean.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kvcoord_core::{KvPair, StoreConfig, StoreError};
use reqwest::{Certificate, Client, Identity, Method};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

pub(crate) const KEY_NOT_FOUND: u32 = 100;
pub(crate) const TEST_FAILED: u32 = 101;
pub(crate) const NODE_EXISTS: u32 = 105;
pub(crate) const EVENT_INDEX_CLEARED: u32 = 401;

const INDEX_HEADER: &str = "X-Etcd-Index";

/// A node in a v2 response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Node {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub modified_index: u64,
}

impl Node {
    pub fn into_pair(self) -> KvPair {
        KvPair::new(
            kvcoord_core::normalize_key(&self.key),
            self.value.unwrap_or_default().into_bytes(),
            self.modified_index,
        )
    }

    /// Every non-directory node at or below this one, sorted by key.
    pub fn leaves(self) -> Vec<KvPair> {
        let mut pairs = Vec::new();
        collect_leaves(self, &mut pairs);
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        pairs
    }
}

fn collect_leaves(node: Node, into: &mut Vec<KvPair>) {
    if node.dir {
        for child in node.nodes {
            collect_leaves(child, into);
        }
    } else {
        into.push(node.into_pair());
    }
}

/// Successful v2 response body.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Response {
    pub action: String,
    #[serde(default)]
    pub node: Option<Node>,
    #[serde(default, rename = "prevNode")]
    pub prev_node: Option<Node>,
}

/// v2 error body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ApiError {
    pub error_code: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub index: u64,
}

impl From<ApiError> for StoreError {
    fn from(e: ApiError) -> Self {
        StoreError::Protocol(format!(
            "etcd error {}: {} ({})",
            e.error_code, e.message, e.cause
        ))
    }
}

/// What a request came back with.
#[derive(Debug)]
pub(crate) enum Reply {
    /// Response body and the cluster index from `X-Etcd-Index`.
    Ok(Response, u64),
    Error(ApiError),
    /// A long poll that returned without an event.
    Empty,
}

impl Reply {
    /// The response, treating key-not-found as `None` and any other API
    /// error as a protocol failure.
    pub fn found(self) -> kvcoord_core::Result<Option<(Response, u64)>> {
        match self {
            Reply::Ok(resp, index) => Ok(Some((resp, index))),
            Reply::Error(e) if e.error_code == KEY_NOT_FOUND => Ok(None),
            Reply::Error(e) => Err(e.into()),
            Reply::Empty => Err(StoreError::Protocol("empty etcd response".to_string())),
        }
    }
}

/// One request: method, key, query and optional form body.
#[derive(Debug, Clone)]
pub(crate) struct Call<'a> {
    pub method: Method,
    pub key: &'a str,
    pub query: Vec<(&'static str, String)>,
    pub form: Option<Vec<(&'static str, String)>>,
    /// Long-poll: no overall request timeout.
    pub wait: bool,
}

impl<'a> Call<'a> {
    pub fn new(method: Method, key: &'a str) -> Self {
        Self {
            method,
            key,
            query: Vec::new(),
            form: None,
            wait: false,
        }
    }

    pub fn query(mut self, name: &'static str, value: impl ToString) -> Self {
        self.query.push((name, value.to_string()));
        self
    }

    pub fn form(mut self, name: &'static str, value: impl ToString) -> Self {
        self.form
            .get_or_insert_with(Vec::new)
            .push((name, value.to_string()));
        self
    }

    pub fn wait(mut self) -> Self {
        self.wait = true;
        self
    }
}

pub(crate) struct EtcdClient {
    http: Client,
    /// Same settings without the request timeout, for long polls.
    watch_http: Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
    credentials: Option<(String, String)>,
}

impl EtcdClient {
    pub fn new(endpoints: &[String], config: &StoreConfig) -> kvcoord_core::Result<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Config(
                "at least one etcd endpoint is required".to_string(),
            ));
        }
        let secure = config.tls.is_some();
        let endpoints = endpoints
            .iter()
            .map(|e| normalize_endpoint(e, secure))
            .collect();

        let http = builder(config)?
            .timeout(config.connection_timeout)
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {e}")))?;
        let watch_http = builder(config)?
            .build()
            .map_err(|e| StoreError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            watch_http,
            endpoints,
            current: AtomicUsize::new(0),
            credentials: config
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Send a request, failing over across endpoints on transport errors.
    #[instrument(skip(self, call), level = "trace", fields(method = %call.method, key = call.key))]
    pub async fn send(&self, call: Call<'_>) -> kvcoord_core::Result<Reply> {
        let count = self.endpoints.len();
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = String::new();

        for attempt in 0..count {
            let idx = (start + attempt) % count;
            let url = format!("{}{}", self.endpoints[idx], keys_path(call.key));
            let http = if call.wait { &self.watch_http } else { &self.http };

            let mut request = http.request(call.method.clone(), &url).query(&call.query);
            if let Some(form) = &call.form {
                request = request.form(form);
            }
            if let Some((username, password)) = &self.credentials {
                request = request.basic_auth(username, Some(password));
            }

            match request.send().await {
                Ok(resp) => {
                    if idx != start {
                        debug!(endpoint = %self.endpoints[idx], "Switched etcd endpoint");
                        self.current.store(idx, Ordering::Relaxed);
                    }
                    return decode(resp).await;
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoints[idx], error = %e, "etcd endpoint unreachable");
                    last_error = e.to_string();
                }
            }
        }

        Err(StoreError::BackendUnavailable(format!(
            "no etcd endpoint reachable among {count}: {last_error}"
        )))
    }
}

fn builder(config: &StoreConfig) -> kvcoord_core::Result<reqwest::ClientBuilder> {
    let mut builder = Client::builder().connect_timeout(config.connection_timeout);

    if let Some(tls) = &config.tls {
        if let Some(ca) = &tls.ca_file {
            let pem = fs::read(ca)
                .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", ca.display())))?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| StoreError::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&tls.cert_file, &tls.key_file) {
            let mut pem = fs::read(cert)
                .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", cert.display())))?;
            let key_pem = fs::read(key)
                .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", key.display())))?;
            pem.push(b'\n');
            pem.extend_from_slice(&key_pem);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| StoreError::Config(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }
    }
    Ok(builder)
}

async fn decode(resp: reqwest::Response) -> kvcoord_core::Result<Reply> {
    let index = resp
        .headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let status = resp.status();
    let body = resp
        .bytes()
        .await
        .map_err(|e| StoreError::BackendUnavailable(format!("reading etcd response: {e}")))?;

    if status.is_success() {
        if body.is_empty() {
            return Ok(Reply::Empty);
        }
        return Ok(Reply::Ok(serde_json::from_slice(&body)?, index));
    }

    match serde_json::from_slice::<ApiError>(&body) {
        Ok(e) => Ok(Reply::Error(e)),
        Err(_) if status == reqwest::StatusCode::UNAUTHORIZED => Err(StoreError::Config(
            "etcd rejected the credentials".to_string(),
        )),
        Err(_) => Err(StoreError::Protocol(format!(
            "unexpected etcd response {status}: {}",
            String::from_utf8_lossy(&body)
        ))),
    }
}

fn normalize_endpoint(endpoint: &str, secure: bool) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if secure {
        format!("https://{endpoint}")
    } else {
        format!("http://{endpoint}")
    }
}

/// `/v2/keys/` followed by the percent-encoded path segments of `key`.
fn keys_path(key: &str) -> String {
    let encoded: Vec<String> = key
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();
    format!("/v2/keys/{}", encoded.join("/"))
}

/// TTL in whole seconds, rounded up, at least one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    let millis = ttl.as_millis() as u64;
    millis.div_ceil(1000).max(1)
}
