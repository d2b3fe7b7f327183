use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Default time allowed to establish a backend connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Default length of client sessions.
pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(10);
/// Default number of events the memory backend retains for watch replay.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// TLS material for backends reached over HTTPS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle of trusted CA certificates.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// PEM client private key.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Connection settings shared by all backends. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(with = "duration_millis")]
    pub connection_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsConfig>,
    /// Default session length for sessions the client opens on its own.
    #[serde(with = "duration_millis")]
    pub client_ttl: Duration,
    /// Watch history kept by in-process backends.
    pub history_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            username: None,
            password: None,
            tls: None,
            client_ttl: DEFAULT_CLIENT_TTL,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl StoreConfig {
    /// Username and password, if both are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout.is_zero() {
            return Err(StoreError::Config(
                "connection_timeout must be greater than zero".to_string(),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(StoreError::Config(
                "username and password must be set together".to_string(),
            ));
        }
        if let Some(tls) = &self.tls {
            if tls.cert_file.is_some() != tls.key_file.is_some() {
                return Err(StoreError::Config(
                    "tls cert_file and key_file must be set together".to_string(),
                ));
            }
        }
        Ok(())
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
