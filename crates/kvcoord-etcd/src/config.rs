use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kvcoord_core::{StoreConfig, TlsConfig};

/// Command-line configuration for kvctl.
#[derive(Parser, Debug, Clone)]
#[command(name = "kvctl")]
#[command(about = "Inspect keys, watch changes and hold locks on an etcd cluster")]
pub struct Config {
    /// Backend to connect to
    #[arg(long, default_value = "etcd", env = "KVCOORD_BACKEND")]
    pub backend: String,

    /// Comma-separated endpoints
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379",
        env = "KVCOORD_ENDPOINTS"
    )]
    pub endpoints: Vec<String>,

    /// Connection timeout (seconds)
    #[arg(long, default_value = "10", env = "KVCOORD_CONNECTION_TIMEOUT")]
    pub connection_timeout_secs: u64,

    /// Default TTL for locks (seconds)
    #[arg(long, default_value = "10", env = "KVCOORD_CLIENT_TTL")]
    pub client_ttl_secs: u64,

    #[arg(long, env = "KVCOORD_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "KVCOORD_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// CA certificate (PEM) used to verify the cluster
    #[arg(long, env = "KVCOORD_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// Client certificate (PEM)
    #[arg(long, env = "KVCOORD_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long, env = "KVCOORD_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the value of a key
    Get { key: String },

    /// Write a key
    Put {
        key: String,
        value: String,
        /// Expire the key after this many seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Delete a key, or a whole subtree with --recursive
    Rm {
        key: String,
        #[arg(long, short)]
        recursive: bool,
    },

    /// List the keys under a prefix
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },

    /// Print every new value of a key
    Watch { key: String },

    /// Print the subtree under a prefix after every change
    WatchTree { prefix: String },

    /// Acquire a lock and hold it until interrupted
    Lock {
        key: String,
        /// Value written into the lock key
        #[arg(long, default_value = "")]
        value: String,
        /// Lock TTL (seconds), renewed while held. Defaults to --client-ttl-secs
        #[arg(long)]
        ttl: Option<u64>,
        /// Release after this many seconds instead of waiting for Ctrl+C
        #[arg(long)]
        hold: Option<u64>,
    },
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        let tls = if self.ca_file.is_some() || self.cert_file.is_some() || self.key_file.is_some() {
            Some(TlsConfig {
                ca_file: self.ca_file.clone(),
                cert_file: self.cert_file.clone(),
                key_file: self.key_file.clone(),
            })
        } else {
            None
        };

        StoreConfig {
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            client_ttl: Duration::from_secs(self.client_ttl_secs),
            username: self.username.clone(),
            password: self.password.clone(),
            tls,
            ..StoreConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lock_command() {
        let config = Config::try_parse_from([
            "kvctl",
            "--endpoints",
            "a:2379,b:2379",
            "--username",
            "test",
            "--password",
            "very-secure",
            "lock",
            "testLockUnlock",
            "--value",
            "bar",
            "--ttl",
            "2",
        ])
        .unwrap();

        assert_eq!(config.endpoints, vec!["a:2379", "b:2379"]);
        match &config.command {
            Command::Lock { key, value, ttl, hold } => {
                assert_eq!(key, "testLockUnlock");
                assert_eq!(value, "bar");
                assert_eq!(*ttl, Some(2));
                assert!(hold.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }

        let store = config.store_config();
        assert_eq!(store.credentials(), Some(("test", "very-secure")));
        assert!(store.tls.is_none());
        assert_eq!(store.client_ttl, Duration::from_secs(10));
    }

    #[test]
    fn test_tls_flags_build_tls_config() {
        let config =
            Config::try_parse_from(["kvctl", "--ca-file", "/etc/ca.pem", "ls", "svc"]).unwrap();
        let tls = config.store_config().tls.unwrap();
        assert_eq!(tls.ca_file, Some(PathBuf::from("/etc/ca.pem")));
        assert!(tls.cert_file.is_none());
    }
}
