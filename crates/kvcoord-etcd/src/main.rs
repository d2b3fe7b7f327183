mod config;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use kvcoord_core::{
    Acquisition, BackendRegistry, CancellationToken, Coordinator, KvPair, LockOptions,
    WriteOptions,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output stays clean on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let store_config = config.store_config();

    let mut registry = BackendRegistry::new();
    kvcoord_etcd::register(&mut registry);

    let store = registry
        .connect(&config.backend, &config.endpoints, &store_config)
        .with_context(|| format!("connecting to {} at {:?}", config.backend, config.endpoints))?;
    let coordinator = Coordinator::new(store.clone());
    let shutdown = create_shutdown_signal();

    let result = run(&coordinator, config.command, store_config.client_ttl, &shutdown).await;
    store.close().await?;
    result
}

async fn run(
    coordinator: &Coordinator,
    command: Command,
    client_ttl: Duration,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let store = coordinator.store();
    match command {
        Command::Get { key } => match store.get(&key).await? {
            Some(pair) => println!("{}", pair.value_str()),
            None => anyhow::bail!("key not found: {key}"),
        },
        Command::Put { key, value, ttl } => {
            let options = match ttl {
                Some(secs) => WriteOptions::with_ttl(Duration::from_secs(secs)),
                None => WriteOptions::default(),
            };
            let pair = store.put(&key, value.as_bytes(), &options).await?;
            info!(key = %pair.key, index = pair.last_index, "Wrote key");
        }
        Command::Rm { key, recursive } => {
            if recursive {
                store.delete_tree(&key).await?;
            } else if !store.delete(&key).await? {
                anyhow::bail!("key not found: {key}");
            }
        }
        Command::Ls { prefix } => {
            for pair in store.list(&prefix).await? {
                print_pair(&pair);
            }
        }
        Command::Watch { key } => {
            let mut values = coordinator.watch(&key, shutdown).await?;
            while let Some(pair) = values.next().await {
                print_pair(&pair?);
            }
        }
        Command::WatchTree { prefix } => {
            let mut trees = coordinator.watch_tree(&prefix, shutdown).await?;
            while let Some(tree) = trees.next().await {
                let tree = tree?;
                println!("--- {} keys", tree.len());
                for pair in &tree {
                    print_pair(pair);
                }
            }
        }
        Command::Lock {
            key,
            value,
            ttl,
            hold,
        } => {
            let ttl = ttl.map(Duration::from_secs).unwrap_or(client_ttl);
            let mut lock = coordinator.new_lock(&key, LockOptions::new(value).ttl(ttl))?;

            let mut lost = match lock.lock(shutdown).await? {
                Acquisition::Acquired(lost) => lost,
                Acquisition::Cancelled => {
                    warn!(key = %key, "Interrupted before the lock was acquired");
                    return Ok(());
                }
            };
            println!("acquired {key}");

            let held_for = async {
                match hold {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = held_for => {}
                reason = lost.lost() => {
                    anyhow::bail!("lock {key} lost: {reason}");
                }
            }

            lock.unlock().await?;
            println!("released {key}");
        }
    }
    Ok(())
}

fn print_pair(pair: &KvPair) {
    println!("{} = {}", pair.key, pair.value_str());
}

/// A token cancelled on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down");
            } else {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, shutting down");
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        trigger.cancel();
    });

    token
}
