//! Flash-sale engine runtime.
//!
//! Wires configuration, stores, and the broker, spawns the background
//! workers, and drains them on shutdown. Transport adapters (HTTP/gRPC) run
//! in front of the library API; this binary hosts the engine itself.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use flashsale_engine::config::EngineConfig;
use flashsale_engine::db::SaleDb;
use flashsale_engine::engine::Engine;
use flashsale_engine::keystore::{Keystore, MemoryKeystore, RedisKeystore};
use flashsale_engine::outbox::{ChannelBroker, EventBroker, HttpBroker};

#[derive(Parser, Debug)]
#[command(name = "flashsale", about = "Flash-sale execution engine")]
struct Args {
    /// Keystore URL override (redis://...).
    #[arg(long, env = "KEYSTORE_URL")]
    keystore_url: Option<String>,

    /// Database path override.
    #[arg(long, env = "DB_PATH")]
    db_path: Option<String>,

    /// Broker URL override.
    #[arg(long, env = "BROKER_URL")]
    broker_url: Option<String>,

    /// Run against an in-process keystore instead of Redis (local testing).
    #[arg(long)]
    memory_keystore: bool,

    /// Log published events instead of POSTing them to the broker.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = EngineConfig::from_env();
    if let Some(url) = args.keystore_url {
        config.keystore_url = url;
    }
    if let Some(path) = args.db_path {
        config.db_path = path;
    }
    if let Some(url) = args.broker_url {
        config.broker_url = url;
    }

    let db = SaleDb::open(&config.db_path).context("open database")?;

    let keystore: Arc<dyn Keystore> = if args.memory_keystore {
        warn!("using in-process keystore; state will not survive restart");
        Arc::new(MemoryKeystore::new())
    } else {
        Arc::new(
            RedisKeystore::connect(&config.keystore_url)
                .await
                .context("connect keystore")?,
        )
    };

    let broker: Arc<dyn EventBroker> = if args.dry_run {
        let (broker, mut rx) = ChannelBroker::new();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                info!(
                    topic = %event.topic,
                    routing_key = %event.routing_key,
                    payload = %event.payload,
                    "event (dry run)"
                );
            }
        });
        Arc::new(broker)
    } else {
        Arc::new(HttpBroker::new(&config.broker_url))
    };

    let shutdown_grace = config.admission.shutdown_grace;
    let engine = Engine::build(config, keystore, db, broker);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = engine.spawn_workers(shutdown_rx);
    info!("engine started");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown requested, draining workers");
    shutdown_tx.send(true).ok();

    let drain = async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
    };
    if tokio::time::timeout(shutdown_grace, drain).await.is_err() {
        warn!(
            grace_secs = shutdown_grace.as_secs(),
            "drain exceeded grace period, exiting anyway"
        );
    }
    info!("engine stopped");
    Ok(())
}
