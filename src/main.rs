//! Command-line interface for etcd-sync
//!
//! # Usage Examples
//!
//! ```bash
//! # Dump the published tables, then stream changes into etcd
//! etcd-sync \
//!   --database-url "host=localhost user=postgres password=postgres dbname=config" \
//!   --etcd-endpoints http://etcd-0:2379,http://etcd-1:2379 \
//!   --registry registry.yaml \
//!   --config sync.yaml
//!
//! # Resume streaming without the initial dump
//! etcd-sync --registry registry.yaml --no-dump
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use etcd_sync::{ResourceRegistry, Service, SyncConfig};
use etcd_sync_postgresql::{Config as PostgresConfig, PgConnectionFactory};
use etcd_sync_store::EtcdStore;
use tracing::info;

#[derive(Parser)]
#[command(name = "etcd-sync")]
#[command(about = "Replicate PostgreSQL changes into etcd via logical replication")]
#[command(long_about = None)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "host=localhost user=postgres password=postgres dbname=postgres"
    )]
    database_url: String,

    /// etcd endpoints (comma-separated)
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://localhost:2379"
    )]
    etcd_endpoints: Vec<String>,

    /// Table-to-resource mapping (YAML)
    #[arg(long, env = "ETCD_SYNC_REGISTRY")]
    registry: PathBuf,

    /// Sync settings (YAML); defaults are used when omitted
    #[arg(long, env = "ETCD_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Skip the initial dump and only stream changes
    #[arg(long)]
    no_dump: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };
    if cli.no_dump {
        config.dump = false;
    }
    let registry = ResourceRegistry::from_file(&cli.registry)?;

    let pg_config =
        PostgresConfig::new(&cli.database_url).context("Invalid PostgreSQL connection string")?;
    let store = EtcdStore::connect(&cli.etcd_endpoints)
        .await
        .context("Failed to connect to etcd")?;

    info!(
        "Starting sync: slot {}, publication {}, root {}",
        config.slot_name, config.publication_name, config.root_path
    );
    let service = Arc::new(Service::new(
        PgConnectionFactory::new(pg_config),
        Arc::new(store),
        registry,
        config,
    )?);

    let shutdown = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt signal (Ctrl+C)");
            shutdown.close();
        }
    });

    let mut dump_done = service.dump_done();
    tokio::spawn(async move {
        if dump_done.wait_for(|done| *done).await.is_ok() {
            info!("Initial state replicated to etcd");
        }
    });

    service.run().await?;
    Ok(())
}
