//! filestorage daemon
//!
//! Serves a store over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! filestorage
//!
//! # Start with custom config
//! filestorage --config /path/to/filestorage.toml
//!
//! # Custom port and storage directory
//! filestorage --http-port 8096 --storage-dir /data/files
//! ```

use anyhow::Context;
use clap::Parser;
use filestorage::{spawn_logging_listener, Config, HttpServer, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "filestorage")]
#[command(about = "Sharded local blob storage with an HTTP API")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "FILESTORAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "FILESTORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, env = "FILESTORAGE_HTTP_PORT")]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("filestorage=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        "Starting filestorage"
    );

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("creating {}", config.storage_dir.display()))?;

    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let store = Arc::new(Store::with_config(&config).await?);
    let listener = spawn_logging_listener(store.events().clone());

    let http_addr: SocketAddr = config
        .http_addr()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.http_addr()))?;
    let http_server = Arc::new(HttpServer::new(store.clone(), http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Endpoints:");
    info!("  GET    /health          - Catalog counters");
    info!("  GET    /listing         - All journal lines");
    info!("  GET    /{{id}}            - Serve a record");
    info!("  POST   /{{name}}          - Insert a record");
    info!("  PUT    /{{id}}/{{name}}     - Replace a record");
    info!("  DELETE /{{id}}            - Remove a record");
    info!("Press Ctrl+C to stop.");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    listener.abort();

    let catalog = store.catalog();
    info!(last_id = catalog.last_id, count = catalog.count, "Final catalog");

    Ok(())
}
