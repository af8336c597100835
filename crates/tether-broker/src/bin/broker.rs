//! Tether Broker
//!
//! Presence, signaling relay, and invite directory for key-identified peers.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: port 3000 (or $PORT), records in ./directory-data
//! tether-broker
//!
//! # Custom port and data directory
//! tether-broker --port 8080 --data-dir /var/lib/tether
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tether_broker::{BrokerServer, SqliteStore};
use tether_core::Config;

#[derive(Parser, Debug)]
#[command(name = "tether-broker")]
#[command(about = "Connection broker: presence, signaling relay, and invite directory")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<std::net::IpAddr>,

    /// Directory holding the directory database
    #[arg(short, long, env = "TETHER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Rate-limit by the X-Forwarded-For client address (behind a proxy)
    #[arg(long)]
    trust_forwarded_for: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit JSON logs
    #[arg(long)]
    json: bool,

    /// Print a sample configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::sample());
        return Ok(());
    }

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    if args.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {:?}", path))?,
        None => Config::load(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(data_dir) = args.data_dir {
        config.directory.data_dir = data_dir;
    }
    if args.trust_forwarded_for {
        config.server.trust_forwarded_for = true;
    }

    info!("Starting tether broker");

    let db_path = config.directory.db_path();
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("opening directory storage at {:?}", db_path))?;

    let server = BrokerServer::new(&config, Arc::new(store));
    server.serve(config.server.socket_addr()).await?;

    Ok(())
}
