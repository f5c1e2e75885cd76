//! Tandem sync server binary.
//!
//! Serves shared plain-text documents over WebSocket. Every flag can also be
//! set through the environment, e.g. `TANDEM_BIND=0.0.0.0:9090`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;
use tandem_collab::{ServerConfig, SessionConfig, SyncServer};

/// Server command line arguments.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "Real-time collaborative text editing server")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "TANDEM_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory (documents are kept in memory if omitted)
    #[arg(short, long, env = "TANDEM_DATA_DIR", value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Seconds without activity before a user is evicted
    #[arg(long, env = "TANDEM_PRESENCE_TIMEOUT", default_value_t = 60)]
    presence_timeout: u64,

    /// Seconds an empty document stays open
    #[arg(long, env = "TANDEM_IDLE_CLOSE", default_value_t = 30)]
    idle_close: u64,

    /// Events a slow connection may fall behind before it must resync
    #[arg(long, env = "TANDEM_BROADCAST_CAPACITY", default_value_t = 1024)]
    broadcast_capacity: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        let presence_timeout = Duration::from_secs(self.presence_timeout.max(1));
        ServerConfig {
            bind_addr: self.bind.clone(),
            storage_path: self.data_dir.clone(),
            session: SessionConfig {
                presence_timeout,
                // Sweep often enough that eviction lags the timeout by at most a twelfth.
                sweep_interval: (presence_timeout / 12).max(Duration::from_secs(1)),
                idle_close_after: Duration::from_secs(self.idle_close),
                broadcast_capacity: self.broadcast_capacity.max(16),
                ..SessionConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if args.verbose { "debug" } else { "info" }),
    )
    .init();

    info!("Starting tandem-server");
    let server = SyncServer::new(args.server_config())?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }

    server.shutdown().await;
    info!("All documents flushed");
    Ok(())
}
