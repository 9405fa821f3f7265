//! Standalone sequencing server for shared Logos canvases.

use clap::Parser;
use log::info;

use logos_collab::{SequencerConfig, ServerConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "logos-sync-server")]
#[command(version, about = "Central sequencer for collaborative Logos canvases", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Commits a late operation may be rebased over before the client must resync
    #[arg(long, default_value_t = 1024)]
    rebase_window: u64,

    /// Committed records retained per document
    #[arg(long, default_value_t = 4096)]
    log_retention: usize,

    /// Messages buffered per peer before it lags
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Maximum peers per document
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Heartbeat interval in seconds
    #[arg(long, default_value_t = 30)]
    heartbeat: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        bind_addr: args.bind,
        max_peers_per_room: args.max_peers,
        broadcast_capacity: args.broadcast_capacity,
        heartbeat_interval_secs: args.heartbeat,
        sequencer: SequencerConfig {
            rebase_window: args.rebase_window,
            log_retention: args.log_retention,
        },
    };
    info!("Starting Logos sync server on {}", config.bind_addr);

    SyncServer::new(config).run().await
}
