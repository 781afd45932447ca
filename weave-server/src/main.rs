//! Weave relay: one process fanning out room traffic between peers.
//!
//! Configuration comes from the environment (`WEAVE_BIND_ADDR`,
//! `WEAVE_MAX_PEERS_PER_ROOM`, `WEAVE_BROADCAST_CAPACITY`,
//! `WEAVE_HEARTBEAT_SECS`); logging from `RUST_LOG`.

use log::{error, info};
use weave_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting weave relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
}
