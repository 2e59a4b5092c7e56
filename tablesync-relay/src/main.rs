//! tablesync relay: routes channel frames between the peers of each room.
//!
//! Configured through `TABLESYNC_RELAY_ADDR` and `TABLESYNC_MAX_PEERS`;
//! logging through `RUST_LOG`.

use log::{error, info};
use tablesync_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!(
        "Starting tablesync relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "Shutting down after {} connections ({} frames routed)",
                stats.total_connections, stats.frames_routed
            );
        }
    }
}
