//! Playpen relay: routes collaboration traffic between editors.
//!
//! ```text
//! RUST_LOG=info playpen-relay --bind 0.0.0.0:9090
//! ```

use clap::Parser;
use log::info;
use playpen_collab::server::{ServerConfig, SyncServer};

#[derive(Debug, Parser)]
#[command(name = "playpen-relay", version, about = "Playpen collaboration relay")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "PLAYPEN_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Peers admitted per document channel.
    #[arg(long, env = "PLAYPEN_MAX_PEERS", default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per peer before it starts lagging.
    #[arg(long, env = "PLAYPEN_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            bind_addr: args.bind,
            max_peers_per_room: args.max_peers.max(1),
            broadcast_capacity: args.broadcast_capacity.max(1),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from(Args::parse());
    info!(
        "Starting relay on {} (max {} peers per channel)",
        config.bind_addr, config.max_peers_per_room
    );

    SyncServer::new(config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let config = ServerConfig::from(Args::parse_from(["playpen-relay"]));
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.max_peers_per_room, defaults.max_peers_per_room);
        assert_eq!(config.broadcast_capacity, defaults.broadcast_capacity);
    }

    #[test]
    fn test_flags_override() {
        let args = Args::parse_from([
            "playpen-relay",
            "--bind",
            "0.0.0.0:7000",
            "--max-peers",
            "0",
            "--broadcast-capacity",
            "32",
        ]);
        let config = ServerConfig::from(args);
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_room, 1);
        assert_eq!(config.broadcast_capacity, 32);
    }
}
