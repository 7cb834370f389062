//! Retouch relay server binary.
//!
//! Hosts the WebSocket action relay. Logging goes through `env_logger`;
//! set `RUST_LOG=debug` (or `--verbose`) for per-connection detail.

use std::time::Duration;

use clap::Parser;
use log::info;
use retouch_relay::{RegistryConfig, RelayServer, ServerConfig};

/// Server command line arguments. Every flag can also come from the
/// environment.
#[derive(Parser, Debug)]
#[command(name = "retouch-server")]
#[command(about = "Ordered action relay for shared retouching sessions")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "RETOUCH_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// Seconds between WebSocket pings
    #[arg(long, env = "RETOUCH_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Outbound queue length per participant before it is marked stale
    #[arg(long, env = "RETOUCH_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Retained actions per session once every member has acked them
    #[arg(long, env = "RETOUCH_LOG_CAPACITY", default_value_t = 10_000)]
    log_capacity: usize,

    /// Seconds an empty session lives before eviction
    #[arg(long, env = "RETOUCH_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Seconds a disconnected participant keeps its place
    #[arg(long, env = "RETOUCH_PARTICIPANT_TIMEOUT_SECS", default_value_t = 120)]
    participant_timeout_secs: u64,

    #[arg(long, env = "RETOUCH_MAX_SESSIONS", default_value_t = 10_000)]
    max_sessions: usize,

    #[arg(long, env = "RETOUCH_MAX_PARTICIPANTS", default_value_t = 100)]
    max_participants: usize,

    /// Verbose logging (overrides RUST_LOG)
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            heartbeat_interval_secs: self.heartbeat_secs,
            outbound_capacity: self.outbound_capacity,
            registry: RegistryConfig {
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
                participant_timeout: Duration::from_secs(self.participant_timeout_secs),
                log_capacity: self.log_capacity,
                max_sessions: self.max_sessions,
                max_participants_per_session: self.max_participants,
            },
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if args.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let config = args.server_config();
    info!(
        "Starting retouch-server (log capacity {}, outbound capacity {})",
        config.registry.log_capacity, config.outbound_capacity
    );

    RelayServer::new(config).run().await
}
