//! CLI argument parsing for the riptide daemon.

use clap::Parser;
use std::time::Duration;

/// riptide - change-data-capture replication for distributed SQL databases
///
/// Runs one capture process. In standalone mode the daemon wires an
/// in-memory metadata store and a synthetic upstream, which is enough to
/// watch a changefeed flow end to end; production deployments embed the
/// riptide crates with real metadata-store and region clients.
#[derive(Parser, Debug)]
#[command(name = "riptided")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address this capture advertises to peers
    #[arg(long, default_value = "127.0.0.1:8300", env = "RIPTIDE_ADDR")]
    pub addr: String,

    /// Metadata-store key prefix
    #[arg(long, default_value = "/riptide", env = "RIPTIDE_META_PREFIX")]
    pub meta_prefix: String,

    /// Capture lease TTL in seconds
    #[arg(long, default_value = "5", env = "RIPTIDE_LEASE_TTL")]
    pub lease_ttl_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Create this changefeed at startup (standalone demo)
    #[arg(long, env = "RIPTIDE_CHANGEFEED")]
    pub create_changefeed: Option<String>,

    /// Sink URI for the created changefeed
    #[arg(long, default_value = "blackhole://", env = "RIPTIDE_SINK_URI")]
    pub sink_uri: String,

    /// Start-ts for the created changefeed (0 = derive from create time)
    #[arg(long, default_value = "0")]
    pub start_ts: u64,

    /// Target-ts for the created changefeed (0 = unbounded)
    #[arg(long, default_value = "0")]
    pub target_ts: u64,

    /// Rows per second produced by the synthetic upstream
    #[arg(long, default_value = "10")]
    pub datagen_rate: u32,
}

impl Cli {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.target_ts != 0 && self.target_ts < self.start_ts {
            return Err(format!(
                "target-ts {} is below start-ts {}",
                self.target_ts, self.start_ts
            ));
        }
        if self.datagen_rate == 0 {
            return Err("datagen-rate must be positive".to_string());
        }
        Ok(())
    }
}
