use std::path::PathBuf;

use clap::Parser;
use outpost_pool::StrategyKind;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Args {
    #[arg(long, env = "OUTPOST_LISTEN_ADDR", default_value = "127.0.0.1:18090")]
    pub listen_addr: String,

    /// JSON array of endpoint definitions.
    #[arg(long, env = "OUTPOST_ENDPOINTS_FILE", default_value = "endpoints.json")]
    pub endpoints_file: PathBuf,

    /// Where registry snapshots are kept between restarts. Disabled when unset.
    #[arg(long, env = "OUTPOST_SNAPSHOT_PATH")]
    pub snapshot_path: Option<PathBuf>,

    /// Data-plane config rewritten on every switch.
    #[arg(long, env = "OUTPOST_TUNNEL_CONFIG", default_value = "xray-config.json")]
    pub tunnel_config_path: PathBuf,

    #[arg(long, env = "OUTPOST_STRATEGY", default_value = "hybrid")]
    pub strategy: StrategyKind,

    #[arg(long, env = "OUTPOST_REBALANCE_INTERVAL_SECS", default_value_t = 300)]
    pub rebalance_interval_secs: u64,

    #[arg(long, env = "OUTPOST_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// OTLP endpoint for exporting traces.
    #[arg(long, env = "OUTPOST_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "OUTPOST_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}
