use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the tickvault binary.
#[derive(Debug, Parser)]
#[command(
    name = "tickvault",
    version,
    about = "Tiered market-data cache toolkit"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TICKVAULT_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: RuntimeOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Validate configuration and print the effective strategy table.
    Check,
    /// Round-trip a probe value through the configured cache tiers.
    Probe(ProbeArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ProbeArgs {
    /// Cache key used for the probe.
    #[arg(long, default_value = "probe")]
    pub key: String,

    /// TTL given to the probe value.
    #[arg(long = "ttl-seconds", default_value_t = 30)]
    pub ttl_seconds: u64,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RuntimeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the warm-tier backend (memory|redis|disabled).
    #[arg(long = "warm-backend", value_name = "BACKEND", global = true)]
    pub warm_backend: Option<String>,

    /// Override the warm-tier connection URL.
    #[arg(long = "warm-url", value_name = "URL", global = true)]
    pub warm_url: Option<String>,

    /// Override the hot-tier capacity.
    #[arg(long = "hot-capacity", value_name = "COUNT", global = true)]
    pub hot_capacity: Option<u64>,

    /// Override the number of concurrent background refreshes.
    #[arg(long = "max-concurrent-updates", value_name = "COUNT", global = true)]
    pub max_concurrent_updates: Option<u64>,
}
