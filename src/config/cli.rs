use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the Sluice binary.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Sluice cache-consistency engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SLUICE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the engine with its sync scheduler until interrupted.
    Serve(Box<ServeArgs>),
    /// Reload every ID ceiling from the durable store once.
    #[command(name = "refresh-ceilings")]
    RefreshCeilings(RefreshCeilingsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RefreshCeilingsArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the write-back flush period.
    #[arg(long = "cache-sync-interval-seconds", value_name = "SECONDS")]
    pub cache_sync_interval_seconds: Option<u64>,

    /// Override the bound on a single durable write.
    #[arg(long = "cache-max-rw-time-ms", value_name = "MS")]
    pub cache_max_rw_time_ms: Option<u64>,

    /// Override the positive cache TTL baseline.
    #[arg(long = "cache-expiration-seconds", value_name = "SECONDS")]
    pub cache_expiration_seconds: Option<u64>,

    /// Override the negative-cache placeholder TTL.
    #[arg(long = "cache-empty-expiration-seconds", value_name = "SECONDS")]
    pub cache_empty_expiration_seconds: Option<u64>,

    /// Override the relation read bypass probability.
    #[arg(long = "cache-distrust-probability", value_name = "P")]
    pub cache_distrust_probability: Option<f64>,

    /// Override the ID ceiling refresh period.
    #[arg(long = "cache-ceiling-refresh-interval-seconds", value_name = "SECONDS")]
    pub cache_ceiling_refresh_interval_seconds: Option<u64>,
}
