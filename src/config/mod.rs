//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroU32, str::FromStr};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{
    CliArgs, Command, DatabaseOverride, RefreshCeilingsArgs, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "sluice";
const ENV_PREFIX: &str = "SLUICE";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10;
const DEFAULT_MAX_RW_TIME_MS: u64 = 1000;
const DEFAULT_CACHE_EXPIRATION_SECS: u64 = 600;
const DEFAULT_EMPTY_EXPIRATION_SECS: u64 = 30;
const DEFAULT_DISTRUST_PROBABILITY: f64 = 0.01;
const DEFAULT_CEILING_REFRESH_INTERVAL_SECS: u64 = 60;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub sync_interval_seconds: u64,
    pub max_rw_time_ms: u64,
    pub cache_expiration_seconds: u64,
    pub empty_expiration_seconds: u64,
    pub distrust_probability: f64,
    pub ceiling_refresh_interval_seconds: u64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::RefreshCeilings(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(seconds) = overrides.cache_sync_interval_seconds {
            self.cache.sync_interval_seconds = Some(seconds);
        }
        if let Some(ms) = overrides.cache_max_rw_time_ms {
            self.cache.max_rw_time_ms = Some(ms);
        }
        if let Some(seconds) = overrides.cache_expiration_seconds {
            self.cache.cache_expiration_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_empty_expiration_seconds {
            self.cache.empty_expiration_seconds = Some(seconds);
        }
        if let Some(probability) = overrides.cache_distrust_probability {
            self.cache.distrust_probability = Some(probability);
        }
        if let Some(seconds) = overrides.cache_ceiling_refresh_interval_seconds {
            self.cache.ceiling_refresh_interval_seconds = Some(seconds);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;

        Ok(Self {
            logging,
            database,
            cache,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_value = database
        .max_connections
        .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = NonZeroU32::new(max_value)
        .ok_or_else(|| LoadError::invalid("database.max_connections", "must be greater than zero"))?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let sync_interval_seconds = positive(
        cache.sync_interval_seconds.unwrap_or(DEFAULT_SYNC_INTERVAL_SECS),
        "cache.sync_interval_seconds",
    )?;
    let max_rw_time_ms = positive(
        cache.max_rw_time_ms.unwrap_or(DEFAULT_MAX_RW_TIME_MS),
        "cache.max_rw_time_ms",
    )?;
    let cache_expiration_seconds = positive(
        cache
            .cache_expiration_seconds
            .unwrap_or(DEFAULT_CACHE_EXPIRATION_SECS),
        "cache.cache_expiration_seconds",
    )?;
    let empty_expiration_seconds = positive(
        cache
            .empty_expiration_seconds
            .unwrap_or(DEFAULT_EMPTY_EXPIRATION_SECS),
        "cache.empty_expiration_seconds",
    )?;
    let ceiling_refresh_interval_seconds = positive(
        cache
            .ceiling_refresh_interval_seconds
            .unwrap_or(DEFAULT_CEILING_REFRESH_INTERVAL_SECS),
        "cache.ceiling_refresh_interval_seconds",
    )?;

    if empty_expiration_seconds >= cache_expiration_seconds {
        return Err(LoadError::invalid(
            "cache.empty_expiration_seconds",
            "must be shorter than cache.cache_expiration_seconds",
        ));
    }

    let distrust_probability = cache
        .distrust_probability
        .unwrap_or(DEFAULT_DISTRUST_PROBABILITY);
    if !distrust_probability.is_finite() || !(0.0..=1.0).contains(&distrust_probability) {
        return Err(LoadError::invalid(
            "cache.distrust_probability",
            "must be a number between 0 and 1",
        ));
    }

    Ok(CacheSettings {
        sync_interval_seconds,
        max_rw_time_ms,
        cache_expiration_seconds,
        empty_expiration_seconds,
        distrust_probability,
        ceiling_refresh_interval_seconds,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    sync_interval_seconds: Option<u64>,
    max_rw_time_ms: Option<u64>,
    cache_expiration_seconds: Option<u64>,
    empty_expiration_seconds: Option<u64>,
    distrust_probability: Option<f64>,
    ceiling_refresh_interval_seconds: Option<u64>,
}

fn positive(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
