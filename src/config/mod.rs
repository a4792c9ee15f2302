//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{
    DEFAULT_MAX_REGISTRY_VALUE_SIZE, DEFAULT_MEMORY_CAPACITY, DEFAULT_METADATA_TTL_SECS,
    DEFAULT_TIMEOUT_SECS, PathSentinel,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "depcache";
const ENV_PREFIX: &str = "DEPCACHE";

/// Command-line arguments for the depcache binary.
#[derive(Debug, Parser)]
#[command(name = "depcache", version, about = "Dependency-tracking cache tools")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "DEPCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Print the cache entry key for an invocation context.
    Fingerprint(FingerprintArgs),
    /// Print the resolved settings.
    Settings,
}

#[derive(Debug, Args, Clone)]
pub struct FingerprintArgs {
    /// Owner of the computation (e.g. the view or handler type).
    #[arg(long, value_name = "NAME")]
    pub owner: String,

    /// Function name of the computation.
    #[arg(long, value_name = "NAME")]
    pub function: String,

    /// Request path, including the query string.
    #[arg(long, value_name = "PATH", default_value = "/")]
    pub path: String,

    /// Tenant identifier for multi-tenant hosts.
    #[arg(long, value_name = "ID")]
    pub tenant: Option<String>,

    /// Positional discriminator; repeatable.
    #[arg(long = "arg", value_name = "VALUE")]
    pub args: Vec<String>,

    /// Keyword discriminator as `name=value`; repeatable.
    #[arg(long = "kwarg", value_name = "NAME=VALUE", value_parser = parse_kwarg)]
    pub kwargs: Vec<(String, String)>,

    /// Extra literal component; repeatable.
    #[arg(long = "extra", value_name = "VALUE")]
    pub extras: Vec<String>,

    /// Path stand-in that replaces the implicit path component.
    #[arg(long, value_enum, value_name = "SENTINEL")]
    pub sentinel: Option<SentinelArg>,

    /// Print the ordered components before the key.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SentinelArg {
    FullPath,
    Path,
    PathInfo,
}

impl From<SentinelArg> for PathSentinel {
    fn from(value: SentinelArg) -> Self {
        match value {
            SentinelArg::FullPath => PathSentinel::FullPath,
            SentinelArg::Path => PathSentinel::Path,
            SentinelArg::PathInfo => PathSentinel::PathInfo,
        }
    }
}

fn parse_kwarg(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected `name=value`, got `{raw}`"))
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
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

    /// Override the maximum encoded size of one index list.
    #[arg(long = "cache-max-registry-value-size", value_name = "BYTES", global = true)]
    pub cache_max_registry_value_size: Option<u64>,

    /// Toggle index maintenance and change notifications.
    #[arg(
        long = "cache-invalidate",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub cache_invalidate: Option<bool>,

    /// Override the backend name.
    #[arg(long = "cache-backend", value_name = "NAME", global = true)]
    pub cache_backend: Option<String>,

    /// Override the cache entry lifetime.
    #[arg(long = "cache-timeout-seconds", value_name = "SECONDS", global = true)]
    pub cache_timeout_seconds: Option<u64>,

    /// Override the index metadata lifetime.
    #[arg(long = "cache-metadata-ttl-seconds", value_name = "SECONDS", global = true)]
    pub cache_metadata_ttl_seconds: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub max_registry_value_size: NonZeroUsize,
    pub invalidate: bool,
    pub backend: Option<String>,
    pub timeout: Duration,
    pub metadata_ttl: Duration,
    pub memory_capacity: NonZeroUsize,
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
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_registry_value_size: Option<u64>,
    invalidate: Option<bool>,
    backend: Option<String>,
    timeout_seconds: Option<u64>,
    metadata_ttl_seconds: Option<u64>,
    memory_capacity: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(size) = overrides.cache_max_registry_value_size {
            self.cache.max_registry_value_size = Some(size);
        }
        if let Some(invalidate) = overrides.cache_invalidate {
            self.cache.invalidate = Some(invalidate);
        }
        if let Some(backend) = overrides.cache_backend.as_ref() {
            self.cache.backend = Some(backend.clone());
        }
        if let Some(seconds) = overrides.cache_timeout_seconds {
            self.cache.timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cache_metadata_ttl_seconds {
            self.cache.metadata_ttl_seconds = Some(seconds);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { cache, logging } = raw;

        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self { cache, logging })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let max_registry_value_size = non_zero_usize(
        cache
            .max_registry_value_size
            .unwrap_or(DEFAULT_MAX_REGISTRY_VALUE_SIZE as u64),
        "cache.max_registry_value_size",
    )?;

    let memory_capacity = non_zero_usize(
        cache
            .memory_capacity
            .unwrap_or(DEFAULT_MEMORY_CAPACITY as u64),
        "cache.memory_capacity",
    )?;

    let timeout_secs = cache.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "cache.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let metadata_ttl_secs = cache
        .metadata_ttl_seconds
        .unwrap_or(DEFAULT_METADATA_TTL_SECS);
    if metadata_ttl_secs == 0 {
        return Err(LoadError::invalid(
            "cache.metadata_ttl_seconds",
            "must be greater than zero",
        ));
    }

    let backend = cache.backend.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    Ok(CacheSettings {
        max_registry_value_size,
        invalidate: cache.invalidate.unwrap_or(true),
        backend,
        timeout: Duration::from_secs(timeout_secs),
        metadata_ttl: Duration::from_secs(metadata_ttl_secs),
        memory_capacity,
    })
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

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
