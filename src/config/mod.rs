//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "marketsync";
const ENV_PREFIX: &str = "MARKETSYNC";
const DEFAULT_KEEP_UNUSED_DATA_FOR_MS: u64 = 0;
const DEFAULT_EVENT_JOURNAL_LIMIT: u64 = 256;
const DEFAULT_BACKEND_LATENCY_MS: u64 = 50;
const MAX_BACKEND_LATENCY_MS: u64 = 60_000;

/// Command-line arguments for the marketsync binary.
#[derive(Debug, Parser)]
#[command(
    name = "marketsync",
    version,
    about = "Storefront cache scenarios against an in-memory marketplace"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MARKETSYNC_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run every storefront scenario in sequence.
    Demo(DemoArgs),
    /// Run a single storefront scenario.
    Scenario(ScenarioArgs),
    /// List the registered marketplace endpoints.
    Endpoints(EndpointsArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,

    /// Print the sync event journal after each scenario.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub events: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ScenarioArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,

    /// Scenario to run.
    #[arg(value_enum, value_name = "NAME")]
    pub name: ScenarioName,

    /// Print the sync event journal after the scenario.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub events: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct EndpointsArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioName {
    /// Add an item that is already in the cart; the server answers 409.
    AddConflict,
    /// Rapid quantity updates on one cart line.
    QuantityRace,
    /// Place an order and watch cart, orders and dashboard refresh.
    Checkout,
    /// Toggle a wishlist entry while the backend is offline.
    OfflineWishlist,
}

impl ScenarioName {
    pub fn all() -> [ScenarioName; 4] {
        [
            ScenarioName::AddConflict,
            ScenarioName::QuantityRace,
            ScenarioName::Checkout,
            ScenarioName::OfflineWishlist,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScenarioName::AddConflict => "add-conflict",
            ScenarioName::QuantityRace => "quantity-race",
            ScenarioName::Checkout => "checkout",
            ScenarioName::OfflineWishlist => "offline-wishlist",
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunOverrides {
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

    /// Override how long unsubscribed entries are kept before eviction.
    #[arg(long = "sync-keep-unused-ms", value_name = "MILLIS")]
    pub keep_unused_data_for_ms: Option<u64>,

    /// Toggle refetching of subscribed entries on invalidation.
    #[arg(
        long = "sync-refetch-on-invalidate",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub refetch_on_invalidate: Option<bool>,

    /// Override the number of retained sync events.
    #[arg(long = "sync-event-journal-limit", value_name = "COUNT")]
    pub event_journal_limit: Option<u64>,

    /// Override the simulated backend round-trip latency.
    #[arg(long = "backend-latency-ms", value_name = "MILLIS")]
    pub backend_latency_ms: Option<u64>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub sync: SyncSettings,
    pub backend: BackendSettings,
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
pub struct SyncSettings {
    pub keep_unused_data_for: Duration,
    pub refetch_on_invalidate: bool,
    pub event_journal_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub latency: Duration,
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
    raw.apply_overrides(cli.command.as_ref().map(Command::overrides));

    Settings::from_raw(raw)
}

impl Command {
    pub fn overrides(&self) -> &RunOverrides {
        match self {
            Command::Demo(args) => &args.overrides,
            Command::Scenario(args) => &args.overrides,
            Command::Endpoints(args) => &args.overrides,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    sync: RawSyncSettings,
    backend: RawBackendSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: Option<&RunOverrides>) {
        let Some(overrides) = overrides else {
            return;
        };
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(millis) = overrides.keep_unused_data_for_ms {
            self.sync.keep_unused_data_for_ms = Some(millis);
        }
        if let Some(refetch) = overrides.refetch_on_invalidate {
            self.sync.refetch_on_invalidate = Some(refetch);
        }
        if let Some(limit) = overrides.event_journal_limit {
            self.sync.event_journal_limit = Some(limit);
        }
        if let Some(latency) = overrides.backend_latency_ms {
            self.backend.latency_ms = Some(latency);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            sync,
            backend,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            sync: build_sync_settings(sync)?,
            backend: build_backend_settings(backend)?,
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

fn build_sync_settings(sync: RawSyncSettings) -> Result<SyncSettings, LoadError> {
    let keep_unused_ms = sync
        .keep_unused_data_for_ms
        .unwrap_or(DEFAULT_KEEP_UNUSED_DATA_FOR_MS);
    let journal_limit = sync
        .event_journal_limit
        .unwrap_or(DEFAULT_EVENT_JOURNAL_LIMIT);

    Ok(SyncSettings {
        keep_unused_data_for: Duration::from_millis(keep_unused_ms),
        refetch_on_invalidate: sync.refetch_on_invalidate.unwrap_or(true),
        event_journal_limit: non_zero_usize(journal_limit, "sync.event_journal_limit")?,
    })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let latency_ms = backend.latency_ms.unwrap_or(DEFAULT_BACKEND_LATENCY_MS);
    if latency_ms > MAX_BACKEND_LATENCY_MS {
        return Err(LoadError::invalid(
            "backend.latency_ms",
            format!("must not exceed {MAX_BACKEND_LATENCY_MS}"),
        ));
    }

    Ok(BackendSettings {
        latency: Duration::from_millis(latency_ms),
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
struct RawSyncSettings {
    keep_unused_data_for_ms: Option<u64>,
    refetch_on_invalidate: Option<bool>,
    event_journal_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    latency_ms: Option<u64>,
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
