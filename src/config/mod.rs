//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::mutation::UndoScope;

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, ListArgs, PageArgs, ReferencesArgs, ShowArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "folio";
const DEFAULT_UNDOABLE_DELAY_MS: u64 = 4_000;
const DEFAULT_CACHE_DURATION_MS: u64 = 5 * 60 * 1000;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 500;
const DEFAULT_BATCH_MAX_IDS: usize = 100;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data: DataSettings,
    pub logging: LoggingSettings,
    pub backend: BackendSettings,
}

/// Behavior of the data layer. Every recognized option, with its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSettings {
    /// How long an undoable mutation stays staged before it is sent.
    pub undoable_delay: Duration,
    /// Age after which a cached entry is stale. Zero revalidates on every query.
    pub cache_duration: Duration,
    pub cache_max_entries: NonZeroUsize,
    /// A batch window flushes as soon as it holds this many distinct ids.
    pub batch_max_ids: NonZeroUsize,
    pub undo_scope: UndoScope,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            undoable_delay: Duration::from_millis(DEFAULT_UNDOABLE_DELAY_MS),
            cache_duration: Duration::from_millis(DEFAULT_CACHE_DURATION_MS),
            cache_max_entries: NonZeroUsize::new(DEFAULT_CACHE_MAX_ENTRIES)
                .unwrap_or(NonZeroUsize::MIN),
            batch_max_ids: NonZeroUsize::new(DEFAULT_BATCH_MAX_IDS).unwrap_or(NonZeroUsize::MIN),
            undo_scope: UndoScope::Global,
        }
    }
}

impl DataSettings {
    /// Re-check invariants for values built by hand rather than loaded.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.undoable_delay.is_zero() {
            return Err(LoadError::invalid(
                "data.undoable_delay_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSettings {
    Memory { fixture: Option<PathBuf> },
    Rest { base_url: Url },
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::Memory { fixture: None }
    }
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

    builder = builder.add_source(Environment::with_prefix("FOLIO").separator("__"));

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
    data: RawDataSettings,
    logging: RawLoggingSettings,
    backend: RawBackendSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDataSettings {
    undoable_delay_ms: Option<u64>,
    cache_duration_ms: Option<u64>,
    cache_max_entries: Option<u64>,
    batch_max_ids: Option<u64>,
    undo_scope: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<String>,
    fixture: Option<PathBuf>,
    base_url: Option<String>,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.rest_url.as_ref() {
            self.backend.kind = Some("rest".to_string());
            self.backend.base_url = Some(url.to_string());
        }
        if let Some(fixture) = overrides.fixture.as_ref() {
            self.backend.kind = Some("memory".to_string());
            self.backend.fixture = Some(fixture.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            data,
            logging,
            backend,
        } = raw;

        let data = build_data_settings(data)?;
        let logging = build_logging_settings(logging)?;
        let backend = build_backend_settings(backend)?;

        Ok(Self {
            data,
            logging,
            backend,
        })
    }
}

fn build_data_settings(data: RawDataSettings) -> Result<DataSettings, LoadError> {
    let undoable_delay_ms = data.undoable_delay_ms.unwrap_or(DEFAULT_UNDOABLE_DELAY_MS);
    if undoable_delay_ms == 0 {
        return Err(LoadError::invalid(
            "data.undoable_delay_ms",
            "must be greater than zero",
        ));
    }

    let cache_duration_ms = data.cache_duration_ms.unwrap_or(DEFAULT_CACHE_DURATION_MS);

    let cache_max_entries = non_zero_usize(
        data.cache_max_entries
            .unwrap_or(DEFAULT_CACHE_MAX_ENTRIES as u64),
        "data.cache_max_entries",
    )?;
    let batch_max_ids = non_zero_usize(
        data.batch_max_ids.unwrap_or(DEFAULT_BATCH_MAX_IDS as u64),
        "data.batch_max_ids",
    )?;

    let undo_scope = match data.undo_scope {
        Some(scope) => UndoScope::from_str(scope.trim())
            .map_err(|err| LoadError::invalid("data.undo_scope", err.to_string()))?,
        None => UndoScope::Global,
    };

    let settings = DataSettings {
        undoable_delay: Duration::from_millis(undoable_delay_ms),
        cache_duration: Duration::from_millis(cache_duration_ms),
        cache_max_entries,
        batch_max_ids,
        undo_scope,
    };
    settings.validate()?;
    Ok(settings)
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

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let kind = backend
        .kind
        .map(|kind| kind.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "memory".to_string());

    match kind.as_str() {
        "memory" => {
            let fixture = backend
                .fixture
                .filter(|path| !path.as_os_str().is_empty());
            Ok(BackendSettings::Memory { fixture })
        }
        "rest" => {
            let raw_url = backend
                .base_url
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    LoadError::invalid("backend.base_url", "required when backend.kind = rest")
                })?;
            let base_url = Url::parse(&raw_url).map_err(|err| {
                LoadError::invalid("backend.base_url", format!("invalid url `{raw_url}`: {err}"))
            })?;
            if base_url.cannot_be_a_base() {
                return Err(LoadError::invalid(
                    "backend.base_url",
                    format!("`{raw_url}` cannot be used as a base url"),
                ));
            }
            Ok(BackendSettings::Rest { base_url })
        }
        other => Err(LoadError::invalid(
            "backend.kind",
            format!("unknown backend `{other}` (expected memory|rest)"),
        )),
    }
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
