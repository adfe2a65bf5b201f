//! Configuration layer: typed settings with layered precedence (file → env).

use std::{
    collections::{BTreeMap, BTreeSet},
    num::NonZeroUsize,
    path::Path,
    str::FromStr,
    time::Duration,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::CacheOp;
use crate::query::FieldKind;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "granule";
const ENV_PREFIX: &str = "GRANULE";
pub(crate) const DEFAULT_LONG_DISJUNCTION: usize = 8;
pub(crate) const DEFAULT_CONJ_TTL_MARGIN_SECS: u64 = 10;
pub(crate) const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;
pub(crate) const DEFAULT_REAP_THRESHOLD: usize = 1000;
pub(crate) const DEFAULT_LOCAL_CAPACITY: usize = 1000;
const DEFAULT_UNTRACKABLE_KINDS: [&str; 2] = ["text", "binary"];

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Fallback for profiles that do not set their own timeout.
    pub default_timeout: Option<Duration>,
    pub long_disjunction: NonZeroUsize,
    pub untrackable_kinds: BTreeSet<FieldKind>,
    /// Conjunction sets never expire when set.
    pub persistent_invalidators: bool,
    pub conj_ttl_margin: Duration,
    pub degrade_on_failure: bool,
    pub lock_timeout: Duration,
    pub stamped: bool,
    pub reap_threshold: NonZeroUsize,
    pub local_capacity: NonZeroUsize,
    /// Profile name (`app.model`, `app.*` or `*`) to profile.
    pub profiles: BTreeMap<String, ProfileSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSettings {
    pub timeout: Option<Duration>,
    pub ops: BTreeSet<CacheOp>,
    pub lock: bool,
    pub local_get: bool,
    pub db_agnostic: bool,
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

#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    /// Redis connection URL; the in-process store is used when absent.
    pub url: Option<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl LoadError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment).
///
/// `config/default` and `granule` (any supported extension) are optional; an
/// explicit `config_file` must exist. Environment variables use the
/// `GRANULE__SECTION__KEY` form.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("cache.untrackable_kinds")
            .try_parsing(true),
    );

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

impl Default for Settings {
    fn default() -> Self {
        // Defaults always validate.
        Self {
            cache: CacheSettings::default(),
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
            store: StoreSettings::default(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout: None,
            long_disjunction: NonZeroUsize::new(DEFAULT_LONG_DISJUNCTION)
                .unwrap_or(NonZeroUsize::MIN),
            untrackable_kinds: BTreeSet::from([FieldKind::Text, FieldKind::Binary]),
            persistent_invalidators: false,
            conj_ttl_margin: Duration::from_secs(DEFAULT_CONJ_TTL_MARGIN_SECS),
            degrade_on_failure: false,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            stamped: false,
            reap_threshold: NonZeroUsize::new(DEFAULT_REAP_THRESHOLD)
                .unwrap_or(NonZeroUsize::MIN),
            local_capacity: NonZeroUsize::new(DEFAULT_LOCAL_CAPACITY)
                .unwrap_or(NonZeroUsize::MIN),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    default_timeout_secs: Option<u64>,
    long_disjunction: Option<usize>,
    untrackable_kinds: Option<Vec<String>>,
    persistent_invalidators: Option<bool>,
    conj_ttl_margin_secs: Option<u64>,
    degrade_on_failure: Option<bool>,
    lock_timeout_ms: Option<u64>,
    stamped: Option<bool>,
    reap_threshold: Option<usize>,
    local_capacity: Option<usize>,
    profiles: BTreeMap<String, RawProfileSettings>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawProfileSettings {
    timeout_secs: Option<u64>,
    ops: Option<Vec<String>>,
    lock: Option<bool>,
    local_get: Option<bool>,
    db_agnostic: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    url: Option<String>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            logging,
            store,
        } = raw;

        Ok(Self {
            cache: build_cache_settings(cache)?,
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store),
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_timeout = cache
        .default_timeout_secs
        .map(|secs| positive_secs(secs, "cache.default_timeout_secs"))
        .transpose()?;

    let long_disjunction = non_zero_usize(
        cache.long_disjunction.unwrap_or(DEFAULT_LONG_DISJUNCTION),
        "cache.long_disjunction",
    )?;

    let untrackable_kinds = match cache.untrackable_kinds {
        Some(kinds) => parse_kinds(&kinds)?,
        None => DEFAULT_UNTRACKABLE_KINDS
            .iter()
            .map(|kind| kind.parse::<FieldKind>().unwrap_or_else(|never| match never {}))
            .collect(),
    };

    let lock_timeout_ms = cache.lock_timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS);
    if lock_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "cache.lock_timeout_ms",
            "must be greater than zero",
        ));
    }

    let mut profiles = BTreeMap::new();
    for (name, raw) in cache.profiles {
        let profile = build_profile_settings(&name, raw)?;
        profiles.insert(name, profile);
    }

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        default_timeout,
        long_disjunction,
        untrackable_kinds,
        persistent_invalidators: cache.persistent_invalidators.unwrap_or(false),
        conj_ttl_margin: Duration::from_secs(
            cache
                .conj_ttl_margin_secs
                .unwrap_or(DEFAULT_CONJ_TTL_MARGIN_SECS),
        ),
        degrade_on_failure: cache.degrade_on_failure.unwrap_or(false),
        lock_timeout: Duration::from_millis(lock_timeout_ms),
        stamped: cache.stamped.unwrap_or(false),
        reap_threshold: non_zero_usize(
            cache.reap_threshold.unwrap_or(DEFAULT_REAP_THRESHOLD),
            "cache.reap_threshold",
        )?,
        local_capacity: non_zero_usize(
            cache.local_capacity.unwrap_or(DEFAULT_LOCAL_CAPACITY),
            "cache.local_capacity",
        )?,
        profiles,
    })
}

fn build_profile_settings(
    name: &str,
    raw: RawProfileSettings,
) -> Result<ProfileSettings, LoadError> {
    if name.trim().is_empty() {
        return Err(LoadError::invalid("cache.profiles", "profile name must not be empty"));
    }

    let timeout = raw
        .timeout_secs
        .map(|secs| positive_secs(secs, format!("cache.profiles.{name}.timeout_secs")))
        .transpose()?;

    let ops = match raw.ops {
        Some(ops) => ops
            .iter()
            .map(|op| {
                CacheOp::from_str(op.trim()).map_err(|reason| {
                    LoadError::invalid(format!("cache.profiles.{name}.ops"), reason)
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()?,
        None => CacheOp::ALL.into_iter().collect(),
    };

    Ok(ProfileSettings {
        timeout,
        ops,
        lock: raw.lock.unwrap_or(false),
        local_get: raw.local_get.unwrap_or(false),
        db_agnostic: raw.db_agnostic.unwrap_or(true),
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

fn build_store_settings(store: RawStoreSettings) -> StoreSettings {
    let url = store.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    StoreSettings { url }
}

fn parse_kinds(kinds: &[String]) -> Result<BTreeSet<FieldKind>, LoadError> {
    kinds
        .iter()
        .map(|kind| {
            let kind = kind.trim();
            if kind.is_empty() {
                return Err(LoadError::invalid(
                    "cache.untrackable_kinds",
                    "field kind must not be empty",
                ));
            }
            Ok(kind.parse::<FieldKind>().unwrap_or_else(|never| match never {}))
        })
        .collect()
}

fn positive_secs(secs: u64, key: impl Into<String>) -> Result<Duration, LoadError> {
    if secs == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
