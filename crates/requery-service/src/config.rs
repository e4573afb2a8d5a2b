use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use requery_cache::{CacheConfig, DEFAULT_EXPIRATION};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "requery".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The shared cache store.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// How long entries live after their last write. `null` keeps them forever.
    #[serde(with = "humantime_serde")]
    pub expiration: Option<Duration>,
    /// The maximum number of entries held in memory. Unbounded if not set.
    pub capacity: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            expiration: Some(DEFAULT_EXPIRATION),
            capacity: None,
        }
    }
}

impl From<CacheSettings> for CacheConfig {
    fn from(settings: CacheSettings) -> Self {
        CacheConfig {
            expiration: settings.expiration,
        }
    }
}

/// Defaults for every query built with
/// [`QueryOptions::from_config`](crate::query::QueryOptions::from_config).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct QueryDefaults {
    /// Cached results younger than this are served without fetching.
    #[serde(with = "humantime_serde")]
    pub stale_time: Option<Duration>,
    /// Overrides `cache.expiration` for results written by queries.
    #[serde(with = "humantime_serde")]
    pub cache_expiration: Option<Duration>,
    /// How often a failed fetch is retried.
    pub retry_count: u32,
    /// A fixed delay between retries. Exponential backoff if not set.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Option<Duration>,
    /// After how long a running fetch is reported as slow.
    #[serde(with = "humantime_serde")]
    pub loading_timeout: Option<Duration>,
    /// Focus events within this window after a focus refresh are ignored.
    #[serde(with = "humantime_serde")]
    pub focus_throttle: Duration,
    /// Refresh periodically.
    #[serde(with = "humantime_serde")]
    pub polling_interval: Option<Duration>,
    pub revalidate_when_hidden: bool,
    pub revalidate_when_offline: bool,
}

impl Default for QueryDefaults {
    fn default() -> Self {
        Self {
            stale_time: None,
            cache_expiration: None,
            retry_count: 3,
            retry_interval: None,
            loading_timeout: None,
            focus_throttle: Duration::from_secs(5),
            polling_interval: None,
            revalidate_when_hidden: false,
            revalidate_when_offline: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Controls the log format and level.
    pub logging: Logging,

    /// Controls the internal metrics.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// The shared cache store.
    pub cache: CacheSettings,

    /// Defaults for queries.
    pub query: QueryDefaults,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.cache.expiration, Some(Duration::from_secs(300)));
        assert_eq!(cfg.query.retry_count, 3);
        assert_eq!(cfg.query.focus_throttle, Duration::from_secs(5));
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_query_defaults() {
        // Setting individual values keeps the defaults of the others.
        let yaml = r#"
            query:
              stale_time: 30s
              retry_count: 1
              polling_interval: 1m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.query.stale_time, Some(Duration::from_secs(30)));
        assert_eq!(cfg.query.retry_count, 1);
        assert_eq!(cfg.query.polling_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.query.focus_throttle, Duration::from_secs(5));
        assert_eq!(cfg.query.cache_expiration, None);
        assert_eq!(cfg.cache, CacheSettings::default());
    }

    #[test]
    fn test_disabling_expiry() {
        // It should be possible to set the expiration to `None` meaning "do not expire".
        let yaml = r#"
            cache:
              expiration: null
              capacity: 1000
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.expiration, None);
        assert_eq!(cfg.cache.capacity, Some(1000));
        assert_eq!(CacheConfig::from(cfg.cache), CacheConfig { expiration: None });
    }

    #[test]
    fn test_logging() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert!(cfg.logging.enable_backtraces);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            cache:
              not_a_setting: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
