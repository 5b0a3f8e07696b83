use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

/// Controls the log format.
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
    /// The log level for the loader.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// The process-wide loader configuration.
///
/// These are defaults; a specific load may override the timeout and the tier
/// toggles through [`LoadOptions`](crate::LoadOptions).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory to persist the disk cache in.
    ///
    /// One subdirectory per value type is created beneath it. Leaving this
    /// as `None` disables the disk tier entirely.
    pub cache_dir: Option<PathBuf>,
    /// Whether loaded values are kept in the in-memory tier.
    pub use_memory_cache: bool,
    /// Whether fetched bytes are persisted to the disk tier.
    ///
    /// Only effective when [`cache_dir`](Self::cache_dir) is set.
    pub use_disk_cache: bool,
    /// Default time budget for one load, racing against completion.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// The logging configuration.
    pub logging: Logging,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            use_memory_cache: true,
            use_disk_cache: true,
            timeout: Duration::from_secs(30),
            logging: Logging::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the given YAML file, or the defaults if
    /// no path is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
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

    /// Returns the cache subdirectory for `dir`, or `None` if the disk cache
    /// is disabled.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        v.parse()
            .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(v), &self))
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
        let config = Config::default();
        assert!(config.cache_dir.is_none());
        assert!(config.use_memory_cache);
        assert!(config.use_disk_cache);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
            cache_dir: /tmp/loadcache
            use_disk_cache: false
            timeout: 250ms
            logging:
              level: debug
              format: json
        "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/loadcache")));
        assert!(config.use_memory_cache);
        assert!(!config.use_disk_cache);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_empty_config_rejected() {
        let result = Config::from_reader(std::io::Cursor::new("  \n"));
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_level_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("logging:\n  level: loud\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_cache_dir_join() {
        let config = Config {
            cache_dir: Some(PathBuf::from("/var/cache/loadcache")),
            ..Default::default()
        };
        assert_eq!(
            config.cache_dir("images"),
            Some(PathBuf::from("/var/cache/loadcache/images"))
        );
        assert_eq!(Config::default().cache_dir("images"), None);
    }
}
