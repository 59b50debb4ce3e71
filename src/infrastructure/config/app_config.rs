//! Application configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::infrastructure::image::http_fetcher::{
    DEFAULT_MAX_CONNECTIONS_PER_HOST, DEFAULT_TIMEOUT, default_user_agent,
};
use crate::infrastructure::image::memory_cache::{DEFAULT_COST_LIMIT, DEFAULT_COUNT_LIMIT};
use crate::infrastructure::image::{ImageLoaderConfig, default_cache_dir};
use crate::{APP_ORGANIZATION, APP_QUALIFIER, NAME};

/// Log level configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Trace level.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trace => write!(f, "trace"),
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Application configuration, read from `config.toml` and overridden by CLI flags.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Configuration file path.
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Log file path.
    #[serde(skip)]
    pub log_path: Option<PathBuf>,

    /// Log verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Network configuration.
    #[serde(default)]
    pub network: NetworkConfig,
}

/// Cache tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of decoded images kept in memory.
    #[serde(default = "default_memory_count_limit")]
    pub memory_count_limit: usize,

    /// Maximum estimated bytes of decoded images kept in memory.
    #[serde(default = "default_memory_cost_limit")]
    pub memory_cost_limit: u64,

    /// Disk cache directory. Defaults to the per-user cache directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_count_limit: DEFAULT_COUNT_LIMIT,
            memory_cost_limit: DEFAULT_COST_LIMIT,
            directory: None,
        }
    }
}

impl CacheConfig {
    /// Returns the configured disk cache directory or the default one.
    #[must_use]
    pub fn effective_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_cache_dir)
    }

    /// Builds the loader configuration.
    #[must_use]
    pub const fn loader_config(&self) -> ImageLoaderConfig {
        ImageLoaderConfig {
            memory_count_limit: self.memory_count_limit,
            memory_cost_limit: self.memory_cost_limit,
        }
    }
}

/// HTTP fetching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Simultaneous requests allowed per host.
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    /// Returns the request timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_memory_count_limit() -> usize {
    DEFAULT_COUNT_LIMIT
}

fn default_memory_cost_limit() -> u64 {
    DEFAULT_COST_LIMIT
}

fn default_max_connections_per_host() -> usize {
    DEFAULT_MAX_CONNECTIONS_PER_HOST
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

use super::args::CliArgs;

impl AppConfig {
    /// Merges CLI arguments into the configuration.
    pub fn merge_with_args(&mut self, args: &CliArgs) {
        if let Some(config_path) = &args.config {
            self.config = Some(config_path.clone());
        }
        if let Some(log_path) = &args.log_path {
            self.log_path = Some(log_path.clone());
        }
        if let Some(log_level) = args.log_level {
            self.log_level = log_level;
        }
        if let Some(cache_dir) = &args.cache_dir {
            self.cache.directory = Some(cache_dir.clone());
        }
    }

    /// Returns default config directory.
    #[must_use]
    pub fn default_config_dir() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Returns default log file path.
    #[must_use]
    pub fn default_log_path() -> Option<PathBuf> {
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, NAME)
            .map(|dirs| dirs.data_dir().join("imagecache.log"))
    }

    /// Returns effective log path.
    #[must_use]
    pub fn effective_log_path(&self) -> Option<PathBuf> {
        self.log_path.clone().or_else(Self::default_log_path)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config: None,
            log_path: None,
            log_level: LogLevel::Info,
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_partial_config() {
        let toml_content = r#"
            log_level = "debug"

            [cache]
            memory_count_limit = 10
            directory = "/tmp/images"

            [network]
            timeout_secs = 5
        "#;

        let config: AppConfig = toml::from_str(toml_content).expect("Failed to parse config");

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.cache.memory_count_limit, 10);
        assert_eq!(config.cache.memory_cost_limit, DEFAULT_COST_LIMIT);
        assert_eq!(
            config.cache.effective_directory(),
            PathBuf::from("/tmp/images")
        );
        assert_eq!(config.network.timeout(), Duration::from_secs(5));
        assert_eq!(
            config.network.max_connections_per_host,
            DEFAULT_MAX_CONNECTIONS_PER_HOST
        );
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.network.max_connections_per_host, 4);
        assert!(config.cache.directory.is_none());
        assert_eq!(config.cache.loader_config().memory_count_limit, 100);
    }

    #[test]
    fn test_round_trips_through_toml() {
        let original = AppConfig::default();
        let text = toml::to_string_pretty(&original).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.user_agent, original.network.user_agent);
    }

    #[test]
    fn test_cli_overrides_file_values() {
        let mut config: AppConfig = toml::from_str("log_level = \"warn\"").unwrap();
        let args = CliArgs::parse_from([
            "imagecache",
            "--log-level",
            "trace",
            "--cache-dir",
            "/var/cache/img",
            "clear",
        ]);

        config.merge_with_args(&args);

        assert_eq!(config.log_level, LogLevel::Trace);
        assert_eq!(
            config.cache.directory,
            Some(PathBuf::from("/var/cache/img"))
        );
    }
}
