//! This module controls configuration parsing from the end user. A bad
//! configuration is rejected whole at startup rather than discovered later.
use std::{
    fs,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::{aggregation, aggregation::AggregationType, stats::Phase};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading the config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// The aggregation buckets are not a valid layout
    #[error("Invalid aggregation buckets: {0}")]
    Buckets(#[from] aggregation::Error),
}

fn default_window_interval_seconds() -> NonZeroU64 {
    NonZeroU64::new(10).unwrap_or(NonZeroU64::MIN)
}

fn default_vendor() -> String {
    String::from("tally")
}

fn default_buffer_directory() -> PathBuf {
    PathBuf::from("/var/lib/tally")
}

fn default_timeout_milliseconds() -> u64 {
    5_000
}

fn default_queue_capacity() -> NonZeroUsize {
    NonZeroUsize::new(64).unwrap_or(NonZeroUsize::MIN)
}

fn default_workers() -> NonZeroU32 {
    NonZeroU32::new(4).unwrap_or(NonZeroU32::MIN)
}

fn default_idle_flush_seconds() -> NonZeroU64 {
    NonZeroU64::new(10).unwrap_or(NonZeroU64::MIN)
}

fn default_buckets() -> Vec<f64> {
    vec![1.0]
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Length of every statistics window
    #[serde(default = "default_window_interval_seconds")]
    pub window_interval_seconds: NonZeroU64,
    /// Vendor id stamped on every statistic
    #[serde(default = "default_vendor")]
    pub vendor: String,
    /// Pipeline phase stamped on every statistic
    #[serde(default)]
    pub phase: Phase,
    /// Deployment-wide tags folded into every TID
    #[serde(default)]
    pub environment: Environment,
    /// The on-disk staging buffer
    #[serde(default)]
    pub buffer: Buffer,
    /// Report delivery
    pub exporter: Exporter,
    /// Period of the timer that closes windows while traffic is idle
    #[serde(default = "default_idle_flush_seconds")]
    pub idle_flush_seconds: NonZeroU64,
    /// Numeric measurement aggregation
    #[serde(default)]
    pub aggregation: Aggregation,
    /// The method by which to express internal telemetry
    pub telemetry: Option<Telemetry>,
}

/// Deployment-wide tags
#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    /// Tags, namespaced under `env.` when hashed
    #[serde(default)]
    pub tags: FxHashMap<String, String>,
}

/// Configuration of the on-disk staging buffer
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Buffer {
    /// Directory staging files are created in
    #[serde(default = "default_buffer_directory")]
    pub directory: PathBuf,
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            directory: default_buffer_directory(),
        }
    }
}

/// Configuration of report delivery
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Exporter {
    /// Base URL of the intake, `/api/v1/<signal>stats` is appended
    pub endpoint: String,
    /// Per-request timeout
    #[serde(default = "default_timeout_milliseconds")]
    pub timeout_milliseconds: u64,
    /// Reports that may wait for delivery before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: NonZeroUsize,
    /// Deliveries in flight at once
    #[serde(default = "default_workers")]
    pub workers: NonZeroU32,
}

impl Exporter {
    /// The per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_milliseconds)
    }
}

/// Configuration of numeric measurement aggregation
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Aggregation {
    /// Ascending bucket upper bounds
    #[serde(default = "default_buckets")]
    pub buckets: Vec<f64>,
    /// Reported view
    #[serde(default)]
    pub mode: AggregationType,
}

impl Default for Aggregation {
    fn default() -> Self {
        Self {
            buckets: default_buckets(),
            mode: AggregationType::default(),
        }
    }
}

/// Internal telemetry
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    /// Address and port for the prometheus exporter
    pub prometheus_addr: SocketAddr,
}

impl Config {
    /// Parse and validate a configuration.
    ///
    /// # Errors
    ///
    /// Fails if `contents` is not a valid configuration.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)?;
        aggregation::Accumulator::new(config.aggregation.buckets.clone())?;
        Ok(config)
    }

    /// Read, parse and validate the configuration at `path`.
    ///
    /// # Errors
    ///
    /// Fails if `path` cannot be read or is not a valid configuration.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    /// The window length.
    #[must_use]
    pub fn window_interval(&self) -> Duration {
        Duration::from_secs(self.window_interval_seconds.get())
    }

    /// The idle flush period.
    #[must_use]
    pub fn idle_flush(&self) -> Duration {
        Duration::from_secs(self.idle_flush_seconds.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::str::FromStr;

    #[test]
    fn config_deserializes_full() -> Result<(), Error> {
        let contents = r#"
window_interval_seconds: 30
vendor: "acme"
phase: post
environment:
  tags:
    cluster: "prod-1"
buffer:
  directory: /tmp/tally
exporter:
  endpoint: "https://intake.example"
  timeout_milliseconds: 1000
  queue_capacity: 8
  workers: 2
idle_flush_seconds: 5
aggregation:
  buckets: [1.0, 10.0, 100.0]
  mode: avg
telemetry:
  prometheus_addr: "0.0.0.0:9000"
"#;
        let config = Config::from_yaml(contents)?;
        assert_eq!(config.window_interval(), Duration::from_secs(30));
        assert_eq!(config.vendor, "acme");
        assert_eq!(config.phase, Phase::Post);
        assert_eq!(
            config.environment.tags.get("cluster").map(String::as_str),
            Some("prod-1")
        );
        assert_eq!(config.buffer.directory, PathBuf::from("/tmp/tally"));
        assert_eq!(config.exporter.endpoint, "https://intake.example");
        assert_eq!(config.exporter.timeout(), Duration::from_secs(1));
        assert_eq!(config.exporter.queue_capacity.get(), 8);
        assert_eq!(config.exporter.workers.get(), 2);
        assert_eq!(config.idle_flush(), Duration::from_secs(5));
        assert_eq!(config.aggregation.buckets, vec![1.0, 10.0, 100.0]);
        assert_eq!(config.aggregation.mode, AggregationType::Avg);
        assert_eq!(
            config.telemetry,
            Some(Telemetry {
                prometheus_addr: SocketAddr::from_str("0.0.0.0:9000").unwrap()
            })
        );
        Ok(())
    }

    #[test]
    fn config_defaults() -> Result<(), Error> {
        let config = Config::from_yaml("exporter:\n  endpoint: \"http://localhost:8080\"\n")?;
        assert_eq!(config.window_interval(), Duration::from_secs(10));
        assert_eq!(config.vendor, "tally");
        assert_eq!(config.phase, Phase::Pre);
        assert!(config.environment.tags.is_empty());
        assert_eq!(config.buffer, Buffer::default());
        assert_eq!(config.exporter.timeout(), Duration::from_millis(5_000));
        assert_eq!(config.exporter.queue_capacity.get(), 64);
        assert_eq!(config.exporter.workers.get(), 4);
        assert_eq!(config.aggregation, Aggregation::default());
        assert_eq!(config.telemetry, None);
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = "exporter:\n  endpoint: \"http://x\"\nwindow_seconds: 3\n";
        assert!(matches!(
            Config::from_yaml(contents),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let contents = "exporter:\n  endpoint: \"http://x\"\nwindow_interval_seconds: 0\n";
        assert!(matches!(
            Config::from_yaml(contents),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn unordered_buckets_are_rejected() {
        let contents = "exporter:\n  endpoint: \"http://x\"\naggregation:\n  buckets: [10.0, 1.0]\n";
        assert!(matches!(
            Config::from_yaml(contents),
            Err(Error::Buckets(aggregation::Error::UnorderedBuckets))
        ));
    }

    #[test]
    fn reads_from_path() -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "exporter:\n  endpoint: \"http://x\"").unwrap();
        let config = Config::from_path(file.path())?;
        assert_eq!(config.exporter.endpoint, "http://x");

        let missing = Config::from_path(Path::new("/nonexistent/tally.yaml"));
        assert!(matches!(missing, Err(Error::ReadFile { .. })));
        Ok(())
    }
}
