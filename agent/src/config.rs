//! Configuration types for the accounting agent
//!
//! Values are layered, lowest precedence first: built-in defaults, an
//! optional TOML file, `GPUSCOPE_*` environment variables, and finally
//! command line flags (applied by the caller on the [`RawConfig`]).

use anyhow::{Context, Result};
use gpuscope_shared::utils::parse_duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default reporting interval
pub const DEFAULT_INTERVAL: &str = "10s";

/// Thread capacity assumed when none is configured: 108 SMs x 2048
/// resident threads (A100)
pub const DEFAULT_MAX_THREADS: u64 = 108 * 2048;

/// How the agent is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Read events as they arrive and report on a wall-clock interval
    Live,
    /// Read a recorded event log and cut intervals by event time
    Replay,
}

impl std::str::FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(RunMode::Live),
            "replay" => Ok(RunMode::Replay),
            _ => anyhow::bail!("Invalid run mode: {}", s),
        }
    }
}

/// Unresolved configuration as read from files and the environment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    /// Reporting interval (e.g. "10s", "500ms")
    pub interval: Option<String>,

    /// Max concurrent threads per device, indexed by device number
    pub device_max_threads: Option<Vec<u64>>,

    /// Device the tracked processes run on
    pub device_index: Option<usize>,

    /// "live" or "replay"
    pub mode: Option<String>,

    /// Event input (JSON lines); stdin when unset
    pub input: Option<PathBuf>,

    /// Stats output (JSON lines); stdout when unset
    pub json_output: Option<PathBuf>,

    /// Where to write Prometheus metrics on shutdown
    pub metrics_output: Option<PathBuf>,
}

impl RawConfig {
    /// Load from an optional TOML file plus `GPUSCOPE_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("GPUSCOPE")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("device_max_threads"),
        );

        let raw = builder
            .build()
            .context("Failed to read configuration sources")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        Ok(raw)
    }
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Reporting interval
    pub interval: Duration,

    /// Max concurrent threads per device
    pub device_max_threads: Vec<u64>,

    /// Device the tracked processes run on
    pub device_index: usize,

    pub mode: RunMode,

    /// Event input path (None = stdin)
    pub input: Option<PathBuf>,

    /// Stats output path (None = stdout)
    pub json_output: Option<PathBuf>,

    /// Optional Prometheus text dump written on shutdown
    pub metrics_output: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            device_max_threads: vec![DEFAULT_MAX_THREADS],
            device_index: 0,
            mode: RunMode::Live,
            input: None,
            json_output: None,
            metrics_output: None,
        }
    }
}

impl TryFrom<RawConfig> for Config {
    type Error = anyhow::Error;

    fn try_from(raw: RawConfig) -> Result<Self> {
        let defaults = Config::default();

        let interval = parse_duration(raw.interval.as_deref().unwrap_or(DEFAULT_INTERVAL))
            .context("Invalid interval")?;
        let mode = match raw.mode {
            Some(mode) => mode.parse()?,
            None => defaults.mode,
        };

        Ok(Self {
            interval,
            device_max_threads: raw
                .device_max_threads
                .unwrap_or(defaults.device_max_threads),
            device_index: raw.device_index.unwrap_or(defaults.device_index),
            mode,
            input: raw.input,
            json_output: raw.json_output,
            metrics_output: raw.metrics_output,
        })
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval.is_zero() {
            anyhow::bail!("Interval must be greater than 0");
        }

        if self.device_max_threads.is_empty() {
            anyhow::bail!("At least one device capacity must be configured");
        }

        if let Some(idx) = self.device_max_threads.iter().position(|&t| t == 0) {
            anyhow::bail!("Device {} has a max thread count of 0", idx);
        }

        if self.device_index >= self.device_max_threads.len() {
            anyhow::bail!(
                "Device index {} out of range ({} devices configured)",
                self.device_index,
                self.device_max_threads.len()
            );
        }

        if self.mode == RunMode::Replay && self.input.is_none() {
            anyhow::bail!("Replay mode requires an input file");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::try_from(RawConfig::default()).unwrap();
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.device_max_threads, vec![DEFAULT_MAX_THREADS]);
        assert_eq!(config.mode, RunMode::Live);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_raw_overrides() {
        let raw = RawConfig {
            interval: Some("500ms".to_string()),
            device_max_threads: Some(vec![1024, 2048]),
            device_index: Some(1),
            mode: Some("Replay".to_string()),
            input: Some(PathBuf::from("events.jsonl")),
            ..Default::default()
        };

        let config = Config::try_from(raw).unwrap();
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.device_index, 1);
        assert_eq!(config.mode, RunMode::Replay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_mode_and_interval() {
        let bad_mode = RawConfig {
            mode: Some("batch".to_string()),
            ..Default::default()
        };
        assert!(Config::try_from(bad_mode).is_err());

        let bad_interval = RawConfig {
            interval: Some("soon".to_string()),
            ..Default::default()
        };
        assert!(Config::try_from(bad_interval).is_err());
    }

    #[test]
    fn test_validation_zero_interval() {
        let config = Config {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_device_capacity() {
        let no_devices = Config {
            device_max_threads: vec![],
            ..Default::default()
        };
        assert!(no_devices.validate().is_err());

        let zero_capacity = Config {
            device_max_threads: vec![2048, 0],
            ..Default::default()
        };
        assert!(zero_capacity.validate().is_err());

        let out_of_range = Config {
            device_index: 1,
            ..Default::default()
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn test_validation_replay_needs_input() {
        let config = Config {
            mode: RunMode::Replay,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "interval = \"2s\"\ndevice_max_threads = [4096]\nmode = \"replay\"\ninput = \"trace.jsonl\""
        )
        .unwrap();

        let raw = RawConfig::load(Some(file.path())).unwrap();
        assert_eq!(raw.interval.as_deref(), Some("2s"));
        assert_eq!(raw.device_max_threads, Some(vec![4096]));

        let config = Config::try_from(raw).unwrap();
        assert_eq!(config.mode, RunMode::Replay);
        assert_eq!(config.input, Some(PathBuf::from("trace.jsonl")));
    }
}
