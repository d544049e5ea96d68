//! Run configuration.
//!
//! A run is described by one file, YAML by default or TOML when the file ends
//! in `.toml`:
//!
//! ```yaml
//! addr: ws://127.0.0.1:8080/stream
//! type: ws
//! initial_count: 10
//! pump_count: 3
//! duration: 30
//! ```
//!
//! All five keys are required and the numeric ones must be positive.
//! `throttle_ms`, `signal_queue_capacity` and `spool_dir` are optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::engine::ramp::{RampPlan, DEFAULT_THROTTLE};
use crate::engine::{RunSettings, DEFAULT_QUEUE_CAPACITY};
use crate::protocols::{ClientOptions, Protocol, UnknownProtocol};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("{0} is required in config")]
    MissingField(&'static str),

    #[error("{field} must be greater than 0")]
    NonPositive { field: &'static str },

    #[error("unknown connection type: {0} (supported types: ws, sse, hls, flv)")]
    UnsupportedProtocol(String),

    #[error("initial_count {initial_count} with pump_count {pump_count} dispatches more clients than can be counted")]
    PopulationOverflow { initial_count: u64, pump_count: u32 },
}

/// On-disk shape. Every field is optional here so a missing key reports
/// which key it was instead of a generic parse error.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    addr: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    initial_count: Option<i64>,
    pump_count: Option<i64>,
    duration: Option<i64>,
    throttle_ms: Option<u64>,
    signal_queue_capacity: Option<usize>,
    spool_dir: Option<PathBuf>,
}

/// Validated, immutable description of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub target: String,
    pub protocol: Protocol,
    pub initial_count: u64,
    pub pump_count: u32,
    /// Hard duration of every connection.
    pub duration: Duration,
    /// Pause between waves.
    pub throttle: Duration,
    pub queue_capacity: usize,
    pub spool_dir: Option<PathBuf>,
}

impl RunConfig {
    /// Load and validate a config file. The format follows the extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let raw: RawConfig = if is_toml {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            Self::parse_yaml(&content).map_err(|reason| ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            })?
        };

        let config = Self::validate(raw)?;
        info!(
            path = %path.display(),
            protocol = %config.protocol,
            "loaded run configuration"
        );
        Ok(config)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let raw = Self::parse_yaml(content).map_err(|reason| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            reason,
        })?;
        Self::validate(raw)
    }

    fn parse_yaml(content: &str) -> Result<RawConfig, String> {
        // An empty document is null rather than an empty mapping.
        if content.trim().is_empty() {
            return Ok(RawConfig::default());
        }
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let target = raw
            .addr
            .filter(|a| !a.trim().is_empty())
            .ok_or(ConfigError::MissingField("addr"))?;
        let kind = raw
            .kind
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingField("type"))?;

        let initial_count = positive("initial_count", raw.initial_count)?;
        let duration = positive("duration", raw.duration)?;
        let pump_count = positive("pump_count", raw.pump_count)?;

        let protocol: Protocol = kind
            .parse()
            .map_err(|UnknownProtocol(tag)| ConfigError::UnsupportedProtocol(tag))?;

        let pump_count = u32::try_from(pump_count).map_err(|_| ConfigError::PopulationOverflow {
            initial_count,
            pump_count: u32::MAX,
        })?;
        if RampPlan::new(initial_count, pump_count)
            .checked_stop_count()
            .is_none()
        {
            return Err(ConfigError::PopulationOverflow {
                initial_count,
                pump_count,
            });
        }

        let throttle = match raw.throttle_ms {
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_THROTTLE,
        };
        let queue_capacity = match raw.signal_queue_capacity {
            Some(0) => {
                return Err(ConfigError::NonPositive {
                    field: "signal_queue_capacity",
                })
            }
            Some(n) => n,
            None => DEFAULT_QUEUE_CAPACITY,
        };

        Ok(Self {
            target,
            protocol,
            initial_count,
            pump_count,
            duration: Duration::from_secs(duration),
            throttle,
            queue_capacity,
            spool_dir: raw.spool_dir,
        })
    }

    /// Protocol-independent engine parameters.
    pub fn settings(&self) -> RunSettings {
        RunSettings {
            target: self.target.clone(),
            duration: self.duration,
            plan: RampPlan::new(self.initial_count, self.pump_count).with_throttle(self.throttle),
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            spool_dir: self.spool_dir.clone(),
        }
    }
}

fn positive(field: &'static str, value: Option<i64>) -> Result<u64, ConfigError> {
    match value {
        None => Err(ConfigError::MissingField(field)),
        Some(v) if v <= 0 => Err(ConfigError::NonPositive { field }),
        Some(v) => Ok(v as u64),
    }
}
