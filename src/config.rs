//! Configuration management for streamrate.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, StreamRateError};
use crate::units::BitRate;

/// The smallest bucket resolution a meter accepts.
pub const MIN_METER_RESOLUTION: Duration = Duration::from_millis(100);

/// Prefix of environment variables that override file configuration.
pub const ENV_PREFIX: &str = "STREAMRATE";

/// Top-level configuration for a limited and measured stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRateConfig {
    /// Limiting bit rate; `None` passes data through unlimited
    #[serde(default)]
    pub rate: Option<BitRate>,

    /// Bit rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Bit rate measurement configuration
    #[serde(default)]
    pub meter: MeterConfig,

    /// How often the command-line tool logs the current bit rate
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
}

impl Default for StreamRateConfig {
    fn default() -> Self {
        Self {
            rate: None,
            limiter: LimiterConfig::default(),
            meter: MeterConfig::default(),
            report_interval_ms: default_report_interval(),
        }
    }
}

/// Bit rate limiting configuration.
///
/// `resolution_ms` is the period over which the transferred amount is
/// totaled. At 1 kbit/s with a 3s resolution, 3 kbit may pass at once after
/// 2 idle seconds; with a 1s resolution, never more than 1 kbit per second.
///
/// `max_wait_ms` bounds how long a transfer over the rate waits. After that
/// long the portion allowed by then is transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_limiter_resolution")]
    pub resolution_ms: u64,

    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            resolution_ms: default_limiter_resolution(),
            max_wait_ms: default_max_wait(),
        }
    }
}

impl LimiterConfig {
    /// The resolution as a duration.
    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms)
    }

    /// The maximum wait as a duration.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Bit rate measurement configuration.
///
/// `resolution_ms` is how often the bit rate is updated. `sample_ms` is the
/// length of the moving-average window; it should be an integral multiple of
/// the resolution and must be at least twice as long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default = "default_meter_resolution")]
    pub resolution_ms: u64,

    #[serde(default = "default_sample")]
    pub sample_ms: u64,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            resolution_ms: default_meter_resolution(),
            sample_ms: default_sample(),
        }
    }
}

impl MeterConfig {
    /// The resolution as a duration.
    pub fn resolution(&self) -> Duration {
        Duration::from_millis(self.resolution_ms)
    }

    /// The sample window as a duration.
    pub fn sample(&self) -> Duration {
        Duration::from_millis(self.sample_ms)
    }
}

fn default_limiter_resolution() -> u64 {
    1000
}

fn default_max_wait() -> u64 {
    500
}

fn default_meter_resolution() -> u64 {
    500
}

fn default_sample() -> u64 {
    3000
}

fn default_report_interval() -> u64 {
    1000
}

impl StreamRateConfig {
    /// Load configuration from an optional file, overridden by
    /// `STREAMRATE_*` environment variables (`STREAMRATE_LIMITER__MAX_WAIT_MS`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(File::from(path));
        }
        let config: StreamRateConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: StreamRateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| StreamRateError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every parameter constraint without building any engine.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.rate {
            if rate.bps().is_nan() || rate.bps() <= 0.0 || rate.is_infinite() {
                return Err(StreamRateError::invalid(format!("bit rate {} must be positive", rate)));
            }
            let bytes_per_sec = rate.bytes_per_sec();
            if self.limiter.resolution_ms == 0 {
                return Err(StreamRateError::invalid("limiter resolution must be positive"));
            }
            if self.limiter.max_wait_ms == 0 {
                return Err(StreamRateError::invalid("limiter max-wait must be positive"));
            }
            if bytes_per_sec * self.limiter.resolution().as_secs_f64() < 1.0 {
                return Err(StreamRateError::invalid(
                    "rate and/or limiter resolution is too small",
                ));
            }
            if bytes_per_sec * self.limiter.max_wait().as_secs_f64() < 1.0 {
                return Err(StreamRateError::invalid("rate and/or max-wait is too small"));
            }
        }

        let resolution = self.meter.resolution();
        if resolution < MIN_METER_RESOLUTION {
            return Err(StreamRateError::invalid(format!(
                "meter resolution {:?} is below the minimum {:?}",
                resolution, MIN_METER_RESOLUTION
            )));
        }
        if self.meter.sample_ms / self.meter.resolution_ms < 2 {
            return Err(StreamRateError::invalid(format!(
                "sample duration {}ms must be at least twice the resolution {}ms",
                self.meter.sample_ms, self.meter.resolution_ms
            )));
        }
        if self.report_interval_ms == 0 {
            return Err(StreamRateError::invalid("report interval must be positive"));
        }
        Ok(())
    }
}
