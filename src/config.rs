//! Engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `GATE_DAQ_`, using `__` between
//!    nesting levels (`GATE_DAQ_MEASUREMENT__RAMP_RATE=0.5`)
//!
//! The measurement and buffer sections can also be built directly in code,
//! which is what most tests do.
//!
//! # Example
//! ```no_run
//! use gate_daq::config::EngineConfig;
//!
//! let config = EngineConfig::load_from("config/gate_daq.toml")?;
//! config.validate()?;
//! println!("ramp rate: {}", config.measurement.ramp_rate);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Ramp timing and output naming
    #[serde(default)]
    pub measurement: MeasurementSettings,
    /// Default buffer settings applied to buffered measurements
    #[serde(default)]
    pub buffer: BufferSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "gate_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Timing used when moving channels and naming results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// Maximum ramp speed in channel units per second
    pub ramp_rate: f64,
    /// Upper bound on the duration of a single ramp, in seconds
    pub ramp_time: f64,
    /// Interval between ramp steps, in seconds
    pub setpoint_interval: f64,
    /// Settling time after ramping to the start of a sweep, in seconds
    pub wait_time: f64,
    /// Prefix dataset names with the swept gate's name
    pub include_gate_name: bool,
    /// Record the current value of dynamic channels that are not being swept
    pub log_idle_params: bool,
    /// Poll interval while waiting for buffers to finish, in seconds
    pub poll_interval: f64,
    /// Directory for file-backed metadata
    pub data_location: Option<PathBuf>,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            ramp_rate: 0.3,
            ramp_time: 5.0,
            setpoint_interval: 0.1,
            wait_time: 0.0,
            include_gate_name: true,
            log_idle_params: true,
            poll_interval: 0.05,
            data_location: None,
        }
    }
}

/// Convert a setting given in seconds to a [`Duration`].
///
/// Negative values clamp to zero. Values a `Duration` cannot hold, such as
/// infinity, are a configuration error.
pub fn seconds(name: &str, value: f64) -> AppResult<Duration> {
    Duration::try_from_secs_f64(value.max(0.0)).map_err(|e| {
        DaqError::Configuration(format!("{name} = {value} is not a valid duration: {e}"))
    })
}

/// How the routine starts an armed buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// The routine calls `force_trigger` on every buffer.
    Software,
    /// An external signal starts acquisition.
    Hardware,
    /// The operator starts acquisition by hand.
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerType::Software => "software",
            TriggerType::Hardware => "hardware",
            TriggerType::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for TriggerType {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "software" => Ok(TriggerType::Software),
            "hardware" => Ok(TriggerType::Hardware),
            "manual" => Ok(TriggerType::Manual),
            other => Err(DaqError::Configuration(format!(
                "Invalid trigger_type '{other}'. Must be one of: software, hardware, manual"
            ))),
        }
    }
}

/// Acquisition settings shared by every buffer in a measurement.
///
/// At most one of `num_points` or `sampling_rate`/`burst_duration` may be
/// given; see [`crate::experiment::sweep::resolve_buffered_num_points`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferSettings {
    /// Samples per second
    #[serde(alias = "sample_rate")]
    pub sampling_rate: Option<f64>,
    /// Length of one acquisition burst in seconds
    pub burst_duration: Option<f64>,
    /// Duration of the buffered ramp in seconds
    pub duration: Option<f64>,
    /// Number of points per burst
    pub num_points: Option<usize>,
    /// How the buffer is started
    pub trigger_type: Option<TriggerType>,
    /// Trigger level, in instrument units
    pub trigger_threshold: Option<f64>,
    /// Trigger input channel on the instrument
    pub channel: Option<String>,
    /// Delay after the trigger in seconds
    pub delay: Option<f64>,
}

impl BufferSettings {
    /// Parse buffer settings from a JSON object, rejecting unknown keys.
    pub fn from_json(value: serde_json::Value) -> AppResult<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file and `GATE_DAQ_` environment variables
    ///
    /// Missing sections fall back to defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GATE_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let m = &self.measurement;
        if m.ramp_rate <= 0.0 {
            return Err(format!("ramp_rate must be positive, got {}", m.ramp_rate));
        }
        if m.setpoint_interval <= 0.0 {
            return Err(format!(
                "setpoint_interval must be positive, got {}",
                m.setpoint_interval
            ));
        }
        for (name, value) in [
            ("ramp_time", m.ramp_time),
            ("wait_time", m.wait_time),
            ("poll_interval", m.poll_interval),
        ] {
            if value < 0.0 {
                return Err(format!("{name} must not be negative, got {value}"));
            }
        }

        if let Some(rate) = self.buffer.sampling_rate {
            if rate <= 0.0 {
                return Err(format!("sampling_rate must be positive, got {rate}"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn measurement_defaults() {
        let settings = MeasurementSettings::default();
        assert_eq!(settings.ramp_rate, 0.3);
        assert_eq!(settings.ramp_time, 5.0);
        assert_eq!(settings.setpoint_interval, 0.1);
        assert!(settings.include_gate_name);
    }

    #[test]
    fn seconds_clamps_negative_and_rejects_overflow() {
        assert_eq!(seconds("wait_time", -1.0).unwrap(), Duration::ZERO);
        assert_eq!(seconds("wait_time", 0.25).unwrap(), Duration::from_millis(250));
        assert!(matches!(
            seconds("wait_time", f64::INFINITY),
            Err(DaqError::Configuration(msg)) if msg.contains("wait_time")
        ));
        assert!(seconds("poll_interval", 1e300).is_err());
    }

    #[test]
    fn buffer_settings_accept_sample_rate_alias() {
        let settings =
            BufferSettings::from_json(json!({"sample_rate": 10.0, "burst_duration": 2.0}))
                .unwrap();
        assert_eq!(settings.sampling_rate, Some(10.0));
        assert_eq!(settings.burst_duration, Some(2.0));
    }

    #[test]
    fn buffer_settings_reject_unknown_keys() {
        let result = BufferSettings::from_json(json!({"num_points": 10, "colour": "red"}));
        assert!(result.is_err());
    }

    #[test]
    fn buffer_settings_parse_trigger_type() {
        let settings = BufferSettings::from_json(json!({"trigger_type": "hardware"})).unwrap();
        assert_eq!(settings.trigger_type, Some(TriggerType::Hardware));
        assert!("bogus".parse::<TriggerType>().is_err());
    }

    #[test]
    #[serial]
    fn load_from_file_with_env_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "Test"
log_level = "debug"

[measurement]
ramp_rate = 0.5

[buffer]
num_points = 50
"#
        )
        .unwrap();

        std::env::set_var("GATE_DAQ_MEASUREMENT__WAIT_TIME", "1.5");
        let config = EngineConfig::load_from(file.path()).unwrap();
        std::env::remove_var("GATE_DAQ_MEASUREMENT__WAIT_TIME");

        assert_eq!(config.application.name, "Test");
        assert_eq!(config.measurement.ramp_rate, 0.5);
        assert_eq!(config.measurement.wait_time, 1.5);
        assert_eq!(config.measurement.ramp_time, 5.0);
        assert_eq!(config.buffer.num_points, Some(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = EngineConfig::default();
        config.application.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_wait_time() {
        let mut config = EngineConfig::default();
        config.measurement.wait_time = -1.0;
        assert!(config.validate().is_err());
    }
}
