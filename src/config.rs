//! Capture settings loaded with Figment.
//!
//! Settings come from a TOML or YAML file (picked by extension) and may be
//! overridden by environment variables prefixed with `RAILDAQ_`, nested keys
//! separated by a double underscore:
//!
//! ```text
//! RAILDAQ_APPLICATION__LOG_LEVEL=debug
//! RAILDAQ_CAPTURE__DURATION_US=2000000
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "bench"
//! log_level = "info"
//! output_dir = "captures"
//!
//! [capture]
//! frequency = 1000
//! duration_us = 5000000
//! trigger = "hw"
//!
//! [[devices]]
//! name = "VDDCORE"
//! type = "rail"
//! port = "/dev/ttyACM0"
//! rail_voltage = 1.2
//! efficiency = 0.85
//!
//! [[devices]]
//! name = "log"
//! type = "event_log"
//! port = "/dev/ttyACM1"
//! ```

use crate::capture::CapturePlan;
use crate::error::{AppResult, DaqError};
use crate::instrument::session::{ACQ_TIME_RANGE_US, VOLTAGE_RANGE_MV};
use crate::instrument::{SamplingRate, TriggerSource};
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RAILDAQ_";

/// Default baud rate of an instrument command channel.
pub const DEFAULT_RAIL_BAUD: u32 = 100_000;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[allow(missing_docs)]
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[allow(missing_docs)]
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for DaqError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::LoadError(e) => DaqError::ConfigLoad(e),
            ConfigError::ValidationError(reason) => DaqError::configuration("settings", reason),
        }
    }
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    #[allow(missing_docs)]
    pub application: ApplicationConfig,
    #[allow(missing_docs)]
    pub capture: CaptureConfig,
    /// Devices in declaration order.
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory receiving CSV output
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            output_dir: default_output_dir(),
        }
    }
}

/// Parameters shared by every device of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Sampling frequency, a number of Hz or `"<N>k"` with `N >= 1000`.
    pub frequency: SamplingRate,
    /// Capture length in microseconds.
    pub duration_us: u64,
    /// Wait for a command reply, milliseconds.
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_ms: u64,
    /// Give up on a stream that has not delivered after this many milliseconds.
    #[serde(default)]
    pub acquisition_deadline_ms: Option<u64>,
    /// Silence after which the event log is considered finished, milliseconds.
    #[serde(default = "default_log_idle_timeout")]
    pub log_idle_timeout_ms: u64,
    /// What starts the acquisition on every rail, `"hw"` or `"sw"`.
    #[serde(default = "default_trigger")]
    pub trigger: TriggerSource,
    /// Delay between trigger and first sample, milliseconds.
    #[serde(default)]
    pub trigger_delay_ms: u32,
}

/// What a configured port is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Power-measurement instrument on one rail.
    Rail,
    /// Event log printed by the target.
    EventLog,
}

/// One device of the capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique name; rail names drive power sequencing.
    pub name: String,
    #[allow(missing_docs)]
    pub r#type: DeviceKind,
    /// Serial port, e.g. `/dev/ttyACM0` or `COM5`.
    pub port: String,
    /// Overrides the per-kind default.
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Instrument output voltage, millivolts.
    #[serde(default = "default_supply_mv")]
    pub supply_mv: u32,
    /// Rail voltage used for the power conversion, volts.
    #[serde(default)]
    pub rail_voltage: f64,
    /// Supply-to-rail efficiency in `(0, 1]`.
    #[serde(default = "default_efficiency")]
    pub efficiency: f64,
    /// Whether this device is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl DeviceDefinition {
    /// Configured baud rate or the default of the device kind.
    pub fn baud(&self) -> u32 {
        self.baud_rate.unwrap_or(match self.r#type {
            DeviceKind::Rail => DEFAULT_RAIL_BAUD,
            DeviceKind::EventLog => crate::capture::event_log::DEFAULT_LOG_BAUD,
        })
    }
}

fn default_name() -> String {
    "rail_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_reply_timeout() -> u64 {
    1000
}

fn default_log_idle_timeout() -> u64 {
    2000
}

fn default_trigger() -> TriggerSource {
    TriggerSource::Hardware
}

fn default_supply_mv() -> u32 {
    3300
}

fn default_efficiency() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Settings {
    /// Load settings from `path` and the environment, then validate them.
    ///
    /// `.yaml`/`.yml` files are read as YAML, everything else as TOML.
    /// Environment variables take precedence over the file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let figment = if is_yaml {
            Figment::new().merge(Yaml::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        let settings: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check everything that can be checked without hardware.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log_level()?;

        if !ACQ_TIME_RANGE_US.contains(&self.capture.duration_us) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid duration_us {}. Must be within {:?}",
                self.capture.duration_us,
                ACQ_TIME_RANGE_US
            )));
        }
        if self.capture.reply_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reply_timeout_ms must be positive".to_string(),
            ));
        }

        let enabled: Vec<&DeviceDefinition> = self.enabled_devices().collect();
        if !enabled.iter().any(|d| d.r#type == DeviceKind::Rail) {
            return Err(ConfigError::ValidationError(
                "At least one enabled rail device is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for device in enabled {
            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device name: '{}'",
                    device.name
                )));
            }
            if device.port.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Device '{}' has no port",
                    device.name
                )));
            }
            if device.r#type == DeviceKind::Rail {
                Self::validate_rail(device)?;
            }
        }
        Ok(())
    }

    fn validate_rail(device: &DeviceDefinition) -> Result<(), ConfigError> {
        if !VOLTAGE_RANGE_MV.contains(&device.supply_mv) {
            return Err(ConfigError::ValidationError(format!(
                "Rail '{}': supply_mv {} outside {:?}",
                device.name, device.supply_mv, VOLTAGE_RANGE_MV
            )));
        }
        if device.rail_voltage.is_nan() || device.rail_voltage <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "Rail '{}': rail_voltage must be positive",
                device.name
            )));
        }
        if device.efficiency.is_nan() || device.efficiency <= 0.0 || device.efficiency > 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "Rail '{}': efficiency {} outside (0, 1]",
                device.name, device.efficiency
            )));
        }
        Ok(())
    }

    /// Devices with `enabled = true`, in declaration order.
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|d| d.enabled)
    }

    #[allow(missing_docs)]
    pub fn log_level(&self) -> Result<LevelFilter, ConfigError> {
        self.application.log_level.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: off, error, warn, info, debug, trace",
                self.application.log_level
            ))
        })
    }

    /// Capture plan described by the `[capture]` table.
    pub fn plan(&self) -> AppResult<CapturePlan> {
        CapturePlan::new(self.capture.frequency, self.capture.duration_us)
    }

    #[allow(missing_docs)]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.reply_timeout_ms)
    }

    #[allow(missing_docs)]
    pub fn acquisition_deadline(&self) -> Option<Duration> {
        self.capture.acquisition_deadline_ms.map(Duration::from_millis)
    }

    #[allow(missing_docs)]
    pub fn log_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.log_idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    const TOML: &str = r#"
        [application]
        log_level = "debug"

        [capture]
        frequency = 2000
        duration_us = 1000000

        [[devices]]
        name = "VDDCORE"
        type = "rail"
        port = "/dev/ttyACM0"
        rail_voltage = 1.2
        efficiency = 0.85

        [[devices]]
        name = "log"
        type = "event_log"
        port = "/dev/ttyACM1"
    "#;

    fn rail(name: &str) -> DeviceDefinition {
        DeviceDefinition {
            name: name.to_string(),
            r#type: DeviceKind::Rail,
            port: "COM3".to_string(),
            baud_rate: None,
            supply_mv: 3300,
            rail_voltage: 1.8,
            efficiency: 1.0,
            enabled: true,
        }
    }

    fn settings(devices: Vec<DeviceDefinition>) -> Settings {
        Settings {
            application: ApplicationConfig::default(),
            capture: CaptureConfig {
                frequency: SamplingRate::new(1_000).unwrap(),
                duration_us: 1_000_000,
                reply_timeout_ms: 1000,
                acquisition_deadline_ms: None,
                log_idle_timeout_ms: 2000,
                trigger: TriggerSource::Hardware,
                trigger_delay_ms: 0,
            },
            devices,
        }
    }

    #[test]
    fn test_load_toml_with_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file("rail.toml", TOML)?;
            let settings = Settings::load_from("rail.toml").map_err(|e| e.to_string())?;

            assert_eq!(settings.application.name, "rail_daq");
            assert_eq!(settings.log_level().map_err(|e| e.to_string())?, LevelFilter::Debug);
            assert_eq!(settings.capture.frequency.hz(), 2_000);
            assert_eq!(settings.plan().map_err(|e| e.to_string())?.samples(), 2_000);
            assert_eq!(settings.devices[0].baud(), DEFAULT_RAIL_BAUD);
            assert_eq!(settings.devices[0].supply_mv, 3300);
            assert_eq!(settings.devices[1].r#type, DeviceKind::EventLog);
            assert_eq!(settings.devices[1].baud(), 115_200);
            assert_eq!(settings.capture.trigger, TriggerSource::Hardware);
            assert_eq!(settings.capture.trigger_delay_ms, 0);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("rail.toml", TOML)?;
            jail.set_env("RAILDAQ_CAPTURE__DURATION_US", "250000");
            jail.set_env("RAILDAQ_APPLICATION__OUTPUT_DIR", "/tmp/captures");
            let settings = Settings::load_from("rail.toml").map_err(|e| e.to_string())?;

            assert_eq!(settings.capture.duration_us, 250_000);
            assert_eq!(settings.application.output_dir, PathBuf::from("/tmp/captures"));
            Ok(())
        });
    }

    #[test]
    fn test_load_yaml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "rail.yaml",
                r#"
capture:
  frequency: 100
  duration_us: 500000
  trigger: software
  trigger_delay_ms: 5
devices:
  - name: VDDIO
    type: rail
    port: COM4
    rail_voltage: 3.3
"#,
            )?;
            let settings = Settings::load_from("rail.yaml").map_err(|e| e.to_string())?;
            assert_eq!(settings.capture.frequency.hz(), 100);
            assert_eq!(settings.capture.trigger, TriggerSource::Software);
            assert_eq!(settings.capture.trigger_delay_ms, 5);
            assert_eq!(settings.devices[0].efficiency, 1.0);
            Ok(())
        });
    }

    #[test]
    fn test_invalid_rate_fails_to_load() {
        Jail::expect_with(|jail| {
            jail.create_file("rail.toml", &TOML.replace("frequency = 2000", "frequency = 15"))?;
            assert!(matches!(
                Settings::load_from("rail.toml"),
                Err(ConfigError::LoadError(_))
            ));
            Ok(())
        });
    }

    #[test]
    fn test_validation_rules() {
        assert!(settings(vec![rail("VDDIO")]).validate().is_ok());

        let result = settings(vec![rail("VDDIO"), rail("VDDIO")]).validate();
        assert!(result.unwrap_err().to_string().contains("Duplicate device name"));

        let mut weak = rail("VDDCORE");
        weak.efficiency = 1.5;
        assert!(settings(vec![weak]).validate().is_err());

        let mut low = rail("VDDCORE");
        low.supply_mv = 1200;
        assert!(settings(vec![low]).validate().is_err());

        let mut disabled = rail("VDDCORE");
        disabled.enabled = false;
        assert!(settings(vec![disabled]).validate().is_err());

        let mut short = settings(vec![rail("VDDIO")]);
        short.capture.duration_us = 50;
        assert!(short.validate().is_err());

        let mut noisy = settings(vec![rail("VDDIO")]);
        noisy.application.log_level = "loud".to_string();
        assert!(noisy
            .validate()
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_validation_error_maps_to_configuration() {
        let err: DaqError = ConfigError::ValidationError("bad".into()).into();
        assert!(err.is_configuration());
    }
}
