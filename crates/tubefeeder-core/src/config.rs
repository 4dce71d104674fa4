//! Feeder configuration
//!
//! Named values consumed by the core: roller and motor calibration, motion
//! limits and serial timing. Stored as JSON; every field has a default that
//! matches the reference hardware (NEMA 17, 1/16 microstepping, 10 mm roller).

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use crate::calibration::{CalibrationProfile, MotionLimits};
use crate::error::{FeederError, Result};

/// Default serial baud rate of the controller firmware
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Full feeder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FeederConfig {
    /// Mechanics used for mm/step conversions
    pub calibration: CalibrationSettings,
    /// Bounds checked before commands are sent
    pub motion: MotionSettings,
    /// Port speed and timing
    pub serial: SerialSettings,
}

/// Mechanical and driver parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// Drive roller diameter
    pub roller_diameter_mm: f64,
    /// Full steps per motor revolution
    pub motor_steps_per_rev: u32,
    /// Set by DIP switches on the stepper driver
    pub microsteps: u32,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            roller_diameter_mm: 10.0,
            motor_steps_per_rev: 200,
            microsteps: 16,
        }
    }
}

/// Speed, distance and position limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    /// Speed restored after speed checks
    pub default_speed_mm_s: f64,
    /// Slowest accepted speed
    pub min_speed_mm_s: f64,
    /// Fastest accepted speed
    pub max_speed_mm_s: f64,
    /// Informational; the firmware owns the ramp
    pub acceleration_mm_s2: f64,
    /// Longest single feed or retract
    pub max_feed_mm: f64,
    /// Lower end of the travel window
    pub soft_limit_min_mm: f64,
    /// Upper end of the travel window
    pub soft_limit_max_mm: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            default_speed_mm_s: 10.0,
            min_speed_mm_s: 0.5,
            max_speed_mm_s: 50.0,
            acceleration_mm_s2: 100.0,
            max_feed_mm: 1000.0,
            soft_limit_min_mm: -100.0,
            soft_limit_max_mm: 5000.0,
        }
    }
}

/// Serial link timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Must match the firmware
    pub baud_rate: u32,
    /// Read timeout of the underlying port
    pub read_timeout_ms: u64,
    /// Wait after opening the port while the controller reboots
    pub settle_ms: u64,
    /// Response window for commands that collect a reply
    pub command_timeout_ms: u64,
    /// Gap after the last received line that ends a response early
    pub quiet_interval_ms: u64,
    /// Upper bound on a single line write
    pub write_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 100,
            settle_ms: 2000,
            command_timeout_ms: 1000,
            quiet_interval_ms: 50,
            write_timeout_ms: 500,
        }
    }
}

impl SerialSettings {
    /// `read_timeout_ms` as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// `settle_ms` as a duration
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// `command_timeout_ms` as a duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// `quiet_interval_ms` as a duration
    pub fn quiet_interval(&self) -> Duration {
        Duration::from_millis(self.quiet_interval_ms)
    }

    /// `write_timeout_ms` as a duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(FeederError::InvalidConfiguration(
                "baud rate must be > 0".to_string(),
            ));
        }
        if self.read_timeout_ms == 0 || self.command_timeout_ms == 0 || self.write_timeout_ms == 0
        {
            return Err(FeederError::InvalidConfiguration(
                "serial timeouts must be > 0 ms".to_string(),
            ));
        }
        if self.quiet_interval_ms == 0 || self.quiet_interval_ms >= self.command_timeout_ms {
            return Err(FeederError::InvalidConfiguration(format!(
                "quiet interval ({} ms) must be > 0 and shorter than the command timeout ({} ms)",
                self.quiet_interval_ms, self.command_timeout_ms
            )));
        }
        Ok(())
    }
}

impl FeederConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: FeederConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| FeederError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    /// Serialize for saving
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check every invariant without keeping the derived values
    pub fn validate(&self) -> Result<()> {
        self.calibration_profile()?;
        self.motion_limits()?;
        self.serial.validate()
    }

    /// Build the validated calibration profile
    pub fn calibration_profile(&self) -> Result<CalibrationProfile> {
        CalibrationProfile::new(
            self.calibration.roller_diameter_mm,
            self.calibration.motor_steps_per_rev,
            self.calibration.microsteps,
        )
    }

    /// Build the validated motion limits
    pub fn motion_limits(&self) -> Result<MotionLimits> {
        let m = &self.motion;
        MotionLimits::new(
            m.default_speed_mm_s,
            m.min_speed_mm_s,
            m.max_speed_mm_s,
            m.acceleration_mm_s2,
            m.max_feed_mm,
            m.soft_limit_min_mm,
            m.soft_limit_max_mm,
        )
    }

    /// Human-readable configuration block, ending with the firmware constant line
    pub fn summary(&self) -> Result<String> {
        let profile = self.calibration_profile()?;
        let mut out = String::new();
        let _ = writeln!(out, "=== Tube Feeder Configuration ===");
        let _ = writeln!(out, "Roller diameter:  {} mm", profile.roller_diameter_mm());
        let _ = writeln!(out, "Microstepping:    1/{}", profile.microsteps());
        let _ = writeln!(out, "Steps per mm:     {:.2}", profile.steps_per_mm());
        let _ = writeln!(out, "Default speed:    {} mm/sec", self.motion.default_speed_mm_s);
        let _ = writeln!(out, "Max speed:        {} mm/sec", self.motion.max_speed_mm_s);
        let _ = writeln!(out, "Baudrate:         {}", self.serial.baud_rate);
        let _ = writeln!(out, "=================================");
        let _ = writeln!(out, "stepsPerMm = {:.2};", profile.steps_per_mm());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = FeederConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.calibration.microsteps, 16);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            FeederConfig::from_json_str(r#"{ "calibration": { "microsteps": 8 } }"#).unwrap();
        assert_eq!(config.calibration.microsteps, 8);
        assert_eq!(config.calibration.roller_diameter_mm, 10.0);
        assert_eq!(config.motion, MotionSettings::default());
    }

    #[test]
    fn test_invalid_values_rejected_on_load() {
        let err = FeederConfig::from_json_str(r#"{ "calibration": { "microsteps": 3 } }"#)
            .unwrap_err();
        assert!(matches!(err, FeederError::InvalidConfiguration(_)));

        let err = FeederConfig::from_json_str(r#"{ "serial": { "quiet_interval_ms": 2000 } }"#)
            .unwrap_err();
        assert!(matches!(err, FeederError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = FeederConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, FeederError::Config(_)));
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = FeederConfig::default();
        config.motion.max_feed_mm = 250.0;
        let json = config.to_json_pretty().unwrap();
        assert_eq!(FeederConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_summary_contains_firmware_constant() {
        let summary = FeederConfig::default().summary().unwrap();
        assert!(summary.contains("Steps per mm:     101.86"));
        assert!(summary.ends_with("stepsPerMm = 101.86;\n"));
    }
}
