//! Calibration and Motion Limits
//!
//! Converts between physical units and controller steps:
//! - Roller circumference from the feed roller diameter
//! - Steps per millimetre from motor full steps and driver microstepping
//! - Speed and distance bounds used to validate commands before they are sent
//!
//! Step conversion is display-only. The controller owns the authoritative
//! step count.

use std::f64::consts::PI;
use std::fmt;

use crate::error::{FeederError, Result};

/// Microstep settings accepted by the stepper driver DIP switches
pub const VALID_MICROSTEPS: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Hardware parameters that determine the steps-per-mm factor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    roller_diameter_mm: f64,
    motor_steps_per_rev: u32,
    microsteps: u32,
}

impl CalibrationProfile {
    /// Create a validated profile
    ///
    /// # Errors
    /// `InvalidConfiguration` if the diameter is not a positive finite number,
    /// the motor has zero full steps, or `microsteps` is not in [`VALID_MICROSTEPS`].
    pub fn new(roller_diameter_mm: f64, motor_steps_per_rev: u32, microsteps: u32) -> Result<Self> {
        validate_diameter(roller_diameter_mm)?;
        validate_full_steps(motor_steps_per_rev)?;
        validate_microsteps(microsteps)?;
        Ok(Self {
            roller_diameter_mm,
            motor_steps_per_rev,
            microsteps,
        })
    }

    /// Roller diameter in mm
    pub fn roller_diameter_mm(&self) -> f64 {
        self.roller_diameter_mm
    }

    /// Full steps per revolution
    pub fn motor_steps_per_rev(&self) -> u32 {
        self.motor_steps_per_rev
    }

    /// Driver microstep divisor
    pub fn microsteps(&self) -> u32 {
        self.microsteps
    }

    /// Change the roller diameter; the profile is untouched on error
    pub fn set_roller_diameter_mm(&mut self, diameter_mm: f64) -> Result<()> {
        validate_diameter(diameter_mm)?;
        self.roller_diameter_mm = diameter_mm;
        Ok(())
    }

    /// Change the motor full steps per revolution; the profile is untouched on error
    pub fn set_motor_steps_per_rev(&mut self, steps: u32) -> Result<()> {
        validate_full_steps(steps)?;
        self.motor_steps_per_rev = steps;
        Ok(())
    }

    /// Change the microstep setting; the profile is untouched on error
    pub fn set_microsteps(&mut self, microsteps: u32) -> Result<()> {
        validate_microsteps(microsteps)?;
        self.microsteps = microsteps;
        Ok(())
    }

    /// Distance travelled by the tube per roller revolution
    pub fn circumference_mm(&self) -> f64 {
        PI * self.roller_diameter_mm
    }

    /// Microsteps per roller revolution
    pub fn steps_per_rev(&self) -> u64 {
        u64::from(self.motor_steps_per_rev) * u64::from(self.microsteps)
    }

    /// Conversion factor, recomputed from the current inputs on every call
    pub fn steps_per_mm(&self) -> f64 {
        self.steps_per_rev() as f64 / self.circumference_mm()
    }

    /// Resolution of a single step; also the round-trip error bound
    pub fn mm_per_step(&self) -> f64 {
        self.circumference_mm() / self.steps_per_rev() as f64
    }

    /// Convert a distance to steps, rounding to the nearest step (halves away from zero)
    pub fn mm_to_steps(&self, distance_mm: f64) -> i64 {
        (distance_mm * self.steps_per_mm()).round() as i64
    }

    /// Convert a step count back to millimetres (display only)
    pub fn steps_to_mm(&self, steps: i64) -> f64 {
        steps as f64 / self.steps_per_mm()
    }

    /// Convert a linear speed to a step rate (display only)
    pub fn steps_per_sec(&self, speed_mm_s: f64) -> f64 {
        speed_mm_s * self.steps_per_mm()
    }
}

impl fmt::Display for CalibrationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} mm roller, {} steps/rev, 1/{} microstepping ({:.2} steps/mm)",
            self.roller_diameter_mm,
            self.motor_steps_per_rev,
            self.microsteps,
            self.steps_per_mm()
        )
    }
}

fn validate_diameter(diameter_mm: f64) -> Result<()> {
    if !diameter_mm.is_finite() || diameter_mm <= 0.0 {
        return Err(FeederError::InvalidConfiguration(format!(
            "roller diameter must be > 0 mm, got {}",
            diameter_mm
        )));
    }
    Ok(())
}

fn validate_full_steps(steps: u32) -> Result<()> {
    if steps == 0 {
        return Err(FeederError::InvalidConfiguration(
            "motor full steps per revolution must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_microsteps(microsteps: u32) -> Result<()> {
    if !VALID_MICROSTEPS.contains(&microsteps) {
        return Err(FeederError::InvalidConfiguration(format!(
            "microsteps must be one of {:?}, got {}",
            VALID_MICROSTEPS, microsteps
        )));
    }
    Ok(())
}

/// Speed, distance and position bounds enforced before a command is encoded
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionLimits {
    default_speed_mm_s: f64,
    min_speed_mm_s: f64,
    max_speed_mm_s: f64,
    /// Carried for completeness; motion logic does not use it
    acceleration_mm_s2: f64,
    max_feed_mm: f64,
    soft_limit_min_mm: f64,
    soft_limit_max_mm: f64,
}

impl MotionLimits {
    /// Create validated limits
    ///
    /// Requires `0 < min <= default <= max`, `max_feed_mm > 0`,
    /// `soft_limit_min <= 0 <= soft_limit_max` and finite values throughout.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        default_speed_mm_s: f64,
        min_speed_mm_s: f64,
        max_speed_mm_s: f64,
        acceleration_mm_s2: f64,
        max_feed_mm: f64,
        soft_limit_min_mm: f64,
        soft_limit_max_mm: f64,
    ) -> Result<Self> {
        let values = [
            default_speed_mm_s,
            min_speed_mm_s,
            max_speed_mm_s,
            acceleration_mm_s2,
            max_feed_mm,
            soft_limit_min_mm,
            soft_limit_max_mm,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(FeederError::InvalidConfiguration(
                "motion limits must be finite numbers".to_string(),
            ));
        }
        if min_speed_mm_s <= 0.0 {
            return Err(FeederError::InvalidConfiguration(format!(
                "minimum speed must be > 0 mm/s, got {}",
                min_speed_mm_s
            )));
        }
        if !(min_speed_mm_s <= default_speed_mm_s && default_speed_mm_s <= max_speed_mm_s) {
            return Err(FeederError::InvalidConfiguration(format!(
                "speeds must satisfy min <= default <= max, got {} / {} / {}",
                min_speed_mm_s, default_speed_mm_s, max_speed_mm_s
            )));
        }
        if acceleration_mm_s2 < 0.0 {
            return Err(FeederError::InvalidConfiguration(
                "acceleration must not be negative".to_string(),
            ));
        }
        if max_feed_mm <= 0.0 {
            return Err(FeederError::InvalidConfiguration(format!(
                "maximum feed distance must be > 0 mm, got {}",
                max_feed_mm
            )));
        }
        if !(soft_limit_min_mm <= 0.0 && 0.0 <= soft_limit_max_mm) {
            return Err(FeederError::InvalidConfiguration(format!(
                "soft limits must bracket zero, got [{}, {}]",
                soft_limit_min_mm, soft_limit_max_mm
            )));
        }

        Ok(Self {
            default_speed_mm_s,
            min_speed_mm_s,
            max_speed_mm_s,
            acceleration_mm_s2,
            max_feed_mm,
            soft_limit_min_mm,
            soft_limit_max_mm,
        })
    }

    /// Speed restored after a speed change test
    pub fn default_speed_mm_s(&self) -> f64 {
        self.default_speed_mm_s
    }

    /// Lower bound for `check_speed`
    pub fn min_speed_mm_s(&self) -> f64 {
        self.min_speed_mm_s
    }

    /// Upper bound for `check_speed`
    pub fn max_speed_mm_s(&self) -> f64 {
        self.max_speed_mm_s
    }

    /// Informational only
    pub fn acceleration_mm_s2(&self) -> f64 {
        self.acceleration_mm_s2
    }

    /// Longest single feed or retract
    pub fn max_feed_mm(&self) -> f64 {
        self.max_feed_mm
    }

    /// Lower end of the travel window
    pub fn soft_limit_min_mm(&self) -> f64 {
        self.soft_limit_min_mm
    }

    /// Upper end of the travel window
    pub fn soft_limit_max_mm(&self) -> f64 {
        self.soft_limit_max_mm
    }

    /// Feed distance must be in (0, max_feed_mm]
    pub fn check_feed(&self, mm: f64) -> Result<()> {
        if !mm.is_finite() || mm <= 0.0 || mm > self.max_feed_mm {
            return Err(FeederError::OutOfRange {
                quantity: "feed distance (mm)",
                value: mm,
                min: 0.0,
                max: self.max_feed_mm,
            });
        }
        Ok(())
    }

    /// Retract distance only has to be positive
    pub fn check_retract(&self, mm: f64) -> Result<()> {
        if !mm.is_finite() || mm <= 0.0 {
            return Err(FeederError::OutOfRange {
                quantity: "retract distance (mm)",
                value: mm,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        Ok(())
    }

    /// Speeds outside [min, max] are rejected, never clamped
    pub fn check_speed(&self, mm_s: f64) -> Result<()> {
        if !mm_s.is_finite() || mm_s < self.min_speed_mm_s || mm_s > self.max_speed_mm_s {
            return Err(FeederError::OutOfRange {
                quantity: "speed (mm/s)",
                value: mm_s,
                min: self.min_speed_mm_s,
                max: self.max_speed_mm_s,
            });
        }
        Ok(())
    }

    /// Whether a position lies inside the software travel window
    pub fn within_soft_limits(&self, position_mm: f64) -> bool {
        position_mm >= self.soft_limit_min_mm && position_mm <= self.soft_limit_max_mm
    }
}
