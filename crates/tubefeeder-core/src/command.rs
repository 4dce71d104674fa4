//! Controller commands
//!
//! Wire encoding of the feeder's line protocol. Commands are case-sensitive
//! ASCII; distances are in mm and speeds in mm/s, both interpreted by the
//! firmware.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::calibration::MotionLimits;
use crate::error::Result;

/// Jog direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JogDirection {
    /// Feed direction ('J+')
    Forward,
    /// Retract direction ('J-')
    Reverse,
}

/// Protocol commands understood by the controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Feed forward by a distance ('F' command)
    Feed(f64),

    /// Retract by a distance ('R' command)
    Retract(f64),

    /// Set feed speed in mm/s ('S' command)
    SetSpeed(f64),

    /// Continuous motion until `Stop` ('J+' / 'J-')
    Jog(JogDirection),

    /// Stop all motion
    Stop,

    /// Zero the controller's position reference
    Home,

    /// Query current position
    GetPosition,

    /// Query the status block ('?')
    GetStatus,
}

impl Command {
    /// Encode as a wire line (without terminator)
    pub fn wire(&self) -> String {
        match self {
            Command::Feed(mm) => format!("F{}", mm),
            Command::Retract(mm) => format!("R{}", mm),
            Command::SetSpeed(mm_s) => format!("S{}", mm_s),
            Command::Jog(JogDirection::Forward) => "J+".to_string(),
            Command::Jog(JogDirection::Reverse) => "J-".to_string(),
            Command::Stop => "STOP".to_string(),
            Command::Home => "HOME".to_string(),
            Command::GetPosition => "POS".to_string(),
            Command::GetStatus => "?".to_string(),
        }
    }

    /// Recognise a wire line; unknown or malformed text yields `None`
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        match text {
            "J+" => return Some(Command::Jog(JogDirection::Forward)),
            "J-" => return Some(Command::Jog(JogDirection::Reverse)),
            "STOP" => return Some(Command::Stop),
            "HOME" => return Some(Command::Home),
            "POS" => return Some(Command::GetPosition),
            "?" => return Some(Command::GetStatus),
            _ => {}
        }

        let mut chars = text.chars();
        let op = chars.next()?;
        let value: f64 = chars.as_str().trim().parse().ok()?;
        match op {
            'F' => Some(Command::Feed(value)),
            'R' => Some(Command::Retract(value)),
            'S' => Some(Command::SetSpeed(value)),
            _ => None,
        }
    }

    /// Check distance and speed arguments against the motion limits
    pub fn validate(&self, limits: &MotionLimits) -> Result<()> {
        match *self {
            Command::Feed(mm) => limits.check_feed(mm),
            Command::Retract(mm) => limits.check_retract(mm),
            Command::SetSpeed(mm_s) => limits.check_speed(mm_s),
            _ => Ok(()),
        }
    }

    /// Check if this command's reply is collected synchronously
    ///
    /// Jog and stop are fire-and-forget: the controller writes them and
    /// returns without opening a reply window.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Command::Jog(_) | Command::Stop)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire())
    }
}
