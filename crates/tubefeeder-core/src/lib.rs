//! # Tube Feeder Core Library
//!
//! Device communication and motion control for the single-axis tube feeder.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Calibration between millimetres and controller steps
//! - Serial port discovery for the controller board
//! - Connection lifecycle with reset settling and serialized line writes
//! - Correlation of untagged line replies with the command that caused them
//! - Validated feed, retract, speed, jog, stop, home and query operations
//! - Scripted bench diagnostics
//!
//! ## Example
//!
//! ```rust,ignore
//! use tubefeeder_core::prelude::*;
//!
//! let controller = FeederController::new(FeederConfig::default())?;
//! controller.connect(None).await?;
//!
//! controller.set_speed(10.0).await?;
//! controller.feed(100.0).await?;
//! println!("position: {} mm", controller.get_position().await?);
//! controller.stop().await?;
//! ```

pub mod calibration;
pub mod command;
pub mod config;
pub mod controller;
pub mod correlator;
pub mod diagnostics;
pub mod discovery;
pub mod error;
pub mod response;
pub mod transport;

pub use error::{FeederError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::calibration::{CalibrationProfile, MotionLimits};
    pub use crate::command::{Command, JogDirection};
    pub use crate::config::FeederConfig;
    pub use crate::controller::FeederController;
    pub use crate::diagnostics::{DiagnosticPlan, DiagnosticReport};
    pub use crate::discovery::{find_target, PortDescriptor};
    pub use crate::error::{FeederError, Result};
    pub use crate::response::{Ack, StatusReport};
    pub use crate::transport::ConnectionState;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
