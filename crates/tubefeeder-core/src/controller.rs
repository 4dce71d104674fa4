//! Feeder controller
//!
//! High-level operations on top of the transport and correlator: validate
//! physical arguments, encode them, and classify the reply.
//!
//! Every method takes `&self`. Share the controller through an `Arc` so a
//! safety `stop()` can be issued from another task while a reply is being
//! collected; STOP only waits for an in-flight write, never for a reply.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationProfile, MotionLimits};
use crate::command::{Command, JogDirection};
use crate::config::FeederConfig;
use crate::correlator::{PendingCommand, ResponseCorrelator};
use crate::discovery::{find_target, PortDescriptor};
use crate::error::{FeederError, Result};
use crate::response::{classify_ack, parse_position, Ack, StatusReport};
use crate::transport::{ConnectionState, NativeSerial, SerialBackend, Transport};

/// Tube feeder controller connection
pub struct FeederController {
    config: FeederConfig,
    calibration: CalibrationProfile,
    limits: MotionLimits,
    transport: Transport,
    correlator: ResponseCorrelator,
}

impl FeederController {
    /// Create a controller for real serial hardware (not yet connected)
    pub fn new(config: FeederConfig) -> Result<Self> {
        Self::with_backend(config, Arc::new(NativeSerial))
    }

    /// Create a controller over any serial backend
    pub fn with_backend(config: FeederConfig, backend: Arc<dyn SerialBackend>) -> Result<Self> {
        config.validate()?;
        let calibration = config.calibration_profile()?;
        let limits = config.motion_limits()?;
        debug!("calibration: {}", calibration);

        Ok(Self {
            transport: Transport::new(config.serial.clone(), backend),
            correlator: ResponseCorrelator::new(config.serial.quiet_interval()),
            config,
            calibration,
            limits,
        })
    }

    /// Configuration the controller was built from
    pub fn config(&self) -> &FeederConfig {
        &self.config
    }

    /// Mechanical calibration, for display
    pub fn calibration(&self) -> &CalibrationProfile {
        &self.calibration
    }

    /// Bounds applied to distances and speeds before they are sent
    pub fn limits(&self) -> &MotionLimits {
        &self.limits
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    /// Shorthand for `state() == Connected`
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Port of the current connection
    pub fn port(&self) -> Option<PortDescriptor> {
        self.transport.port()
    }

    /// List attached serial ports
    pub fn discover(&self) -> Vec<PortDescriptor> {
        self.transport.backend().enumerate()
    }

    /// The port `connect(None)` would pick
    pub fn find_target(&self) -> Option<PortDescriptor> {
        find_target(&self.discover())
    }

    /// Connect to `target`, or to the discovered controller when `None`
    pub async fn connect(&self, target: Option<PortDescriptor>) -> Result<()> {
        let link = self.transport.open(target).await?;
        self.correlator.attach(link).await;
        Ok(())
    }

    /// Disconnect; any reply being collected ends immediately
    pub async fn disconnect(&self) {
        self.transport.close().await;
        self.correlator.detach().await;
    }

    fn check_text(&self, text: &str) -> Result<()> {
        if let Some(command) = Command::parse(text) {
            command.validate(&self.limits)?;
        }
        Ok(())
    }

    /// Write a command without waiting for a reply
    ///
    /// Does not take the inbound queue, so it is never held up by a
    /// collection in progress.
    pub async fn send(&self, text: &str) -> Result<()> {
        self.check_text(text)?;
        if !self.transport.is_connected() {
            return Err(FeederError::NotConnected);
        }
        self.transport.write_line(text).await?;
        debug!(">> {}", text);
        Ok(())
    }

    /// Write a command and collect the lines that answer it
    ///
    /// Lines queued before the write are discarded first. Returns an empty
    /// vector when nothing arrives within `timeout`; the caller decides
    /// whether that is an error. Callers must not overlap collections; the
    /// second one waits for the first.
    pub async fn send_and_collect(&self, text: &str, timeout: Duration) -> Result<Vec<String>> {
        self.check_text(text)?;
        if !self.transport.is_connected() {
            return Err(FeederError::NotConnected);
        }

        let mut inbound = self.correlator.acquire().await?;
        let stale = inbound.drain();
        if stale > 0 {
            debug!("dropped {} stale line(s) before '{}'", stale, text);
        }

        self.transport.write_line(text).await?;
        debug!(">> {}", text);
        let pending = PendingCommand::new(text, timeout);
        Ok(inbound.collect(pending).await)
    }

    /// Run a typed command
    ///
    /// Commands that expect a reply are collected with the configured command
    /// timeout. Fire-and-forget commands (jog, stop) return an empty vector as
    /// soon as the line is written.
    pub async fn execute(&self, command: Command) -> Result<Vec<String>> {
        command.validate(&self.limits)?;
        let text = command.wire();
        if command.expects_response() {
            self.send_and_collect(&text, self.config.serial.command_timeout())
                .await
        } else {
            self.send(&text).await?;
            Ok(Vec::new())
        }
    }

    async fn acknowledged(&self, command: Command) -> Result<Ack> {
        let lines = self.execute(command).await?;
        match classify_ack(&lines) {
            Ack::Rejected(reply) => Err(FeederError::DeviceRejected {
                command: command.wire(),
                reply,
            }),
            ack => Ok(ack),
        }
    }

    /// Feed forward by `mm`, which must be in (0, max_feed_mm]
    pub async fn feed(&self, mm: f64) -> Result<Ack> {
        self.acknowledged(Command::Feed(mm)).await
    }

    /// Retract by `mm`, which must be positive
    pub async fn retract(&self, mm: f64) -> Result<Ack> {
        self.acknowledged(Command::Retract(mm)).await
    }

    /// Set feed speed; out-of-range speeds are rejected, not clamped
    pub async fn set_speed(&self, mm_per_sec: f64) -> Result<Ack> {
        let ack = self.acknowledged(Command::SetSpeed(mm_per_sec)).await?;
        debug!(
            "speed {} mm/s = {:.0} steps/s",
            mm_per_sec,
            self.calibration.steps_per_sec(mm_per_sec)
        );
        Ok(ack)
    }

    /// Zero the controller's position reference
    pub async fn home(&self) -> Result<Ack> {
        self.acknowledged(Command::Home).await
    }

    /// Start continuous motion; runs until `stop()`
    pub async fn jog(&self, direction: JogDirection) -> Result<()> {
        self.execute(Command::Jog(direction)).await?;
        Ok(())
    }

    /// Jog in the feed direction
    pub async fn jog_forward(&self) -> Result<()> {
        self.jog(JogDirection::Forward).await
    }

    /// Jog in the retract direction
    pub async fn jog_reverse(&self) -> Result<()> {
        self.jog(JogDirection::Reverse).await
    }

    /// Stop all motion, bypassing any reply being collected
    pub async fn stop(&self) -> Result<()> {
        self.execute(Command::Stop).await?;
        Ok(())
    }

    /// Query the controller's position in mm
    pub async fn get_position(&self) -> Result<f64> {
        let command = Command::GetPosition;
        let lines = self.execute(command).await?;
        if lines.is_empty() {
            return Err(self.timeout_error(command));
        }
        if let Ack::Rejected(reply) = classify_ack(&lines) {
            return Err(FeederError::DeviceRejected {
                command: command.wire(),
                reply,
            });
        }
        let position = parse_position(&lines).ok_or_else(|| FeederError::InvalidResponse {
            command: command.wire(),
            reply: lines,
        })?;
        if !self.limits.within_soft_limits(position) {
            warn!("position {:.2} mm is outside the soft limits", position);
        }
        Ok(position)
    }

    /// Query the status block
    pub async fn get_status(&self) -> Result<StatusReport> {
        let command = Command::GetStatus;
        let lines = self.execute(command).await?;
        if lines.is_empty() {
            return Err(self.timeout_error(command));
        }
        let report = StatusReport::parse(&lines);
        if report.alive {
            info!("controller status: {} line(s)", report.lines.len());
        }
        Ok(report)
    }

    fn timeout_error(&self, command: Command) -> FeederError {
        FeederError::Timeout {
            command: command.wire(),
            waited: self.config.serial.command_timeout(),
        }
    }
}

impl Drop for FeederController {
    fn drop(&mut self) {
        self.transport.abort();
        self.correlator.abort();
    }
}
