//! Automated bench checks
//!
//! Scripted checks for bringing up a feeder: serial link, jog, speed changes
//! and a feed/retract distance cycle. Checks that need a human watching the
//! hardware (direction, voltages) are not covered here.

use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::command::{Command, JogDirection};
use crate::controller::FeederController;
use crate::error::FeederError;
use crate::response::is_jogging;

/// Speeds used for the slow/fast speed check, in mm/s
pub const SPEED_CHECK_SLOW: f64 = 5.0;
/// Fast end of the speed check, in mm/s
pub const SPEED_CHECK_FAST: f64 = 30.0;

/// Checks in the order `run_all` runs them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCheck {
    /// Status query answered
    Connection,
    /// Jog start confirmed and stopped
    Jog,
    /// Speed changes accepted
    Speed,
    /// Feed and retract move the reported position
    Distance,
}

impl fmt::Display for DiagnosticCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticCheck::Connection => "connection",
            DiagnosticCheck::Jog => "motor_jog",
            DiagnosticCheck::Speed => "speed",
            DiagnosticCheck::Distance => "distance",
        };
        f.write_str(name)
    }
}

/// Result of a single check
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Worked as expected
    Pass(String),
    /// Worked, but without the expected confirmation
    Warn(String),
    /// Did not work; the detail says why
    Fail(String),
    /// Not run because the link check failed
    Skipped,
}

impl Verdict {
    /// Pass or Warn
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass(_) | Verdict::Warn(_))
    }
}

/// Outcome of a diagnostic run
#[derive(Debug, Clone, Default)]
pub struct DiagnosticReport {
    /// One entry per check, in run order
    pub results: Vec<(DiagnosticCheck, Verdict)>,
}

impl DiagnosticReport {
    /// Verdict for `check`, if it was recorded
    pub fn verdict(&self, check: DiagnosticCheck) -> Option<&Verdict> {
        self.results
            .iter()
            .find(|(c, _)| *c == check)
            .map(|(_, v)| v)
    }

    /// Checks that passed or warned
    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|(_, v)| v.passed()).count()
    }

    /// Checks that actually ran
    pub fn total_count(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, v)| *v != Verdict::Skipped)
            .count()
    }

    /// Every check that ran passed
    pub fn all_passed(&self) -> bool {
        self.passed_count() == self.total_count()
    }
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TEST SUMMARY")?;
        for (check, verdict) in &self.results {
            let (tag, detail) = match verdict {
                Verdict::Pass(d) => ("[PASS]", d.as_str()),
                Verdict::Warn(d) => ("[WARN]", d.as_str()),
                Verdict::Fail(d) => ("[FAIL]", d.as_str()),
                Verdict::Skipped => ("[SKIP]", ""),
            };
            if detail.is_empty() {
                writeln!(f, "  {} {}", tag, check)?;
            } else {
                writeln!(f, "  {} {} - {}", tag, check, detail)?;
            }
        }
        write!(f, "Passed: {}/{}", self.passed_count(), self.total_count())
    }
}

fn failure(err: FeederError) -> Verdict {
    if err.is_fatal_to_connection() {
        warn!("link lost during check: {}", err);
    }
    Verdict::Fail(err.to_string())
}

/// `?` must be answered with the status marker
pub async fn check_connection(controller: &FeederController) -> Verdict {
    match controller.get_status().await {
        Ok(report) if report.alive => Verdict::Pass("serial communication working".to_string()),
        Ok(report) => Verdict::Fail(format!(
            "no status marker in reply: {:?}",
            report.lines
        )),
        Err(e) => failure(e),
    }
}

/// Jog forward for `run_for`, then stop
///
/// The jog start is collected so the `JOGGING` confirmation can be checked;
/// STOP is always sent, even when the start failed.
pub async fn check_jog(controller: &FeederController, run_for: Duration) -> Verdict {
    let timeout = controller.config().serial.command_timeout();
    let started = controller
        .send_and_collect(&Command::Jog(JogDirection::Forward).wire(), timeout)
        .await;

    if started.is_ok() {
        tokio::time::sleep(run_for).await;
    }
    let stopped = controller.stop().await;

    match (started, stopped) {
        (Err(e), _) | (Ok(_), Err(e)) => failure(e),
        (Ok(lines), Ok(())) if is_jogging(&lines) => Verdict::Pass("jog confirmed".to_string()),
        (Ok(_), Ok(())) => {
            warn!("no jog confirmation received");
            Verdict::Warn("no jog confirmation received".to_string())
        }
    }
}

/// Slow and fast speeds must be accepted; the default speed is restored afterwards
pub async fn check_speed_change(controller: &FeederController) -> Verdict {
    let default_speed = controller.limits().default_speed_mm_s();
    let limits = controller.limits();
    let mut steps = Vec::new();
    for speed in [SPEED_CHECK_SLOW, SPEED_CHECK_FAST] {
        if limits.check_speed(speed).is_ok() {
            steps.push(speed);
        }
    }
    steps.push(default_speed);

    for speed in steps {
        if let Err(e) = controller.set_speed(speed).await {
            let _ = controller.set_speed(default_speed).await;
            return failure(e);
        }
    }
    Verdict::Pass("speed changes accepted".to_string())
}

/// Home, feed `distance_mm`, read the position, retract, read it again
pub async fn check_distance(
    controller: &FeederController,
    distance_mm: f64,
    move_time: Duration,
) -> Verdict {
    let result = async {
        controller.home().await?;
        controller.feed(distance_mm).await?;
        tokio::time::sleep(move_time).await;
        let after_feed = controller.get_position().await?;
        controller.retract(distance_mm).await?;
        tokio::time::sleep(move_time).await;
        let after_retract = controller.get_position().await?;
        Ok::<_, FeederError>((after_feed, after_retract))
    }
    .await;

    match result {
        Ok((after_feed, after_retract)) => Verdict::Pass(format!(
            "position after feed {:.2} mm, after retract {:.2} mm",
            after_feed, after_retract
        )),
        Err(e) => failure(e),
    }
}

/// Settings for [`run_all`]
#[derive(Debug, Clone)]
pub struct DiagnosticPlan {
    /// How long the jog check runs the motor
    pub jog_time: Duration,
    /// Feed and retract distance
    pub distance_mm: f64,
    /// Wait after each move before reading the position
    pub move_time: Duration,
}

impl Default for DiagnosticPlan {
    fn default() -> Self {
        Self {
            jog_time: Duration::from_secs(1),
            distance_mm: 50.0,
            move_time: Duration::from_secs(3),
        }
    }
}

/// Run every check; motion checks are skipped when the link check fails
pub async fn run_all(controller: &FeederController, plan: &DiagnosticPlan) -> DiagnosticReport {
    let mut report = DiagnosticReport::default();

    let connection = check_connection(controller).await;
    let link_ok = connection.passed();
    report.results.push((DiagnosticCheck::Connection, connection));

    if link_ok {
        report
            .results
            .push((DiagnosticCheck::Jog, check_jog(controller, plan.jog_time).await));
        report
            .results
            .push((DiagnosticCheck::Speed, check_speed_change(controller).await));
        report.results.push((
            DiagnosticCheck::Distance,
            check_distance(controller, plan.distance_mm, plan.move_time).await,
        ));
    } else {
        for check in [DiagnosticCheck::Jog, DiagnosticCheck::Speed, DiagnosticCheck::Distance] {
            report.results.push((check, Verdict::Skipped));
        }
    }

    info!(
        "diagnostics: {}/{} passed",
        report.passed_count(),
        report.total_count()
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_only_checks_that_ran() {
        let report = DiagnosticReport {
            results: vec![
                (DiagnosticCheck::Connection, Verdict::Pass("ok".into())),
                (DiagnosticCheck::Jog, Verdict::Warn("quiet".into())),
                (DiagnosticCheck::Speed, Verdict::Fail("rejected".into())),
                (DiagnosticCheck::Distance, Verdict::Skipped),
            ],
        };
        assert_eq!(report.passed_count(), 2);
        assert_eq!(report.total_count(), 3);
        assert!(!report.all_passed());
        assert_eq!(
            report.verdict(DiagnosticCheck::Speed),
            Some(&Verdict::Fail("rejected".into()))
        );
    }

    #[test]
    fn test_report_summary() {
        let report = DiagnosticReport {
            results: vec![
                (DiagnosticCheck::Connection, Verdict::Pass("ok".into())),
                (DiagnosticCheck::Jog, Verdict::Skipped),
            ],
        };
        let text = report.to_string();
        assert!(text.contains("[PASS] connection - ok"));
        assert!(text.contains("[SKIP] motor_jog"));
        assert!(text.ends_with("Passed: 1/1"));
    }
}
