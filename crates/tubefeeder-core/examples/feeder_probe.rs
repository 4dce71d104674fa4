//! Tube Feeder Bench Probe
//!
//! Lists serial ports, connects to the feeder controller and runs the bench
//! diagnostics. The motor WILL move during the jog and distance checks.
//!
//! Usage:
//!   cargo run --example feeder_probe -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: auto-detect)
//!   --config FILE     JSON configuration file
//!   --baud RATE       Baud rate (default: 115200)
//!   --distance MM     Distance for the feed/retract check (default: 50)
//!   --list            Only list serial ports
//!   --status          Only query status, no motion

use anyhow::{bail, Context};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tubefeeder_core::diagnostics::{self, DiagnosticPlan};
use tubefeeder_core::discovery::{DeviceKind, PortDescriptor};
use tubefeeder_core::prelude::*;

struct Options {
    port: Option<String>,
    config: Option<String>,
    baud_rate: Option<u32>,
    distance_mm: f64,
    list_only: bool,
    status_only: bool,
}

fn parse_args() -> anyhow::Result<Option<Options>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = Options {
        port: None,
        config: None,
        baud_rate: None,
        distance_mm: 50.0,
        list_only: false,
        status_only: false,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" | "-p" => options.port = Some(args.next().context("--port needs a value")?),
            "--config" | "-c" => {
                options.config = Some(args.next().context("--config needs a value")?)
            }
            "--baud" | "-b" => {
                let value = args.next().context("--baud needs a value")?;
                options.baud_rate = Some(value.parse().context("invalid baud rate")?);
            }
            "--distance" | "-d" => {
                let value = args.next().context("--distance needs a value")?;
                options.distance_mm = value.parse().context("invalid distance")?;
            }
            "--list" => options.list_only = true,
            "--status" => options.status_only = true,
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            other => bail!("unknown option: {}", other),
        }
    }
    Ok(Some(options))
}

fn print_help() {
    println!("Tube Feeder Bench Probe");
    println!();
    println!("Usage: cargo run --example feeder_probe -- [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --port, -p PORT       Serial port (default: auto-detect)");
    println!("  --config, -c FILE     JSON configuration file");
    println!("  --baud, -b RATE       Baud rate (default: 115200)");
    println!("  --distance, -d MM     Distance for the feed/retract check (default: 50)");
    println!("  --list                Only list serial ports");
    println!("  --status              Only query status, no motion");
}

fn describe(port: &PortDescriptor) -> String {
    let kind = match port.kind() {
        DeviceKind::Controller => "controller",
        DeviceKind::ConflictingController => "other board (skipped)",
        DeviceKind::Unknown => "unknown",
    };
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(
            "{:<16} {:04X}:{:04X}  {:<22} {}",
            port.path, vid, pid, kind, port.description
        ),
        _ => format!("{:<16} {:>9}  {:<22} {}", port.path, "-", kind, port.description),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    let mut config = match &options.config {
        Some(path) => FeederConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => FeederConfig::default(),
    };
    if let Some(baud_rate) = options.baud_rate {
        config.serial.baud_rate = baud_rate;
    }
    print!("{}", config.summary()?);
    println!();

    let controller = FeederController::new(config)?;

    println!("Serial ports:");
    let ports = controller.discover();
    if ports.is_empty() {
        println!("  (none)");
    }
    for port in &ports {
        println!("  {}", describe(port));
    }
    println!();
    if options.list_only {
        return Ok(());
    }

    let target = match options.port {
        Some(path) => Some(
            ports
                .into_iter()
                .find(|p| p.path == path)
                .unwrap_or_else(|| PortDescriptor::from_path(path)),
        ),
        None => None,
    };

    controller
        .connect(target)
        .await
        .context("connecting to the feeder controller")?;
    if let Some(port) = controller.port() {
        println!("Connected to {}", port.path);
    }

    if options.status_only {
        let status = controller.get_status().await?;
        for line in &status.lines {
            println!("  {}", line);
        }
    } else {
        let plan = DiagnosticPlan {
            distance_mm: options.distance_mm,
            ..DiagnosticPlan::default()
        };
        let report = diagnostics::run_all(&controller, &plan).await;
        println!("{}", report);
    }

    // Leave the motor stopped whatever happened above
    if let Err(e) = controller.stop().await {
        eprintln!("STOP failed: {}", e);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    controller.disconnect().await;
    Ok(())
}
