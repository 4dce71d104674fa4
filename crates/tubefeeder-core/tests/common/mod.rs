//! Simulated feeder controller for integration tests
//!
//! Mimics the firmware's line protocol over an in-memory duplex pipe: prints
//! a boot banner when the port opens, tracks position and speed, and answers
//! each command after a configurable delay.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::Notify;
use tokio::time::Instant;
use tubefeeder_core::config::{FeederConfig, SerialSettings};
use tubefeeder_core::controller::FeederController;
use tubefeeder_core::discovery::{PortDescriptor, CONFLICTING_PID, CONFLICTING_VID};
use tubefeeder_core::error::{FeederError, Result};
use tubefeeder_core::transport::{DynSerial, SerialBackend};

pub const CONTROLLER_PATH: &str = "/dev/ttyACM1";

type DeviceWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

/// Firmware behaviour
#[derive(Debug, Clone)]
pub struct Firmware {
    pub banner: Vec<String>,
    pub reply_delay: Duration,
    /// Commands the firmware never answers
    pub silent: HashSet<String>,
    /// Commands answered with an error line
    pub reject: HashSet<String>,
    /// Raw bytes sent instead of the normal reply
    pub raw_replies: HashMap<String, Vec<u8>>,
    pub position_mm: f64,
    pub speed_mm_s: f64,
}

impl Default for Firmware {
    fn default() -> Self {
        Self {
            banner: vec![
                "Tube Feeder Controller v1.0".to_string(),
                "Steps/mm: 101.86".to_string(),
                "Ready".to_string(),
            ],
            reply_delay: Duration::from_millis(5),
            silent: HashSet::new(),
            reject: HashSet::new(),
            raw_replies: HashMap::new(),
            position_mm: 0.0,
            speed_mm_s: 10.0,
        }
    }
}

impl Firmware {
    fn respond(&mut self, line: &str) -> Vec<String> {
        if self.silent.contains(line) {
            return Vec::new();
        }
        if self.reject.contains(line) {
            return vec![format!("ERROR: rejected {}", line)];
        }
        let number = |s: &str| s[1..].parse::<f64>().ok();
        match line {
            "?" => vec![
                "=== STATUS ===".to_string(),
                format!("Position: {:.2} mm", self.position_mm),
                format!("Speed: {:.2} mm/s", self.speed_mm_s),
                "Jogging: no".to_string(),
            ],
            "POS" => vec![format!("POS: {:.2}", self.position_mm)],
            "HOME" => {
                self.position_mm = 0.0;
                vec!["Position zeroed".to_string()]
            }
            "STOP" => vec!["STOPPED".to_string()],
            "J+" => vec!["JOGGING FORWARD".to_string()],
            "J-" => vec!["JOGGING REVERSE".to_string()],
            _ if line.starts_with('F') && number(line).is_some() => {
                let mm = number(line).unwrap_or_default();
                self.position_mm += mm;
                vec![format!("Feeding {} mm", mm)]
            }
            _ if line.starts_with('R') && number(line).is_some() => {
                let mm = number(line).unwrap_or_default();
                self.position_mm -= mm;
                vec![format!("Retracting {} mm", mm)]
            }
            _ if line.starts_with('S') && number(line).is_some() => {
                self.speed_mm_s = number(line).unwrap_or_default();
                vec![format!("Speed set to {} mm/s", self.speed_mm_s)]
            }
            _ => vec![format!("ERROR: Unknown command {}", line)],
        }
    }
}

/// Serial backend exposing one simulated controller among other ports
#[derive(Clone)]
pub struct SimulatedBackend {
    pub ports: Vec<PortDescriptor>,
    pub firmware: Arc<Mutex<Firmware>>,
    received: Arc<Mutex<Vec<(String, Instant)>>>,
    device: Arc<Mutex<Option<DeviceWriter>>>,
    hang_up: Arc<Notify>,
}

impl SimulatedBackend {
    pub fn new(firmware: Firmware) -> Self {
        Self {
            ports: vec![
                PortDescriptor {
                    path: "/dev/ttyACM0".to_string(),
                    description: "Teensy USB Serial".to_string(),
                    vid: Some(CONFLICTING_VID),
                    pid: Some(CONFLICTING_PID),
                    manufacturer: Some("Teensyduino".to_string()),
                    serial_number: None,
                },
                PortDescriptor {
                    path: CONTROLLER_PATH.to_string(),
                    description: "Arduino Uno".to_string(),
                    vid: Some(0x2341),
                    pid: Some(0x0043),
                    manufacturer: Some("Arduino (www.arduino.cc)".to_string()),
                    serial_number: Some("95530343834351A0E1B1".to_string()),
                },
            ],
            firmware: Arc::new(Mutex::new(firmware)),
            received: Arc::new(Mutex::new(Vec::new())),
            device: Arc::new(Mutex::new(None)),
            hang_up: Arc::new(Notify::new()),
        }
    }

    pub fn without_controller(mut self) -> Self {
        self.ports.retain(|p| p.path != CONTROLLER_PATH);
        self
    }

    /// Commands the device has received, in order
    pub fn received(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(line, _)| line.clone())
            .collect()
    }

    /// When the device received `command` (first occurrence)
    pub fn received_at(&self, command: &str) -> Option<Instant> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .find(|(line, _)| line == command)
            .map(|(_, at)| *at)
    }

    /// Print bytes from the device side, outside any command exchange
    pub async fn emit(&self, bytes: &[u8]) {
        let writer = self.device.lock().unwrap().clone();
        if let Some(writer) = writer {
            writer.lock().await.write_all(bytes).await.unwrap();
        }
    }

    /// Close the device end of the port, as if the board were unplugged
    pub fn hang_up(&self) {
        self.device.lock().unwrap().take();
        self.hang_up.notify_one();
    }
}

impl SerialBackend for SimulatedBackend {
    fn enumerate(&self) -> Vec<PortDescriptor> {
        self.ports.clone()
    }

    fn open(&self, path: &str, _settings: &SerialSettings) -> Result<DynSerial> {
        if path != CONTROLLER_PATH {
            return Err(FeederError::TransportError(format!(
                "could not open {}: no controller there",
                path
            )));
        }

        let (host, device) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(device);
        let writer: DeviceWriter = Arc::new(tokio::sync::Mutex::new(write_half));
        *self.device.lock().unwrap() = Some(writer.clone());

        tokio::spawn(run_device(
            read_half,
            writer,
            self.firmware.clone(),
            self.received.clone(),
            self.hang_up.clone(),
        ));
        Ok(Box::new(host))
    }
}

async fn run_device(
    read_half: tokio::io::ReadHalf<DuplexStream>,
    writer: DeviceWriter,
    firmware: Arc<Mutex<Firmware>>,
    received: Arc<Mutex<Vec<(String, Instant)>>>,
    hang_up: Arc<Notify>,
) {
    let banner = firmware.lock().unwrap().banner.clone();
    for line in banner {
        let _ = writer
            .lock()
            .await
            .write_all(format!("{}\r\n", line).as_bytes())
            .await;
    }

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            _ = hang_up.notified() => return,
            next = lines.next_line() => match next {
                Ok(Some(line)) => line,
                _ => return,
            },
        };
        received.lock().unwrap().push((line.clone(), Instant::now()));

        let (delay, raw, reply) = {
            let mut fw = firmware.lock().unwrap();
            let raw = fw.raw_replies.get(&line).cloned();
            let reply = fw.respond(&line);
            (fw.reply_delay, raw, reply)
        };

        let bytes = match raw {
            Some(raw) => raw,
            None if reply.is_empty() => continue,
            None => reply
                .iter()
                .flat_map(|l| format!("{}\r\n", l).into_bytes())
                .collect(),
        };

        // Reply from a separate task so commands keep being read meanwhile
        let writer = writer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = writer.lock().await.write_all(&bytes).await;
        });
    }
}

/// Default configuration with short serial timings
pub fn test_config() -> FeederConfig {
    let mut config = FeederConfig::default();
    config.serial.settle_ms = 200;
    config.serial.command_timeout_ms = 1000;
    config.serial.quiet_interval_ms = 50;
    config
}

pub fn controller(backend: &SimulatedBackend) -> FeederController {
    FeederController::with_backend(test_config(), Arc::new(backend.clone())).unwrap()
}

pub async fn connected(firmware: Firmware) -> (FeederController, SimulatedBackend) {
    init_tracing();
    let backend = SimulatedBackend::new(firmware);
    let controller = controller(&backend);
    controller.connect(None).await.unwrap();
    (controller, backend)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
