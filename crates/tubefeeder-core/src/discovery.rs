//! Serial device discovery
//!
//! Enumerates attached serial ports and picks the feeder controller using USB
//! descriptor heuristics. The firmware has no capability string to query, so
//! vendor/product ids and descriptions are all there is to go on.

use serialport::{SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use tracing::debug;

/// Arduino LLC USB vendor id
pub const CONTROLLER_VID: u16 = 0x2341;

/// Uno board product ids (R3, first revision, and the newer 0x0243 revision)
pub const CONTROLLER_PIDS: [u16; 3] = [0x0043, 0x0001, 0x0243];

/// PJRC (Teensy) vendor/product, used by the robot controller sharing the host
pub const CONFLICTING_VID: u16 = 0x16C0;
/// Teensy USB serial product id
pub const CONFLICTING_PID: u16 = 0x0483;

const VENDOR_FAMILY: &str = "arduino";
const PRODUCT_FAMILY: &str = "uno";
const CONFLICTING_FAMILY: &str = "teensy";

/// Information about an attached serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    /// Device path (e.g., "/dev/ttyACM0" or "COM3")
    pub path: String,

    /// Human-readable description
    pub description: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

/// What a port appears to be, judged from its descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Looks like the feeder controller board
    Controller,
    /// A Teensy, never to be mistaken for the feeder
    ConflictingController,
    /// Anything else
    Unknown,
}

impl PortDescriptor {
    /// Descriptor for a port known only by its path
    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            description: "n/a".to_string(),
            vid: None,
            pid: None,
            manufacturer: None,
            serial_number: None,
        }
    }

    /// Classify by USB ids, falling back to the description
    pub fn kind(&self) -> DeviceKind {
        let desc = self.description.to_lowercase();
        if self.vid == Some(CONTROLLER_VID) {
            DeviceKind::Controller
        } else if (self.vid == Some(CONFLICTING_VID) && self.pid == Some(CONFLICTING_PID))
            || desc.contains(CONFLICTING_FAMILY)
        {
            DeviceKind::ConflictingController
        } else {
            DeviceKind::Unknown
        }
    }

    fn matches_known_ids(&self) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => vid == CONTROLLER_VID && CONTROLLER_PIDS.contains(&pid),
            _ => false,
        }
    }

    fn matches_product_family(&self) -> bool {
        let desc = self.description.to_lowercase();
        desc.contains(VENDOR_FAMILY)
            && desc.contains(PRODUCT_FAMILY)
            && !desc.contains(CONFLICTING_FAMILY)
    }

    fn matches_vendor_family(&self) -> bool {
        let desc = self.description.to_lowercase();
        desc.contains(VENDOR_FAMILY) && !desc.contains(CONFLICTING_FAMILY)
    }
}

impl From<SerialPortInfo> for PortDescriptor {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                let description = usb_info
                    .product
                    .clone()
                    .or_else(|| usb_info.manufacturer.clone())
                    .unwrap_or_else(|| "n/a".to_string());
                Self {
                    path: info.port_name,
                    description,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    manufacturer: usb_info.manufacturer,
                    serial_number: usb_info.serial_number,
                }
            }
            SerialPortType::BluetoothPort => Self {
                description: "Bluetooth serial port".to_string(),
                ..Self::from_path(info.port_name)
            },
            SerialPortType::PciPort => Self {
                description: "PCI serial port".to_string(),
                ..Self::from_path(info.port_name)
            },
            _ => Self::from_path(info.port_name),
        }
    }
}

/// Sort key so that ttyACM* ports come first (numerically), then ttyUSB*, then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List attached serial ports, with /dev fallbacks on Linux and deterministic ordering
pub fn enumerate() -> Vec<PortDescriptor> {
    let mut map: HashMap<String, PortDescriptor> = HashMap::new();
    match serialport::available_ports() {
        Ok(ports) => {
            for info in ports {
                let p = PortDescriptor::from(info);
                map.entry(p.path.clone()).or_insert(p);
            }
        }
        Err(e) => debug!("serial port enumeration failed: {}", e),
    }

    // The API misses CDC-ACM nodes on some udev setups
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone())
                        .or_insert_with(|| PortDescriptor::from_path(full));
                }
            }
        }
    }

    let mut v: Vec<PortDescriptor> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.path));
    v
}

/// Pick the controller from enumerated ports
///
/// Ports are scanned in enumeration order and the first one matching any
/// rule wins. Rules, in the order each port is tried against them:
/// 1. controller vendor id with a known board product id
/// 2. description names the vendor and board family, but not the conflicting family
/// 3. description names the vendor, but not the conflicting family
pub fn find_target(ports: &[PortDescriptor]) -> Option<PortDescriptor> {
    let rules: [(&str, fn(&PortDescriptor) -> bool); 3] = [
        ("usb id", PortDescriptor::matches_known_ids),
        ("product description", PortDescriptor::matches_product_family),
        ("vendor description", PortDescriptor::matches_vendor_family),
    ];

    for port in ports {
        if let Some((rule, _)) = rules.iter().find(|(_, matches)| matches(port)) {
            debug!("find_target: {} matched by {}", port.path, rule);
            return Some(port.clone());
        }
    }
    None
}
