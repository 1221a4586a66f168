//! PCI sysfs helpers
//!
//! Reads accelerator identity and NUMA placement from a sysfs-style
//! `bus/pci/devices` directory. The same routines serve the real host tree and
//! the tree generated by the synthetic backend.

use std::fmt;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use super::{HlmlError, HABANA_VENDOR_ID};

/// Host PCI devices directory
pub const PCI_DEVICES_ROOT: &str = "/sys/bus/pci/devices";

static BUS_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9a-fA-F]{4}:[0-9a-fA-F]{2}):[0-9a-fA-F]{2}\.[0-7]$")
        .expect("bus id pattern is valid")
});

const GOYA: &[&str] = &["0001"];
// Gaudi family includes Gaudi 1 and Gaudi 2
const GAUDI: &[&str] = &[
    "1000", "1001", "1010", "1011", "1020", "1030", "1060", "1061", "1062",
];
const GRECO: &[&str] = &["0020", "0030"];

/// Accelerator family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Goya,
    Gaudi,
    Greco,
}

impl DeviceFamily {
    /// Classify a device id by its suffix
    pub fn from_device_id(device_id: &str) -> Option<Self> {
        let matches = |family: &[&str]| family.iter().any(|m| device_id.ends_with(m));

        if matches(GOYA) {
            Some(DeviceFamily::Goya)
        } else if matches(GAUDI) {
            Some(DeviceFamily::Gaudi)
        } else if matches(GRECO) {
            Some(DeviceFamily::Greco)
        } else {
            None
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Goya => write!(f, "goya"),
            DeviceFamily::Gaudi => write!(f, "gaudi"),
            DeviceFamily::Greco => write!(f, "greco"),
        }
    }
}

/// Check that `bus_id` looks like `dddd:bb:ss.f`
pub fn is_bus_id(bus_id: &str) -> bool {
    BUS_ID.is_match(bus_id)
}

/// The `dddd:bb` prefix of a bus address, naming its PCI root
pub fn pci_domain_bus(bus_id: &str) -> Option<&str> {
    BUS_ID
        .captures(bus_id)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str())
}

/// Read a `0x`-prefixed id file of a device, returning the bare hex digits
pub fn read_id_from_file(
    base: &Path,
    bus_id: &str,
    property: &str,
) -> Result<String, HlmlError> {
    let path = base.join(bus_id).join(property);
    let data = fs::read_to_string(&path).map_err(|e| {
        HlmlError::NotFound(format!(
            "could not read {} for device {}: {}",
            property, bus_id, e
        ))
    })?;

    let id = data.get(2..).ok_or_else(|| {
        HlmlError::InvalidArgument(format!("{} of device {} is too short", property, bus_id))
    })?;

    Ok(id.trim_matches('\n').to_string())
}

/// Read a device id file and parse it as a 16-bit number
pub fn read_hex_id(base: &Path, bus_id: &str, property: &str) -> Result<u16, HlmlError> {
    let id = read_id_from_file(base, bus_id, property)?;
    u16::from_str_radix(id.trim(), 16).map_err(|e| {
        HlmlError::InvalidArgument(format!(
            "{} of device {} is not hex ({:?}): {}",
            property, bus_id, id, e
        ))
    })
}

/// Scan `pci_root` for Habana devices and classify the first one found
pub fn scan_device_family(pci_root: &Path) -> Result<DeviceFamily, HlmlError> {
    let entries = fs::read_dir(pci_root).map_err(|e| {
        HlmlError::NotFound(format!("error accessing file path {:?}: {}", pci_root, e))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            trace!(entry = ?entry.file_name(), "Not a device, continuing");
            continue;
        }
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    for name in &names {
        let vendor = read_id_from_file(pci_root, name, "vendor")?;
        if vendor != format!("{:04x}", HABANA_VENDOR_ID) {
            continue;
        }

        let device_id = read_id_from_file(pci_root, name, "device")?;
        debug!(bus_id = %name, device_id = %device_id, "Found Habana device");

        return DeviceFamily::from_device_id(&device_id).ok_or_else(|| {
            HlmlError::NotFound(format!(
                "device id {} of {} is not a recognized accelerator",
                device_id, name
            ))
        });
    }

    Err(HlmlError::NotFound(
        "no habana devices on the system".to_string(),
    ))
}

/// NUMA node of the device at `bus_id`, `None` if NUMA is not reported
pub fn read_numa_node(pci_root: &Path, bus_id: &str) -> Result<Option<u32>, HlmlError> {
    let path = pci_root.join(bus_id.to_lowercase()).join("numa_node");

    // NUMA support disabled
    let Ok(content) = fs::read_to_string(&path) else {
        return Ok(None);
    };

    let node: i32 = content.trim().parse().map_err(|e| {
        HlmlError::Unknown(format!("failed to retrieve CPU affinity: {}", e))
    })?;

    if node < 0 {
        return Ok(None);
    }

    Ok(Some(node as u32))
}
