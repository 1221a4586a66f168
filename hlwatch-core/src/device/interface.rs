//! Hardware monitoring capability trait and common types
//!
//! Defines the core abstraction every accelerator provider implements.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Habana Labs PCI vendor id
pub const HABANA_VENDOR_ID: u16 = 0x1da3;

/// Event about ECC errors
pub const EVENT_ECC_ERROR: u64 = 1 << 0;
/// Event about critical errors that occurred on the device
pub const EVENT_CRITICAL_ERROR: u64 = 1 << 1;
/// Event about changes in clock rate
pub const EVENT_CLOCK_RATE: u64 = 1 << 2;

/// Capability provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Use the vendor library when present, otherwise the static set
    #[default]
    Auto,
    /// Vendor management library
    Real,
    /// Statically canned device set
    Static,
    /// Synthesized hardware environment
    Synthetic,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Auto => write!(f, "auto"),
            ProviderKind::Real => write!(f, "real"),
            ProviderKind::Static => write!(f, "static"),
            ProviderKind::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// PCI vendor:device identity pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciId {
    pub vendor: u16,
    pub device: u16,
}

impl PciId {
    pub fn new(vendor: u16, device: u16) -> Self {
        Self { vendor, device }
    }

    /// Vendor and device combined into a single number, vendor in the high half
    pub fn combined(&self) -> u32 {
        (u32::from(self.vendor) << 16) | u32::from(self.device)
    }

    /// Device id as the 4-hex-digit code used for family classification
    pub fn device_code(&self) -> String {
        format!("{:04x}", self.device)
    }
}

impl fmt::Display for PciId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

impl FromStr for PciId {
    type Err = HlmlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HlmlError::InvalidArgument(format!("malformed PCI id {s:?}"));

        let (vendor, device) = s.trim().split_once(':').ok_or_else(invalid)?;
        if vendor.len() != 4 || device.len() != 4 {
            return Err(invalid());
        }

        Ok(Self {
            vendor: u16::from_str_radix(vendor, 16).map_err(|_| invalid())?,
            device: u16::from_str_radix(device, 16).map_err(|_| invalid())?,
        })
    }
}

/// Identity and placement of one accelerator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Device {
    /// Serial number, the cross-reference key for events and device ids
    pub serial: String,
    /// Vendor-format unique id
    pub uuid: String,
    /// PCI vendor:device identity
    pub pci_id: PciId,
    /// PCI bus address (e.g. "0000:1a:00.0")
    pub bus_id: String,
    /// Accel character device index
    pub minor: u32,
    /// Internal module slot
    pub module_id: u32,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.serial)
    }
}

/// Opaque event subscription handle
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSet {
    id: u64,
}

impl EventSet {
    /// Wrap a provider-assigned handle id
    pub fn from_raw(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event-set-{}", self.id)
    }
}

/// Event returned by a wait on an event set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Serial number of the device the event belongs to
    pub serial: String,
    /// Event kind bitmask, zero for a heartbeat
    pub kind: u64,
}

impl Event {
    /// Create a benign heartbeat event
    pub fn heartbeat(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: 0,
        }
    }

    /// Create a critical error event
    pub fn critical(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            kind: EVENT_CRITICAL_ERROR,
        }
    }

    /// Check whether any bit of `mask` is set on this event
    pub fn has(&self, mask: u64) -> bool {
        self.kind & mask != 0
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == 0
    }
}

/// Errors returned by hardware monitoring providers
#[derive(Debug, Error)]
pub enum HlmlError {
    #[error("hlml not initialized")]
    Uninitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("hlml already initialized")]
    AlreadyInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient size")]
    InsufficientSize,

    #[error("driver not loaded")]
    DriverNotLoaded,

    /// No event arrived before the deadline. Not a fault.
    #[error("event timeout")]
    Timeout,

    #[error("device is lost")]
    DeviceLost,

    #[error("out of memory")]
    OutOfMemory,

    #[error("no data: {0}")]
    NoData(String),

    #[error("unknown error: {0}")]
    Unknown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HlmlError {
    /// Translate a vendor library return code
    pub fn from_return_code(code: i32) -> Result<(), HlmlError> {
        match code {
            0 => Ok(()),
            1 => Err(HlmlError::Uninitialized),
            2 => Err(HlmlError::InvalidArgument("rejected by hlml".to_string())),
            3 => Err(HlmlError::NotSupported("rejected by hlml".to_string())),
            5 => Err(HlmlError::AlreadyInitialized),
            6 => Err(HlmlError::NotFound("reported by hlml".to_string())),
            7 => Err(HlmlError::InsufficientSize),
            9 => Err(HlmlError::DriverNotLoaded),
            10 => Err(HlmlError::Timeout),
            15 => Err(HlmlError::DeviceLost),
            20 => Err(HlmlError::OutOfMemory),
            21 => Err(HlmlError::NoData("reported by hlml".to_string())),
            49 => Err(HlmlError::Unknown("reported by hlml".to_string())),
            other => Err(HlmlError::Unknown(format!(
                "invalid hlml return code {other}"
            ))),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, HlmlError::Timeout)
    }
}

/// Hardware monitoring capability
///
/// Every provider (real vendor library, static canned set, synthetic fleet)
/// implements this trait, so discovery and health watching never depend on
/// which one is active. Implementations must be thread-safe and must never
/// panic when called outside their initialized lifetime.
#[async_trait]
pub trait HardwareMonitor: Send + Sync {
    /// Which provider backs this monitor
    fn provider(&self) -> ProviderKind;

    async fn initialize(&self) -> Result<(), HlmlError>;

    async fn shutdown(&self) -> Result<(), HlmlError>;

    /// Classify the accelerator family present on the host
    async fn device_type_name(&self) -> Result<String, HlmlError>;

    async fn device_count(&self) -> Result<u32, HlmlError>;

    async fn device_by_index(&self, index: u32) -> Result<Device, HlmlError>;

    async fn device_by_serial(&self, serial: &str) -> Result<Device, HlmlError>;

    /// NUMA node of a device, `None` when the platform exposes no NUMA data
    async fn numa_node(&self, device: &Device) -> Result<Option<u32>, HlmlError>;

    fn new_event_set(&self) -> EventSet;

    /// Release an event set. Safe to call with no registrations.
    fn delete_event_set(&self, set: &EventSet);

    /// Register interest in `kind` events for the device with `serial`
    ///
    /// Registering the same pair twice has no additional effect.
    async fn register_event(
        &self,
        set: &EventSet,
        kind: u64,
        serial: &str,
    ) -> Result<(), HlmlError>;

    /// Block up to `timeout` for the next event on `set`
    ///
    /// Returns [`HlmlError::Timeout`] when nothing arrives in time.
    async fn wait_for_event(&self, set: &EventSet, timeout: Duration)
        -> Result<Event, HlmlError>;

    /// Bit identifying a critical (unhealthy) condition in [`Event::kind`]
    fn critical_error_bit(&self) -> u64 {
        EVENT_CRITICAL_ERROR
    }
}

/// Event set that is released when dropped
pub struct EventSetGuard {
    monitor: Arc<dyn HardwareMonitor>,
    set: EventSet,
}

impl EventSetGuard {
    /// Allocate a new event set on `monitor`
    pub fn new(monitor: Arc<dyn HardwareMonitor>) -> Self {
        let set = monitor.new_event_set();
        Self { monitor, set }
    }

    pub fn set(&self) -> &EventSet {
        &self.set
    }
}

impl Drop for EventSetGuard {
    fn drop(&mut self) {
        self.monitor.delete_event_set(&self.set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pci_id_parse_and_display() {
        let id: PciId = "1da3:1020".parse().unwrap();
        assert_eq!(id.vendor, 0x1da3);
        assert_eq!(id.device, 0x1020);
        assert_eq!(id.to_string(), "1da3:1020");
        assert_eq!(id.combined(), 0x1da3_1020);
        assert_eq!(id.device_code(), "1020");
    }

    #[test]
    fn test_pci_id_rejects_malformed() {
        assert!("1da31020".parse::<PciId>().is_err());
        assert!("1da3:10".parse::<PciId>().is_err());
        assert!("zzzz:1020".parse::<PciId>().is_err());
    }

    #[test]
    fn test_return_code_mapping() {
        assert!(HlmlError::from_return_code(0).is_ok());
        assert!(matches!(
            HlmlError::from_return_code(1),
            Err(HlmlError::Uninitialized)
        ));
        assert!(matches!(
            HlmlError::from_return_code(6),
            Err(HlmlError::NotFound(_))
        ));
        assert!(HlmlError::from_return_code(10).unwrap_err().is_timeout());
        assert!(matches!(
            HlmlError::from_return_code(15),
            Err(HlmlError::DeviceLost)
        ));
        assert!(matches!(
            HlmlError::from_return_code(99),
            Err(HlmlError::Unknown(_))
        ));
    }

    #[test]
    fn test_event_bits() {
        let heartbeat = Event::heartbeat("FK00000001");
        assert!(heartbeat.is_heartbeat());
        assert!(!heartbeat.has(EVENT_CRITICAL_ERROR));

        let critical = Event::critical("FK00000001");
        assert!(critical.has(EVENT_CRITICAL_ERROR));
        assert!(!critical.has(EVENT_ECC_ERROR | EVENT_CLOCK_RATE));
    }
}
