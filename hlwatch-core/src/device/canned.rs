//! Static canned device set
//!
//! Serves a fixed table of devices without touching any accelerator. Useful on
//! hosts without the vendor library and in tests of the upper layers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::lifecycle::Lifecycle;
use super::sysfs::{self, PCI_DEVICES_ROOT};
use super::{Device, Event, EventSet, HardwareMonitor, HlmlError, PciId, ProviderKind};

/// Static device set provider
pub struct StaticMonitor {
    devices: Vec<Device>,
    pci_root: PathBuf,
    lifecycle: Lifecycle,
    next_event_set: AtomicU64,
}

impl StaticMonitor {
    /// Create the default five-device table
    pub fn new() -> Self {
        let devices = (1..=5u32)
            .map(|i| Device {
                serial: format!("dummy-serial-{}", i),
                uuid: format!("uuid-{}", i),
                pci_id: PciId::new(0x1da3, 0x1020),
                bus_id: format!("0000:00:1f.{}", i),
                minor: i - 1,
                module_id: i - 1,
            })
            .collect();

        Self::with_devices(devices)
    }

    /// Create a provider serving the given devices
    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            devices,
            pci_root: PathBuf::from(PCI_DEVICES_ROOT),
            lifecycle: Lifecycle::new(),
            next_event_set: AtomicU64::new(1),
        }
    }

    /// Read identity and NUMA files from `pci_root` instead of the host sysfs
    pub fn with_pci_root(mut self, pci_root: impl Into<PathBuf>) -> Self {
        self.pci_root = pci_root.into();
        self
    }

    pub fn pci_root(&self) -> &Path {
        &self.pci_root
    }
}

impl Default for StaticMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HardwareMonitor for StaticMonitor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Static
    }

    async fn initialize(&self) -> Result<(), HlmlError> {
        self.lifecycle.start()
    }

    async fn shutdown(&self) -> Result<(), HlmlError> {
        self.lifecycle.stop()
    }

    async fn device_type_name(&self) -> Result<String, HlmlError> {
        self.lifecycle.ensure_running()?;
        sysfs::scan_device_family(&self.pci_root).map(|family| family.to_string())
    }

    async fn device_count(&self) -> Result<u32, HlmlError> {
        self.lifecycle.ensure_running()?;
        Ok(self.devices.len() as u32)
    }

    async fn device_by_index(&self, index: u32) -> Result<Device, HlmlError> {
        self.lifecycle.ensure_running()?;
        self.devices.get(index as usize).cloned().ok_or_else(|| {
            HlmlError::NotFound(format!("could not find device with index {}", index))
        })
    }

    async fn device_by_serial(&self, serial: &str) -> Result<Device, HlmlError> {
        self.lifecycle.ensure_running()?;
        self.devices
            .iter()
            .find(|d| d.serial == serial)
            .cloned()
            .ok_or_else(|| {
                HlmlError::NotFound(format!("could not find device with serial number {}", serial))
            })
    }

    async fn numa_node(&self, device: &Device) -> Result<Option<u32>, HlmlError> {
        self.lifecycle.ensure_running()?;
        sysfs::read_numa_node(&self.pci_root, &device.bus_id)
    }

    fn new_event_set(&self) -> EventSet {
        EventSet::from_raw(self.next_event_set.fetch_add(1, Ordering::SeqCst))
    }

    fn delete_event_set(&self, set: &EventSet) {
        debug!(set = %set, "Releasing static event set");
    }

    async fn register_event(
        &self,
        _set: &EventSet,
        _kind: u64,
        _serial: &str,
    ) -> Result<(), HlmlError> {
        self.lifecycle.ensure_running()
    }

    async fn wait_for_event(
        &self,
        _set: &EventSet,
        _timeout: Duration,
    ) -> Result<Event, HlmlError> {
        self.lifecycle.ensure_running()?;
        Ok(Event::heartbeat(""))
    }
}
