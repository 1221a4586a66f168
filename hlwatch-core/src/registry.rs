//! Device registry
//!
//! Enumerates the accelerators visible through a [`HardwareMonitor`] and
//! converts them into the records handed to the orchestrator.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::device::{Device, HardwareMonitor, HlmlError};

/// An enumerated device with its resolved NUMA affinity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device: Device,
    /// `None` when the platform exposes no NUMA data
    pub numa_node: Option<u32>,
}

impl DeviceInfo {
    pub fn serial(&self) -> &str {
        &self.device.serial
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Health::Healthy => write!(f, "Healthy"),
            Health::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNode {
    pub id: i64,
}

/// Orchestrator-facing device record, keyed by serial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDevice {
    pub id: String,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<Vec<NumaNode>>,
}

impl From<&DeviceInfo> for PluginDevice {
    fn from(info: &DeviceInfo) -> Self {
        Self {
            id: info.device.serial.clone(),
            health: Health::Healthy,
            topology: info.numa_node.map(|node| {
                vec![NumaNode {
                    id: i64::from(node),
                }]
            }),
        }
    }
}

/// Enumerates devices through a hardware monitor
pub struct DeviceRegistry {
    monitor: Arc<dyn HardwareMonitor>,
}

impl DeviceRegistry {
    pub fn new(monitor: Arc<dyn HardwareMonitor>) -> Self {
        Self { monitor }
    }

    /// List every device with its NUMA affinity
    ///
    /// The first device that cannot be read aborts the whole listing.
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, HlmlError> {
        let count = self.monitor.device_count().await?;
        let mut devices = Vec::with_capacity(count as usize);

        for index in 0..count {
            let device = self.monitor.device_by_index(index).await?;
            let numa_node = self.monitor.numa_node(&device).await?;

            info!(
                serial = %device.serial,
                uuid = %device.uuid,
                id = format!("{:#x}", device.pci_id.combined()),
                bus_id = %device.bus_id,
                numa_node = ?numa_node,
                "Found device"
            );

            devices.push(DeviceInfo { device, numa_node });
        }

        Ok(devices)
    }

    /// List devices as orchestrator records, all initially healthy
    pub async fn plugin_devices(&self) -> Result<Vec<PluginDevice>, HlmlError> {
        Ok(self
            .list_devices()
            .await?
            .iter()
            .map(PluginDevice::from)
            .collect())
    }

    /// Find a device record by id
    pub fn find<'a>(devices: &'a [PluginDevice], id: &str) -> Option<&'a PluginDevice> {
        devices.iter().find(|d| d.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{EventSet, Event, PciId, ProviderKind, StaticMonitor};
    use async_trait::async_trait;
    use std::time::Duration;

    async fn static_registry(pci_root: &std::path::Path) -> DeviceRegistry {
        let monitor = StaticMonitor::new().with_pci_root(pci_root);
        monitor.initialize().await.unwrap();
        DeviceRegistry::new(Arc::new(monitor))
    }

    #[tokio::test]
    async fn test_list_static_devices_without_numa() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = static_registry(tmp.path()).await;

        let devices = registry.list_devices().await.unwrap();
        assert_eq!(devices.len(), 5);
        assert!(devices.iter().all(|d| d.numa_node.is_none()));
        assert_eq!(devices[0].serial(), "dummy-serial-1");

        let plugin = registry.plugin_devices().await.unwrap();
        assert!(plugin.iter().all(|d| d.health == Health::Healthy));
        assert!(plugin.iter().all(|d| d.topology.is_none()));
    }

    #[tokio::test]
    async fn test_plugin_topology_from_numa() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("0000:00:1f.3");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("numa_node"), "1").unwrap();

        let registry = static_registry(tmp.path()).await;
        let plugin = registry.plugin_devices().await.unwrap();

        let third = DeviceRegistry::find(&plugin, "dummy-serial-3").unwrap();
        assert_eq!(third.topology, Some(vec![NumaNode { id: 1 }]));
        assert!(DeviceRegistry::find(&plugin, "missing").is_none());
    }

    /// Static set whose third device cannot be read
    struct BrokenIndex(StaticMonitor);

    #[async_trait]
    impl HardwareMonitor for BrokenIndex {
        fn provider(&self) -> ProviderKind {
            self.0.provider()
        }
        async fn initialize(&self) -> Result<(), HlmlError> {
            self.0.initialize().await
        }
        async fn shutdown(&self) -> Result<(), HlmlError> {
            self.0.shutdown().await
        }
        async fn device_type_name(&self) -> Result<String, HlmlError> {
            self.0.device_type_name().await
        }
        async fn device_count(&self) -> Result<u32, HlmlError> {
            self.0.device_count().await
        }
        async fn device_by_index(&self, index: u32) -> Result<Device, HlmlError> {
            if index == 2 {
                return Err(HlmlError::DeviceLost);
            }
            self.0.device_by_index(index).await
        }
        async fn device_by_serial(&self, serial: &str) -> Result<Device, HlmlError> {
            self.0.device_by_serial(serial).await
        }
        async fn numa_node(&self, device: &Device) -> Result<Option<u32>, HlmlError> {
            self.0.numa_node(device).await
        }
        fn new_event_set(&self) -> EventSet {
            self.0.new_event_set()
        }
        fn delete_event_set(&self, set: &EventSet) {
            self.0.delete_event_set(set)
        }
        async fn register_event(
            &self,
            set: &EventSet,
            kind: u64,
            serial: &str,
        ) -> Result<(), HlmlError> {
            self.0.register_event(set, kind, serial).await
        }
        async fn wait_for_event(
            &self,
            set: &EventSet,
            timeout: Duration,
        ) -> Result<Event, HlmlError> {
            self.0.wait_for_event(set, timeout).await
        }
    }

    #[tokio::test]
    async fn test_listing_fails_fast() {
        let monitor = BrokenIndex(StaticMonitor::new());
        monitor.initialize().await.unwrap();
        let registry = DeviceRegistry::new(Arc::new(monitor));

        assert!(matches!(
            registry.list_devices().await,
            Err(HlmlError::DeviceLost)
        ));
    }

    #[test]
    fn test_plugin_device_from_info() {
        let info = DeviceInfo {
            device: Device {
                serial: "FK00000042".to_string(),
                uuid: "01F0-HL2080F0-99-P73B93-01-02-03".to_string(),
                pci_id: PciId::new(0x1da3, 0x1020),
                bus_id: "0000:1a:00.0".to_string(),
                minor: 0,
                module_id: 0,
            },
            numa_node: Some(0),
        };

        let plugin = PluginDevice::from(&info);
        assert_eq!(plugin.id, "FK00000042");
        assert_eq!(plugin.topology, Some(vec![NumaNode { id: 0 }]));
    }
}
