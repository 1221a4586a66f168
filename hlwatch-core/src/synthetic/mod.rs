//! Synthetic hardware backend
//!
//! Generates a fleet of accelerators, lays out a matching device and PCI
//! tree on disk, and injects critical errors and timeouts into event waits
//! with configurable probabilities. Upper layers run unchanged against it.

mod config;
mod fleet;
mod topology;

pub use config::{FleetConfig, FleetConfigError, DEFAULT_FLEET_SPEC, FAKEACCEL_SPEC_ENV};
pub use fleet::SimulatedFleet;
pub use topology::{numa_placement, TopologyError, ACCEL_MAJOR};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, trace};

use crate::device::{
    sysfs, Device, Event, EventSet, HardwareMonitor, HlmlError, Lifecycle, ProviderKind,
    EVENT_CRITICAL_ERROR,
};

#[derive(Debug, Error)]
pub enum SyntheticError {
    #[error(transparent)]
    Config(#[from] FleetConfigError),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// Registered event kinds per serial, per event set
type Registrations = HashMap<u64, HashMap<String, u64>>;

enum Draw {
    Heartbeat(String),
    Critical(String),
    Timeout,
}

/// Provider serving a generated fleet
pub struct SyntheticMonitor {
    config: FleetConfig,
    fleet: SimulatedFleet,
    lifecycle: Lifecycle,
    rng: Mutex<StdRng>,
    registrations: Mutex<Registrations>,
    next_event_set: AtomicU64,
}

impl SyntheticMonitor {
    /// Build the fleet described by `config`, seeding from `Seed` when set
    pub fn new(config: FleetConfig) -> Result<Self, SyntheticError> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self::with_rng(config, rng)
    }

    /// Build the fleet described by `FAKEACCEL_SPEC` or the default fleet
    pub fn from_env() -> Result<Self, SyntheticError> {
        Self::new(FleetConfig::from_env()?)
    }

    /// Build the fleet drawing every random choice from `rng`
    pub fn with_rng(config: FleetConfig, mut rng: StdRng) -> Result<Self, SyntheticError> {
        config.validate()?;
        let pci_id = config.parsed_pci_id()?;

        let fleet = SimulatedFleet::generate(&config, pci_id, &mut rng);
        topology::build(&config, &fleet)?;

        Ok(Self {
            config,
            fleet,
            lifecycle: Lifecycle::new(),
            rng: Mutex::new(rng),
            registrations: Mutex::new(HashMap::new()),
            next_event_set: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn fleet(&self) -> &SimulatedFleet {
        &self.fleet
    }

    /// PCI devices directory of the synthesized tree
    pub fn pci_root(&self) -> PathBuf {
        self.config.pci_devices_root()
    }

    fn draw(&self, set: &EventSet) -> Result<Draw, HlmlError> {
        let registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let registered = registrations
            .get(&set.id())
            .ok_or_else(|| HlmlError::InvalidArgument(format!("unknown {}", set)))?;

        if self.fleet.is_empty() {
            return Err(HlmlError::NoData("synthetic fleet has no devices".to_string()));
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let index = rng.random_range(0..self.fleet.len());
        let Some(device) = self.fleet.get(index) else {
            return Err(HlmlError::NotFound(format!(
                "could not find device with index {}",
                index
            )));
        };

        let mask = registered.get(&device.serial).copied().unwrap_or(0);
        if mask & EVENT_CRITICAL_ERROR == 0 {
            return Ok(Draw::Heartbeat(device.serial.clone()));
        }

        if rng.random::<f64>() < self.config.timeout_freq {
            return Ok(Draw::Timeout);
        }
        if rng.random::<f64>() < self.config.unhealthy_freq {
            return Ok(Draw::Critical(device.serial.clone()));
        }
        Ok(Draw::Heartbeat(device.serial.clone()))
    }
}

#[async_trait]
impl HardwareMonitor for SyntheticMonitor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Synthetic
    }

    async fn initialize(&self) -> Result<(), HlmlError> {
        self.lifecycle.start()
    }

    async fn shutdown(&self) -> Result<(), HlmlError> {
        self.lifecycle.stop()
    }

    async fn device_type_name(&self) -> Result<String, HlmlError> {
        self.lifecycle.ensure_running()?;
        sysfs::scan_device_family(&self.pci_root()).map(|family| family.to_string())
    }

    async fn device_count(&self) -> Result<u32, HlmlError> {
        self.lifecycle.ensure_running()?;
        Ok(self.fleet.len() as u32)
    }

    async fn device_by_index(&self, index: u32) -> Result<Device, HlmlError> {
        self.lifecycle.ensure_running()?;
        self.fleet.get(index as usize).cloned().ok_or_else(|| {
            HlmlError::NotFound(format!("could not find device with index {}", index))
        })
    }

    async fn device_by_serial(&self, serial: &str) -> Result<Device, HlmlError> {
        self.lifecycle.ensure_running()?;
        self.fleet.by_serial(serial).cloned().ok_or_else(|| {
            HlmlError::NotFound(format!("could not find device with serial number {}", serial))
        })
    }

    async fn numa_node(&self, device: &Device) -> Result<Option<u32>, HlmlError> {
        self.lifecycle.ensure_running()?;
        sysfs::read_numa_node(&self.pci_root(), &device.bus_id)
    }

    fn new_event_set(&self) -> EventSet {
        let set = EventSet::from_raw(self.next_event_set.fetch_add(1, Ordering::SeqCst));
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(set.id(), HashMap::new());
        set
    }

    fn delete_event_set(&self, set: &EventSet) {
        let removed = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&set.id());
        debug!(set = %set, released = removed.is_some(), "Deleted synthetic event set");
    }

    async fn register_event(
        &self,
        set: &EventSet,
        kind: u64,
        serial: &str,
    ) -> Result<(), HlmlError> {
        self.lifecycle.ensure_running()?;
        if self.fleet.by_serial(serial).is_none() {
            return Err(HlmlError::NotFound(format!(
                "could not find device with serial number {}",
                serial
            )));
        }

        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let registered = registrations
            .get_mut(&set.id())
            .ok_or_else(|| HlmlError::InvalidArgument(format!("unknown {}", set)))?;

        *registered.entry(serial.to_string()).or_insert(0) |= kind;
        trace!(set = %set, serial, kind, "Registered synthetic event");
        Ok(())
    }

    async fn wait_for_event(
        &self,
        set: &EventSet,
        timeout: Duration,
    ) -> Result<Event, HlmlError> {
        self.lifecycle.ensure_running()?;

        match self.draw(set)? {
            Draw::Heartbeat(serial) => Ok(Event::heartbeat(serial)),
            Draw::Critical(serial) => Ok(Event::critical(serial)),
            Draw::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(HlmlError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    fn fleet_config(root: &Path, count: u32, unhealthy: f64, timeout: f64) -> FleetConfig {
        FleetConfig {
            path: root.to_path_buf(),
            device_count: count,
            numa_nodes: 2,
            unhealthy_freq: unhealthy,
            timeout_freq: timeout,
            seed: Some(11),
            device_nodes: false,
            ..FleetConfig::default()
        }
    }

    async fn running(config: FleetConfig) -> SyntheticMonitor {
        let monitor = SyntheticMonitor::new(config).unwrap();
        monitor.initialize().await.unwrap();
        monitor
    }

    async fn register_all(monitor: &SyntheticMonitor, set: &EventSet) {
        for device in monitor.fleet().iter() {
            monitor
                .register_event(set, monitor.critical_error_bit(), &device.serial)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_enumeration_and_numa() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = running(fleet_config(tmp.path(), 8, 0.0, 0.0)).await;

        assert_eq!(monitor.device_count().await.unwrap(), 8);
        assert_eq!(monitor.device_type_name().await.unwrap(), "gaudi");

        for i in 0..8 {
            let by_index = monitor.device_by_index(i).await.unwrap();
            let by_serial = monitor.device_by_serial(&by_index.serial).await.unwrap();
            assert_eq!(by_index.uuid, by_serial.uuid);
            assert_eq!(by_index.bus_id, by_serial.bus_id);

            let node = monitor.numa_node(&by_index).await.unwrap().unwrap();
            assert!(node < 2);
        }

        assert!(matches!(
            monitor.device_by_index(8).await,
            Err(HlmlError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_many_numa_nodes_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let config = FleetConfig {
            numa_nodes: 200,
            ..fleet_config(tmp.path(), 256, 0.0, 0.0)
        };
        let monitor = running(config).await;

        let mut highest = 0;
        for device in monitor.fleet().iter() {
            let node = monitor.numa_node(device).await.unwrap().unwrap();
            assert!(node < 200);
            highest = highest.max(node);
        }
        assert_eq!(highest, 199);
    }

    #[tokio::test]
    async fn test_no_numa_nodes_reports_none() {
        let tmp = tempfile::tempdir().unwrap();
        let config = FleetConfig {
            numa_nodes: 0,
            ..fleet_config(tmp.path(), 3, 0.0, 0.0)
        };
        let monitor = running(config).await;

        let device = monitor.device_by_index(0).await.unwrap();
        assert_eq!(monitor.numa_node(&device).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_always_unhealthy() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = running(fleet_config(tmp.path(), 4, 1.0, 0.0)).await;
        let set = monitor.new_event_set();
        register_all(&monitor, &set).await;

        for _ in 0..50 {
            let event = monitor
                .wait_for_event(&set, Duration::from_millis(1))
                .await
                .unwrap();
            assert!(event.has(EVENT_CRITICAL_ERROR));
            assert!(monitor.fleet().by_serial(&event.serial).is_some());
        }
    }

    #[tokio::test]
    async fn test_always_timeout_waits_the_full_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = running(fleet_config(tmp.path(), 2, 1.0, 1.0)).await;
        let set = monitor.new_event_set();
        register_all(&monitor, &set).await;

        let timeout = Duration::from_millis(20);
        for _ in 0..3 {
            let started = Instant::now();
            let err = monitor.wait_for_event(&set, timeout).await.unwrap_err();
            assert!(err.is_timeout());
            assert!(started.elapsed() >= timeout);
        }
    }

    #[tokio::test]
    async fn test_unregistered_devices_only_heartbeat() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = running(fleet_config(tmp.path(), 4, 1.0, 1.0)).await;
        let set = monitor.new_event_set();

        for _ in 0..20 {
            let event = monitor
                .wait_for_event(&set, Duration::from_millis(1))
                .await
                .unwrap();
            assert!(event.is_heartbeat());
        }
    }

    #[tokio::test]
    async fn test_double_registration_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = running(fleet_config(tmp.path(), 1, 1.0, 0.0)).await;
        let set = monitor.new_event_set();
        register_all(&monitor, &set).await;
        register_all(&monitor, &set).await;

        let event = monitor
            .wait_for_event(&set, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(event.kind, EVENT_CRITICAL_ERROR);
    }

    #[tokio::test]
    async fn test_registration_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = running(fleet_config(tmp.path(), 2, 0.0, 0.0)).await;
        let set = monitor.new_event_set();

        assert!(matches!(
            monitor
                .register_event(&set, EVENT_CRITICAL_ERROR, "FK-unknown")
                .await,
            Err(HlmlError::NotFound(_))
        ));

        monitor.delete_event_set(&set);
        monitor.delete_event_set(&set);
        let serial = monitor.fleet().get(0).unwrap().serial.clone();
        assert!(matches!(
            monitor.register_event(&set, EVENT_CRITICAL_ERROR, &serial).await,
            Err(HlmlError::InvalidArgument(_))
        ));
        assert!(matches!(
            monitor.wait_for_event(&set, Duration::from_millis(1)).await,
            Err(HlmlError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_fleet_has_no_data() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = running(fleet_config(tmp.path(), 0, 0.0, 0.0)).await;
        let set = monitor.new_event_set();

        assert_eq!(monitor.device_count().await.unwrap(), 0);
        assert!(matches!(
            monitor.wait_for_event(&set, Duration::from_millis(1)).await,
            Err(HlmlError::NoData(_))
        ));
    }

    #[tokio::test]
    async fn test_fleets_are_independent() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = running(fleet_config(a.path(), 2, 0.0, 0.0)).await;
        let second = running(FleetConfig {
            seed: Some(99),
            ..fleet_config(b.path(), 3, 0.0, 0.0)
        })
        .await;

        assert_eq!(first.device_count().await.unwrap(), 2);
        assert_eq!(second.device_count().await.unwrap(), 3);
        let serial = &first.fleet().get(0).unwrap().serial;
        assert!(second.device_by_serial(serial).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = fleet_config(tmp.path(), 2, 2.0, 0.0);
        assert!(matches!(
            SyntheticMonitor::new(config),
            Err(SyntheticError::Config(FleetConfigError::Invalid(_)))
        ));
    }
}
