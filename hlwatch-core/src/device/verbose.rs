//! Call-logging decorator

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::{Device, Event, EventSet, HardwareMonitor, HlmlError, ProviderKind};

/// Logs every call and its outcome, then delegates to the wrapped monitor
pub struct VerboseMonitor {
    inner: Arc<dyn HardwareMonitor>,
}

impl VerboseMonitor {
    pub fn new(inner: Arc<dyn HardwareMonitor>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl HardwareMonitor for VerboseMonitor {
    fn provider(&self) -> ProviderKind {
        self.inner.provider()
    }

    async fn initialize(&self) -> Result<(), HlmlError> {
        let result = self.inner.initialize().await;
        debug!(provider = %self.inner.provider(), ?result, "hlml initialize");
        result
    }

    async fn shutdown(&self) -> Result<(), HlmlError> {
        let result = self.inner.shutdown().await;
        debug!(?result, "hlml shutdown");
        result
    }

    async fn device_type_name(&self) -> Result<String, HlmlError> {
        let result = self.inner.device_type_name().await;
        debug!(?result, "hlml device_type_name");
        result
    }

    async fn device_count(&self) -> Result<u32, HlmlError> {
        let result = self.inner.device_count().await;
        debug!(?result, "hlml device_count");
        result
    }

    async fn device_by_index(&self, index: u32) -> Result<Device, HlmlError> {
        let result = self.inner.device_by_index(index).await;
        debug!(index, ?result, "hlml device_by_index");
        result
    }

    async fn device_by_serial(&self, serial: &str) -> Result<Device, HlmlError> {
        let result = self.inner.device_by_serial(serial).await;
        debug!(serial, ?result, "hlml device_by_serial");
        result
    }

    async fn numa_node(&self, device: &Device) -> Result<Option<u32>, HlmlError> {
        let result = self.inner.numa_node(device).await;
        debug!(serial = %device.serial, bus_id = %device.bus_id, ?result, "hlml numa_node");
        result
    }

    fn new_event_set(&self) -> EventSet {
        let set = self.inner.new_event_set();
        debug!(set = %set, "hlml new_event_set");
        set
    }

    fn delete_event_set(&self, set: &EventSet) {
        debug!(set = %set, "hlml delete_event_set");
        self.inner.delete_event_set(set)
    }

    async fn register_event(
        &self,
        set: &EventSet,
        kind: u64,
        serial: &str,
    ) -> Result<(), HlmlError> {
        let result = self.inner.register_event(set, kind, serial).await;
        debug!(set = %set, kind, serial, ?result, "hlml register_event");
        result
    }

    async fn wait_for_event(
        &self,
        set: &EventSet,
        timeout: Duration,
    ) -> Result<Event, HlmlError> {
        let started = Instant::now();
        let result = self.inner.wait_for_event(set, timeout).await;
        debug!(
            set = %set,
            timeout_ms = timeout.as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ?result,
            "hlml wait_for_event"
        );
        result
    }

    fn critical_error_bit(&self) -> u64 {
        self.inner.critical_error_bit()
    }
}
