//! hlwatch Core Library
//!
//! Accelerator discovery and health-event watching for hlwatch.
//! This crate provides the hardware monitoring capability, its real, static and
//! synthetic providers, device enumeration, and the health event watcher.

pub mod device;
pub mod metrics;
pub mod registry;
pub mod synthetic;
pub mod watcher;

// Re-export common types
pub use device::{
    create_monitor, Device, Event, EventSet, EventSetGuard, HardwareMonitor, HlmlError, PciId,
    ProviderError, ProviderKind,
};
pub use metrics::MetricsRegistry;
pub use registry::{DeviceInfo, DeviceRegistry, Health, PluginDevice};
pub use synthetic::{FleetConfig, SyntheticMonitor};
pub use watcher::{
    Evaluation, HealthWatcher, UnhealthyDevice, UnhealthyReason, WatchConfig,
    WatcherState,
};
