//! Health event watcher
//!
//! Registers every known device for critical-error events, then on each tick
//! waits once for an event and turns critical ones into deliveries on the
//! unhealthy queue.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::device::{Event, EventSet, EventSetGuard, HardwareMonitor};
use crate::metrics::MetricsRegistry;
use crate::registry::DeviceInfo;

/// Watcher timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Interval between event waits
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,

    /// Longest a single wait may block
    #[serde(with = "humantime_serde", default = "default_wait_timeout")]
    pub wait_timeout: Duration,

    /// Pause after a provider error
    #[serde(with = "humantime_serde", default = "default_error_backoff")]
    pub error_backoff: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            wait_timeout: default_wait_timeout(),
            error_backoff: default_error_backoff(),
        }
    }
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_wait_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(2)
}

/// Watcher lifecycle, published on a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherState {
    Idle,
    Registering,
    Watching,
    Evaluating,
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherState::Idle => write!(f, "IDLE"),
            WatcherState::Registering => write!(f, "REGISTERING"),
            WatcherState::Watching => write!(f, "WATCHING"),
            WatcherState::Evaluating => write!(f, "EVALUATING"),
            WatcherState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Why a device was delivered to the unhealthy queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyReason {
    /// Critical events could not be registered for the device
    RegistrationFailed,
    /// A critical event named this device
    CriticalError,
    /// A critical event named a device that could not be resolved
    UnresolvedCriticalEvent,
}

impl UnhealthyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnhealthyReason::RegistrationFailed => "registration_failed",
            UnhealthyReason::CriticalError => "critical_error",
            UnhealthyReason::UnresolvedCriticalEvent => "unresolved_critical_event",
        }
    }
}

impl fmt::Display for UnhealthyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry of the unhealthy queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnhealthyDevice {
    pub device: DeviceInfo,
    pub reason: UnhealthyReason,
    pub detected_at: DateTime<Utc>,
}

/// Result of one evaluation cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// No event before the wait timeout
    Timeout,
    /// The wait failed and the watcher backed off
    ProviderError,
    /// Event without the critical bit
    Heartbeat,
    /// Critical event delivered for one device
    DeviceFault { serial: String },
    /// Critical event that could not be resolved, every device delivered
    FleetFault,
    /// Critical event for a device outside the watched set
    Unwatched { serial: String },
}

impl Evaluation {
    fn outcome(&self) -> &'static str {
        match self {
            Evaluation::Timeout => "timeout",
            Evaluation::ProviderError => "error",
            Evaluation::Heartbeat => "heartbeat",
            Evaluation::DeviceFault { .. } => "device_fault",
            Evaluation::FleetFault => "fleet_fault",
            Evaluation::Unwatched { .. } => "unwatched",
        }
    }
}

/// Watches a fixed set of devices for critical errors
pub struct HealthWatcher {
    monitor: Arc<dyn HardwareMonitor>,
    devices: Vec<DeviceInfo>,
    config: WatchConfig,
    unhealthy_tx: mpsc::UnboundedSender<UnhealthyDevice>,
    metrics: Arc<MetricsRegistry>,
    state_tx: watch::Sender<WatcherState>,
}

impl HealthWatcher {
    pub fn new(
        monitor: Arc<dyn HardwareMonitor>,
        devices: Vec<DeviceInfo>,
        config: WatchConfig,
        unhealthy_tx: mpsc::UnboundedSender<UnhealthyDevice>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let (state_tx, _) = watch::channel(WatcherState::Idle);
        Self {
            monitor,
            devices,
            config,
            unhealthy_tx,
            metrics,
            state_tx,
        }
    }

    /// Follow state changes
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> WatcherState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: WatcherState) {
        self.state_tx.send_replace(state);
    }

    /// Run until `shutdown` flips to true
    ///
    /// The event set is released on every exit path.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            devices = self.devices.len(),
            interval = ?self.config.health_check_interval,
            wait_timeout = ?self.config.wait_timeout,
            "Starting health watcher"
        );

        self.set_state(WatcherState::Registering);
        let guard = EventSetGuard::new(Arc::clone(&self.monitor));
        let failed = self.register_devices(guard.set()).await;
        if failed > 0 {
            warn!(failed, "Some devices could not be registered for critical events");
        }
        self.set_state(WatcherState::Watching);

        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Skip immediate first tick
        ticker.tick().await;

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.evaluate(guard.set()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Shutdown signal received, stopping health watcher");
                            break;
                        }
                    }
                }
            }
        }

        drop(guard);
        self.set_state(WatcherState::Stopped);
        info!("Health watcher stopped");
    }

    /// Register critical-error interest for every device
    ///
    /// Devices that cannot be registered are delivered as unhealthy right
    /// away. Returns how many failed.
    pub async fn register_devices(&self, set: &EventSet) -> usize {
        let bit = self.monitor.critical_error_bit();
        let mut failed = 0;

        for info in &self.devices {
            if let Err(e) = self.monitor.register_event(set, bit, info.serial()).await {
                warn!(
                    serial = %info.serial(),
                    error = %e,
                    "Failed to register device for critical events, marking unhealthy"
                );
                self.metrics.inc_registration_failure();
                self.deliver(info, UnhealthyReason::RegistrationFailed);
                failed += 1;
            }
        }

        debug!(set = %set, registered = self.devices.len() - failed, "Registered devices");
        failed
    }

    /// Wait once for an event on `set` and act on it
    pub async fn evaluate(&self, set: &EventSet) -> Evaluation {
        self.set_state(WatcherState::Evaluating);

        let started = Instant::now();
        let result = self
            .monitor
            .wait_for_event(set, self.config.wait_timeout)
            .await;
        self.metrics
            .observe_wait_duration(started.elapsed().as_secs_f64());

        let evaluation = match result {
            Err(e) if e.is_timeout() => {
                debug!("No health event before timeout");
                Evaluation::Timeout
            }
            Err(e) => {
                error!(error = %e, backoff = ?self.config.error_backoff, "Waiting for health event failed");
                tokio::time::sleep(self.config.error_backoff).await;
                Evaluation::ProviderError
            }
            Ok(event) if !event.has(self.monitor.critical_error_bit()) => {
                debug!(serial = %event.serial, kind = event.kind, "Heartbeat");
                Evaluation::Heartbeat
            }
            Ok(event) => self.handle_critical(event).await,
        };

        self.metrics.inc_wait_outcome(evaluation.outcome());
        self.set_state(WatcherState::Watching);
        evaluation
    }

    async fn handle_critical(&self, event: Event) -> Evaluation {
        let resolved = match self.monitor.device_by_serial(&event.serial).await {
            Ok(device) if !device.serial.is_empty() && !device.uuid.is_empty() => device,
            Ok(_) => {
                error!(serial = %event.serial, "Critical event resolved to an incomplete device, marking all devices unhealthy");
                return self.deliver_all();
            }
            Err(e) => {
                error!(serial = %event.serial, error = %e, "Could not resolve critical event, marking all devices unhealthy");
                return self.deliver_all();
            }
        };

        match self.devices.iter().find(|d| d.serial() == resolved.serial) {
            Some(info) => {
                warn!(
                    serial = %resolved.serial,
                    uuid = %resolved.uuid,
                    kind = event.kind,
                    "Critical error on device, marking unhealthy"
                );
                self.deliver(info, UnhealthyReason::CriticalError);
                Evaluation::DeviceFault {
                    serial: resolved.serial,
                }
            }
            None => {
                warn!(serial = %resolved.serial, "Critical error on a device that is not watched");
                Evaluation::Unwatched {
                    serial: resolved.serial,
                }
            }
        }
    }

    fn deliver_all(&self) -> Evaluation {
        for info in &self.devices {
            self.deliver(info, UnhealthyReason::UnresolvedCriticalEvent);
        }
        Evaluation::FleetFault
    }

    fn deliver(&self, info: &DeviceInfo, reason: UnhealthyReason) {
        self.metrics.inc_unhealthy_delivery(reason.as_str());

        let unhealthy = UnhealthyDevice {
            device: info.clone(),
            reason,
            detected_at: Utc::now(),
        };
        if self.unhealthy_tx.send(unhealthy).is_err() {
            debug!(serial = %info.serial(), "Unhealthy queue closed, delivery dropped");
        }
    }
}
