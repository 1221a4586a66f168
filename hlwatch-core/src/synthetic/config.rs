//! Synthetic fleet configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::device::PciId;

/// Environment variable carrying a YAML fleet description
pub const FAKEACCEL_SPEC_ENV: &str = "FAKEACCEL_SPEC";

/// Largest fleet whose bus numbers fit in one byte
pub const MAX_DEVICE_COUNT: u32 = 256;

/// Fleet used when no override is given
pub const DEFAULT_FLEET_SPEC: &str = r#"
Path: "/tmp/gaudi2"
HLDevice: "HL2080F0"
DeviceCount: 8
NumaNodes: 2
PciID: "1da3:1020"
UnhealthyFreq: 0.1
TimeoutFreq: 0.1
"#;

#[derive(Debug, Error)]
pub enum FleetConfigError {
    #[error("error parsing fleet config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid fleet config: {0}")]
    Invalid(String),
}

/// Description of a synthetic accelerator fleet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Root under which `dev/` and `sys/` are synthesized
    #[serde(rename = "Path")]
    pub path: PathBuf,

    /// Device id segment of generated uuids
    #[serde(rename = "HLDevice", default = "default_hl_device")]
    pub hl_device: String,

    #[serde(rename = "DeviceCount")]
    pub device_count: u32,

    /// Number of NUMA nodes, 0 to expose no NUMA data
    #[serde(rename = "NumaNodes", default)]
    pub numa_nodes: u32,

    /// PCI identity as `vendor:device`
    #[serde(rename = "PciID")]
    pub pci_id: String,

    /// Probability that a wait on a registered device reports a critical error
    #[serde(rename = "UnhealthyFreq", default)]
    pub unhealthy_freq: f64,

    /// Probability that a wait on a registered device times out
    #[serde(rename = "TimeoutFreq", default)]
    pub timeout_freq: f64,

    /// Fixed seed for the random source
    #[serde(rename = "Seed", default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Create character device nodes (needs CAP_MKNOD)
    #[serde(rename = "DeviceNodes", default = "default_device_nodes")]
    pub device_nodes: bool,
}

fn default_hl_device() -> String {
    "HL2080F0".to_string()
}

fn default_device_nodes() -> bool {
    true
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/gaudi2"),
            hl_device: default_hl_device(),
            device_count: 8,
            numa_nodes: 2,
            pci_id: "1da3:1020".to_string(),
            unhealthy_freq: 0.1,
            timeout_freq: 0.1,
            seed: None,
            device_nodes: true,
        }
    }
}

impl FleetConfig {
    /// Parse and validate a YAML fleet description
    pub fn from_yaml(yaml: &str) -> Result<Self, FleetConfigError> {
        let config: FleetConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read the fleet from `FAKEACCEL_SPEC`, falling back to the default fleet
    pub fn from_env() -> Result<Self, FleetConfigError> {
        match std::env::var(FAKEACCEL_SPEC_ENV) {
            Ok(spec) if !spec.is_empty() && spec != "default" => {
                info!("FAKEACCEL_SPEC detected, using custom synthetic fleet");
                Self::from_yaml(&spec)
            }
            _ => Self::from_yaml(DEFAULT_FLEET_SPEC),
        }
    }

    pub fn validate(&self) -> Result<(), FleetConfigError> {
        for (name, freq) in [
            ("UnhealthyFreq", self.unhealthy_freq),
            ("TimeoutFreq", self.timeout_freq),
        ] {
            if !(0.0..=1.0).contains(&freq) {
                return Err(FleetConfigError::Invalid(format!(
                    "{} must be within [0, 1], got {}",
                    name, freq
                )));
            }
        }

        if self.path.as_os_str().is_empty() || self.path == Path::new("/") {
            return Err(FleetConfigError::Invalid(format!(
                "Path {:?} cannot be used as a synthetic root",
                self.path
            )));
        }

        if self.device_count > MAX_DEVICE_COUNT {
            return Err(FleetConfigError::Invalid(format!(
                "DeviceCount {} exceeds {}",
                self.device_count, MAX_DEVICE_COUNT
            )));
        }

        self.parsed_pci_id()?;
        Ok(())
    }

    pub fn parsed_pci_id(&self) -> Result<PciId, FleetConfigError> {
        self.pci_id
            .parse()
            .map_err(|_| FleetConfigError::Invalid(format!("malformed PciID {:?}", self.pci_id)))
    }

    /// `<Path>/sys/bus/pci/devices`
    pub fn pci_devices_root(&self) -> PathBuf {
        self.path.join("sys/bus/pci/devices")
    }

    /// `<Path>/dev/accel`
    pub fn dev_root(&self) -> PathBuf {
        self.path.join("dev/accel")
    }

    /// `<Path>/sys/devices`, where the symlinked device directories live
    pub fn physical_root(&self) -> PathBuf {
        self.path.join("sys/devices")
    }
}
