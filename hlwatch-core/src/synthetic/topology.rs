//! On-disk hardware topology synthesis
//!
//! Lays out, under the fleet root:
//!
//! ```text
//! dev/accel/accel<i>                      char 508:2i
//! dev/accel/accel_controlD<i>             char 508:2i+1
//! sys/bus/pci/devices/<bus_id>         -> ../../../devices/pci<dddd:bb>/<bus_id>
//! sys/devices/pci<dddd:bb>/<bus_id>/{vendor,device,numa_node}
//! ```
//!
//! Existing trees are removed and rebuilt.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use super::config::FleetConfig;
use super::fleet::SimulatedFleet;
use crate::device::sysfs;

/// Major number of accel character devices
pub const ACCEL_MAJOR: u32 = 508;

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to remove existing directory {path:?}: {source}")]
    RemoveExisting { path: PathBuf, source: io::Error },

    #[error("failed to create directory {path:?}: {source}")]
    CreateDirectory { path: PathBuf, source: io::Error },

    #[error("failed to create device node {path:?}: {source}")]
    CreateDeviceNode { path: PathBuf, source: io::Error },

    #[error("failed to create target directory {path:?}: {source}")]
    CreateTargetDirectory { path: PathBuf, source: io::Error },

    #[error("failed to create symlink {path:?} -> {target:?}: {source}")]
    CreateSymlink {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },

    #[error("failed to create file {path:?}: {source}")]
    CreateFile { path: PathBuf, source: io::Error },

    #[error("malformed bus id {0:?}")]
    InvalidBusId(String),
}

/// NUMA node of device `index` out of `count` spread over `nodes` nodes
pub fn numa_placement(index: u32, count: u32, nodes: u32) -> Option<u32> {
    if nodes == 0 || count == 0 {
        return None;
    }
    Some((u64::from(index) * u64::from(nodes) / u64::from(count)) as u32)
}

/// Rebuild the whole topology of `fleet` under `config.path`
pub fn build(config: &FleetConfig, fleet: &SimulatedFleet) -> Result<(), TopologyError> {
    if config.device_nodes {
        create_device_nodes(&config.dev_root(), fleet.len() as u32)?;
    } else {
        debug!("Skipping device node creation");
    }

    create_pci_tree(config, fleet)?;

    info!(
        root = ?config.path,
        devices = fleet.len(),
        numa_nodes = config.numa_nodes,
        "Synthesized accelerator topology"
    );
    Ok(())
}

fn reset_dir(path: &Path) -> Result<(), TopologyError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(TopologyError::RemoveExisting {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    fs::create_dir_all(path).map_err(|source| TopologyError::CreateDirectory {
        path: path.to_path_buf(),
        source,
    })
}

/// Create `accel<i>` and `accel_controlD<i>` nodes for `count` devices
pub fn create_device_nodes(dev_root: &Path, count: u32) -> Result<(), TopologyError> {
    reset_dir(dev_root)?;

    for i in 0..count {
        mknod_char(&dev_root.join(format!("accel{}", i)), ACCEL_MAJOR, i * 2)?;
        mknod_char(
            &dev_root.join(format!("accel_controlD{}", i)),
            ACCEL_MAJOR,
            i * 2 + 1,
        )?;
    }

    Ok(())
}

fn mknod_char(path: &Path, major: u32, minor: u32) -> Result<(), TopologyError> {
    let node_error = |source| TopologyError::CreateDeviceNode {
        path: path.to_path_buf(),
        source,
    };

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| node_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

    // SAFETY: `c_path` is a valid NUL-terminated path.
    let rc = unsafe {
        libc::mknod(
            c_path.as_ptr(),
            libc::S_IFCHR | 0o600,
            libc::makedev(major, minor),
        )
    };

    if rc != 0 {
        return Err(node_error(io::Error::last_os_error()));
    }
    Ok(())
}

/// Create the symlinked PCI device tree with identity and NUMA files
pub fn create_pci_tree(config: &FleetConfig, fleet: &SimulatedFleet) -> Result<(), TopologyError> {
    let pci_root = config.pci_devices_root();
    reset_dir(&pci_root)?;
    reset_dir(&config.physical_root())?;

    let count = fleet.len() as u32;
    for (i, device) in fleet.iter().enumerate() {
        let domain_bus = sysfs::pci_domain_bus(&device.bus_id)
            .ok_or_else(|| TopologyError::InvalidBusId(device.bus_id.clone()))?;

        let target = PathBuf::from(format!(
            "../../../devices/pci{}/{}",
            domain_bus, device.bus_id
        ));
        let full_target = config
            .physical_root()
            .join(format!("pci{}", domain_bus))
            .join(&device.bus_id);

        fs::create_dir_all(&full_target).map_err(|source| {
            TopologyError::CreateTargetDirectory {
                path: full_target.clone(),
                source,
            }
        })?;

        let link = pci_root.join(&device.bus_id);
        symlink(&target, &link).map_err(|source| TopologyError::CreateSymlink {
            path: link.clone(),
            target: target.clone(),
            source,
        })?;

        write_file(&full_target.join("vendor"), &format!("0x{:04x}", device.pci_id.vendor))?;
        write_file(&full_target.join("device"), &format!("0x{:04x}", device.pci_id.device))?;
        if let Some(node) = numa_placement(i as u32, count, config.numa_nodes) {
            write_file(&full_target.join("numa_node"), &node.to_string())?;
        }
    }

    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<(), TopologyError> {
    fs::write(path, content).map_err(|source| TopologyError::CreateFile {
        path: path.to_path_buf(),
        source,
    })
}
