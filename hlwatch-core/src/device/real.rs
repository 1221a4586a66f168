//! Habana accelerator provider backed by the vendor management library
//!
//! Binds `libhlml.so` at runtime and passes calls straight through. Bus
//! addresses and PCI identity are resolved from sysfs through the accel
//! character device of each handle.

use std::collections::HashMap;
use std::ffi::{c_char, c_int, c_uint, c_ulonglong, c_void, CStr, CString};
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use libloading::Library;
use once_cell::sync::OnceCell;
use tracing::{debug, error, warn};

use super::sysfs::{self, PCI_DEVICES_ROOT};
use super::{Device, Event, EventSet, HardwareMonitor, HlmlError, PciId, ProviderKind};

const LIBRARY_CANDIDATES: &[&str] = &["libhlml.so", "/usr/lib/habanalabs/libhlml.so"];
const ACCEL_CLASS_ROOT: &str = "/sys/class/accel";
const SERIAL_BUFFER_LEN: usize = 64;
const UUID_BUFFER_LEN: usize = 256;

type DeviceHandle = *mut c_void;
type EventSetHandle = *mut c_void;
type StringGetter = unsafe extern "C" fn(DeviceHandle, *mut c_char, c_uint) -> c_int;
type NumberGetter = unsafe extern "C" fn(DeviceHandle, *mut c_uint) -> c_int;

#[repr(C)]
struct EventData {
    device: DeviceHandle,
    event_type: c_ulonglong,
}

/// Global hlml binding
static HLML: OnceCell<Arc<HlmlLibrary>> = OnceCell::new();

/// Get or load the global hlml binding
fn get_hlml() -> Result<&'static Arc<HlmlLibrary>, HlmlError> {
    HLML.get_or_try_init(|| HlmlLibrary::open().map(Arc::new))
}

/// Entry points of libhlml used by the provider
struct HlmlLibrary {
    init: unsafe extern "C" fn() -> c_int,
    shutdown: unsafe extern "C" fn() -> c_int,
    device_get_count: unsafe extern "C" fn(*mut c_uint) -> c_int,
    device_get_handle_by_index: unsafe extern "C" fn(c_uint, *mut DeviceHandle) -> c_int,
    device_get_handle_by_serial: unsafe extern "C" fn(*const c_char, *mut DeviceHandle) -> c_int,
    device_get_serial: StringGetter,
    device_get_uuid: StringGetter,
    device_get_minor_number: NumberGetter,
    device_get_module_id: NumberGetter,
    event_set_create: unsafe extern "C" fn(*mut EventSetHandle) -> c_int,
    event_set_free: unsafe extern "C" fn(EventSetHandle) -> c_int,
    device_register_events:
        unsafe extern "C" fn(DeviceHandle, c_ulonglong, EventSetHandle) -> c_int,
    event_set_wait: unsafe extern "C" fn(EventSetHandle, *mut EventData, c_uint) -> c_int,
    // Keeps the function pointers above valid
    _library: Library,
}

/// Copy a function pointer out of the library
///
/// # Safety
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, HlmlError> {
    library.get::<T>(name).map(|s| *s).map_err(|e| {
        HlmlError::NotSupported(format!(
            "hlml symbol {} unavailable: {}",
            String::from_utf8_lossy(name).trim_end_matches('\0'),
            e
        ))
    })
}

impl HlmlLibrary {
    fn open() -> Result<Self, HlmlError> {
        let mut last_error = String::new();
        for candidate in LIBRARY_CANDIDATES {
            // SAFETY: libhlml has no load-time preconditions.
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    debug!(library = candidate, "Loaded hlml");
                    return Self::bind(library);
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(HlmlError::NotSupported(format!(
            "hlml library unavailable: {}",
            last_error
        )))
    }

    fn bind(library: Library) -> Result<Self, HlmlError> {
        // SAFETY: the types below follow the declarations in hlml.h.
        unsafe {
            Ok(Self {
                init: symbol(&library, b"hlml_init\0")?,
                shutdown: symbol(&library, b"hlml_shutdown\0")?,
                device_get_count: symbol(&library, b"hlml_device_get_count\0")?,
                device_get_handle_by_index: symbol(
                    &library,
                    b"hlml_device_get_handle_by_index\0",
                )?,
                device_get_handle_by_serial: symbol(
                    &library,
                    b"hlml_device_get_handle_by_serial\0",
                )?,
                device_get_serial: symbol(&library, b"hlml_device_get_serial\0")?,
                device_get_uuid: symbol(&library, b"hlml_device_get_uuid\0")?,
                device_get_minor_number: symbol(&library, b"hlml_device_get_minor_number\0")?,
                device_get_module_id: symbol(&library, b"hlml_device_get_module_id\0")?,
                event_set_create: symbol(&library, b"hlml_event_set_create\0")?,
                event_set_free: symbol(&library, b"hlml_event_set_free\0")?,
                device_register_events: symbol(&library, b"hlml_device_register_events\0")?,
                event_set_wait: symbol(&library, b"hlml_event_set_wait\0")?,
                _library: library,
            })
        }
    }

    fn init(&self) -> Result<(), HlmlError> {
        // SAFETY: no arguments.
        HlmlError::from_return_code(unsafe { (self.init)() })
    }

    fn shutdown(&self) -> Result<(), HlmlError> {
        // SAFETY: no arguments.
        HlmlError::from_return_code(unsafe { (self.shutdown)() })
    }

    fn device_count(&self) -> Result<u32, HlmlError> {
        let mut count: c_uint = 0;
        // SAFETY: `count` is a valid out-pointer.
        HlmlError::from_return_code(unsafe { (self.device_get_count)(&mut count) })?;
        Ok(count)
    }

    fn handle_by_index(&self, index: u32) -> Result<usize, HlmlError> {
        let mut handle: DeviceHandle = ptr::null_mut();
        // SAFETY: `handle` is a valid out-pointer.
        HlmlError::from_return_code(unsafe {
            (self.device_get_handle_by_index)(index, &mut handle)
        })?;
        Ok(handle as usize)
    }

    fn handle_by_serial(&self, serial: &str) -> Result<usize, HlmlError> {
        let serial = CString::new(serial)
            .map_err(|_| HlmlError::InvalidArgument(format!("serial {:?} contains NUL", serial)))?;
        let mut handle: DeviceHandle = ptr::null_mut();
        // SAFETY: `serial` is NUL-terminated and outlives the call.
        HlmlError::from_return_code(unsafe {
            (self.device_get_handle_by_serial)(serial.as_ptr(), &mut handle)
        })?;
        Ok(handle as usize)
    }

    fn read_string(&self, getter: StringGetter, handle: usize, len: usize) -> Result<String, HlmlError> {
        let mut buf = vec![0u8; len];
        // SAFETY: `buf` holds `len` writable bytes.
        HlmlError::from_return_code(unsafe {
            getter(handle as DeviceHandle, buf.as_mut_ptr().cast::<c_char>(), len as c_uint)
        })?;

        let value = CStr::from_bytes_until_nul(&buf).map_err(|_| HlmlError::InsufficientSize)?;
        Ok(value.to_string_lossy().into_owned())
    }

    fn read_number(&self, getter: NumberGetter, handle: usize) -> Result<u32, HlmlError> {
        let mut value: c_uint = 0;
        // SAFETY: `value` is a valid out-pointer.
        HlmlError::from_return_code(unsafe { getter(handle as DeviceHandle, &mut value) })?;
        Ok(value)
    }

    fn serial(&self, handle: usize) -> Result<String, HlmlError> {
        self.read_string(self.device_get_serial, handle, SERIAL_BUFFER_LEN)
    }

    fn create_event_set(&self) -> Result<usize, HlmlError> {
        let mut set: EventSetHandle = ptr::null_mut();
        // SAFETY: `set` is a valid out-pointer.
        HlmlError::from_return_code(unsafe { (self.event_set_create)(&mut set) })?;
        Ok(set as usize)
    }

    fn free_event_set(&self, set: usize) -> Result<(), HlmlError> {
        // SAFETY: `set` came from hlml_event_set_create and is freed once.
        HlmlError::from_return_code(unsafe { (self.event_set_free)(set as EventSetHandle) })
    }

    fn register_events(&self, handle: usize, kind: u64, set: usize) -> Result<(), HlmlError> {
        // SAFETY: both handles were produced by hlml.
        HlmlError::from_return_code(unsafe {
            (self.device_register_events)(handle as DeviceHandle, kind, set as EventSetHandle)
        })
    }

    fn wait(&self, set: usize, timeout_ms: u32) -> Result<(usize, u64), HlmlError> {
        let mut data = EventData {
            device: ptr::null_mut(),
            event_type: 0,
        };
        // SAFETY: `data` is a valid out-pointer and `set` is a live event set.
        HlmlError::from_return_code(unsafe {
            (self.event_set_wait)(set as EventSetHandle, &mut data, timeout_ms)
        })?;
        Ok((data.device as usize, data.event_type))
    }
}

/// Resolve the PCI bus address of `accel<minor>` through the accel class tree
pub fn resolve_bus_id(accel_root: &Path, minor: u32) -> Result<String, HlmlError> {
    let link = accel_root.join(format!("accel{}", minor)).join("device");
    let target = fs::read_link(&link).map_err(|e| {
        HlmlError::NotFound(format!("could not resolve {:?}: {}", link, e))
    })?;

    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| sysfs::is_bus_id(name))
        .ok_or_else(|| {
            HlmlError::NotFound(format!("{:?} does not point at a PCI device", link))
        })
}

/// Provider backed by libhlml
pub struct RealMonitor {
    hlml: Arc<HlmlLibrary>,
    pci_root: PathBuf,
    accel_root: PathBuf,
    event_sets: Mutex<HashMap<u64, usize>>,
    next_event_set: AtomicU64,
}

impl RealMonitor {
    /// Load libhlml and create the provider
    pub fn new() -> Result<Self, HlmlError> {
        let hlml = Arc::clone(get_hlml()?);
        Ok(Self {
            hlml,
            pci_root: PathBuf::from(PCI_DEVICES_ROOT),
            accel_root: PathBuf::from(ACCEL_CLASS_ROOT),
            event_sets: Mutex::new(HashMap::new()),
            next_event_set: AtomicU64::new(1),
        })
    }

    fn describe(&self, handle: usize) -> Result<Device, HlmlError> {
        let serial = self.hlml.serial(handle)?;
        let uuid = self
            .hlml
            .read_string(self.hlml.device_get_uuid, handle, UUID_BUFFER_LEN)?;
        let minor = self
            .hlml
            .read_number(self.hlml.device_get_minor_number, handle)?;
        let module_id = self
            .hlml
            .read_number(self.hlml.device_get_module_id, handle)?;

        let bus_id = resolve_bus_id(&self.accel_root, minor)?;
        let pci_id = PciId::new(
            sysfs::read_hex_id(&self.pci_root, &bus_id, "vendor")?,
            sysfs::read_hex_id(&self.pci_root, &bus_id, "device")?,
        );

        Ok(Device {
            serial,
            uuid,
            pci_id,
            bus_id,
            minor,
            module_id,
        })
    }

    fn event_set_handle(&self, set: &EventSet) -> Result<usize, HlmlError> {
        self.event_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&set.id())
            .copied()
            .ok_or_else(|| HlmlError::InvalidArgument(format!("unknown {}", set)))
    }
}

#[async_trait]
impl HardwareMonitor for RealMonitor {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Real
    }

    async fn initialize(&self) -> Result<(), HlmlError> {
        self.hlml.init()
    }

    async fn shutdown(&self) -> Result<(), HlmlError> {
        self.hlml.shutdown()
    }

    async fn device_type_name(&self) -> Result<String, HlmlError> {
        sysfs::scan_device_family(&self.pci_root).map(|family| family.to_string())
    }

    async fn device_count(&self) -> Result<u32, HlmlError> {
        self.hlml.device_count()
    }

    async fn device_by_index(&self, index: u32) -> Result<Device, HlmlError> {
        let handle = self.hlml.handle_by_index(index)?;
        self.describe(handle)
    }

    async fn device_by_serial(&self, serial: &str) -> Result<Device, HlmlError> {
        let handle = self.hlml.handle_by_serial(serial)?;
        self.describe(handle)
    }

    async fn numa_node(&self, device: &Device) -> Result<Option<u32>, HlmlError> {
        sysfs::read_numa_node(&self.pci_root, &device.bus_id)
    }

    fn new_event_set(&self) -> EventSet {
        let set = EventSet::from_raw(self.next_event_set.fetch_add(1, Ordering::SeqCst));
        match self.hlml.create_event_set() {
            Ok(raw) => {
                self.event_sets
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(set.id(), raw);
            }
            // Registrations against an unbacked set fail, which marks devices unhealthy
            Err(e) => error!(error = %e, "Failed to create hlml event set"),
        }
        set
    }

    fn delete_event_set(&self, set: &EventSet) {
        let raw = self
            .event_sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&set.id());

        if let Some(raw) = raw {
            if let Err(e) = self.hlml.free_event_set(raw) {
                warn!(set = %set, error = %e, "Failed to free hlml event set");
            }
        }
    }

    async fn register_event(
        &self,
        set: &EventSet,
        kind: u64,
        serial: &str,
    ) -> Result<(), HlmlError> {
        let raw_set = self.event_set_handle(set)?;
        let handle = self.hlml.handle_by_serial(serial)?;
        self.hlml.register_events(handle, kind, raw_set)
    }

    async fn wait_for_event(
        &self,
        set: &EventSet,
        timeout: Duration,
    ) -> Result<Event, HlmlError> {
        let raw_set = self.event_set_handle(set)?;
        let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let hlml = Arc::clone(&self.hlml);

        let (handle, kind) = tokio::task::spawn_blocking(move || hlml.wait(raw_set, timeout_ms))
            .await
            .map_err(|e| HlmlError::Unknown(format!("event wait task failed: {}", e)))??;

        Ok(event_from_wait(kind, self.hlml.serial(handle)))
    }
}

/// Build the event reported by a completed wait
///
/// An unreadable serial leaves the identity empty so the event still reaches
/// the caller; an empty serial matches no device.
fn event_from_wait(kind: u64, serial: Result<String, HlmlError>) -> Event {
    match serial {
        Ok(serial) => Event { serial, kind },
        Err(e) => {
            warn!(kind, error = %e, "Could not read serial of event device");
            Event {
                serial: String::new(),
                kind,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::EVENT_CRITICAL_ERROR;

    #[test]
    fn test_event_keeps_kind_when_serial_is_unreadable() {
        let event = event_from_wait(
            EVENT_CRITICAL_ERROR,
            Err(HlmlError::InvalidArgument("stale handle".to_string())),
        );
        assert_eq!(event.kind, EVENT_CRITICAL_ERROR);
        assert!(event.serial.is_empty());

        let event = event_from_wait(EVENT_CRITICAL_ERROR, Ok("AM12345678".to_string()));
        assert_eq!(event.serial, "AM12345678");
        assert_eq!(event.kind, EVENT_CRITICAL_ERROR);
    }

    #[test]
    fn test_resolve_bus_id_follows_device_link() {
        let tmp = tempfile::tempdir().unwrap();
        let accel = tmp.path().join("class/accel/accel3");
        fs::create_dir_all(&accel).unwrap();
        std::os::unix::fs::symlink(
            "../../../devices/pci0000:1a/0000:1a:00.0",
            accel.join("device"),
        )
        .unwrap();

        let bus_id = resolve_bus_id(&tmp.path().join("class/accel"), 3).unwrap();
        assert_eq!(bus_id, "0000:1a:00.0");
    }

    #[test]
    fn test_resolve_bus_id_rejects_non_pci_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let accel = tmp.path().join("accel0");
        fs::create_dir_all(&accel).unwrap();
        std::os::unix::fs::symlink("../platform/hl0", accel.join("device")).unwrap();

        assert!(matches!(
            resolve_bus_id(tmp.path(), 0),
            Err(HlmlError::NotFound(_))
        ));
        assert!(matches!(
            resolve_bus_id(tmp.path(), 7),
            Err(HlmlError::NotFound(_))
        ));
    }
}
