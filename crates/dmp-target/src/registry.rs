//! Device resolution service
//!
//! The host side of backing-device acquisition. A target asks the registry
//! for a device by path; the registry hands back a [`DeviceHandle`] and counts
//! the open. Dropping the handle puts the device back, so a handle is released
//! exactly once no matter how construction or teardown unwinds.
//!
//! Devices registered by name (RAM disks, test devices) stay in the registry
//! until unregistered. Any other path is opened as a [`FileDevice`] on first
//! use and closed when its last handle goes away.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::bio::DeviceId;
use crate::device::{BlockDevice, DeviceMode, FileDevice};
use crate::error::{TargetError, TargetResult};

struct DeviceEntry {
    id: DeviceId,
    dev: Arc<dyn BlockDevice>,
    open_count: usize,
    /// Registered explicitly (kept when the last handle closes)
    pinned: bool,
}

#[derive(Default)]
struct RegistryInner {
    devices: HashMap<String, DeviceEntry>,
    next_id: DeviceId,
}

impl RegistryInner {
    fn allocate_id(&mut self) -> DeviceId {
        self.next_id += 1;
        self.next_id
    }
}

/// Resolves device paths to shared, reference-counted devices
#[derive(Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a device under `name`. Fails if the name is taken.
    pub fn register(&self, name: impl Into<String>, dev: Arc<dyn BlockDevice>) -> TargetResult<DeviceId> {
        let name = name.into();
        let mut inner = self.inner.write();
        if inner.devices.contains_key(&name) {
            return Err(TargetError::InvalidConfiguration(format!(
                "device '{name}' already registered"
            )));
        }
        inner
            .devices
            .try_reserve(1)
            .map_err(|_| TargetError::OutOfMemory)?;

        let id = inner.allocate_id();
        inner.devices.insert(
            name.clone(),
            DeviceEntry {
                id,
                dev,
                open_count: 0,
                pinned: true,
            },
        );
        info!("Registered device '{name}' as #{id}");
        Ok(id)
    }

    /// Remove a registered device. Fails while it is open.
    pub fn unregister(&self, name: &str) -> TargetResult<()> {
        let mut inner = self.inner.write();
        match inner.devices.get(name) {
            None => return Err(TargetError::lookup(name, "no such device")),
            Some(entry) if entry.open_count > 0 => {
                return Err(TargetError::InvalidConfiguration(format!(
                    "device '{name}' is in use ({} opens)",
                    entry.open_count
                )));
            }
            Some(_) => {}
        }
        inner.devices.remove(name);
        info!("Unregistered device '{name}'");
        Ok(())
    }

    /// Resolve `path` and take a reference on it.
    ///
    /// A writable open of a read-only device fails, as does a path that is
    /// neither registered nor openable. Files are opened outside the registry
    /// lock; if two callers race to open the same path, the loser's device is
    /// closed and it shares the winner's.
    pub fn get_device(self: &Arc<Self>, path: &str, mode: DeviceMode) -> TargetResult<DeviceHandle> {
        if path.is_empty() {
            return Err(TargetError::lookup(path, "empty device path"));
        }

        if let Some(handle) = self.open_known(&mut self.inner.write(), path, mode)? {
            return Ok(handle);
        }

        let opened: Arc<dyn BlockDevice> =
            Arc::new(FileDevice::open(path, mode).map_err(|e| TargetError::lookup(path, e))?);

        let mut inner = self.inner.write();
        if let Some(handle) = self.open_known(&mut inner, path, mode)? {
            drop(inner);
            debug!("Device '{path}' opened concurrently; closing duplicate");
            drop(opened);
            return Ok(handle);
        }
        inner
            .devices
            .try_reserve(1)
            .map_err(|_| TargetError::OutOfMemory)?;

        let id = inner.allocate_id();
        inner.devices.insert(
            path.to_string(),
            DeviceEntry {
                id,
                dev: Arc::clone(&opened),
                open_count: 1,
                pinned: false,
            },
        );
        debug!("Device '{path}' opened from filesystem as #{id}");

        Ok(DeviceHandle {
            registry: Arc::clone(self),
            path: path.to_string(),
            id,
            dev: opened,
        })
    }

    /// Take a reference on an already known device
    fn open_known(
        self: &Arc<Self>,
        inner: &mut RegistryInner,
        path: &str,
        mode: DeviceMode,
    ) -> TargetResult<Option<DeviceHandle>> {
        let Some(entry) = inner.devices.get_mut(path) else {
            return Ok(None);
        };
        if mode.is_writable() && entry.dev.read_only() {
            return Err(TargetError::lookup(path, "device is read-only"));
        }
        entry.open_count += 1;
        debug!("Device '{path}' opened ({} opens)", entry.open_count);
        Ok(Some(DeviceHandle {
            registry: Arc::clone(self),
            path: path.to_string(),
            id: entry.id,
            dev: Arc::clone(&entry.dev),
        }))
    }

    /// Drop one reference on `path`
    fn put_device(&self, path: &str) {
        let removed = {
            let mut inner = self.inner.write();
            let Some(entry) = inner.devices.get_mut(path) else {
                return;
            };
            entry.open_count = entry.open_count.saturating_sub(1);
            debug!("Device '{path}' released ({} opens)", entry.open_count);
            if entry.open_count == 0 && !entry.pinned {
                inner.devices.remove(path)
            } else {
                None
            }
        };
        // Closing a file device joins its worker; do it outside the lock
        drop(removed);
    }

    /// Number of live handles on `path` (0 if unknown)
    pub fn open_count(&self, path: &str) -> usize {
        self.inner
            .read()
            .devices
            .get(path)
            .map(|e| e.open_count)
            .unwrap_or(0)
    }

    /// Whether `path` is currently known to the registry
    pub fn contains(&self, path: &str) -> bool {
        self.inner.read().devices.contains_key(path)
    }

    /// Names of all known devices
    pub fn list(&self) -> Vec<String> {
        self.inner.read().devices.keys().cloned().collect()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.list())
            .finish()
    }
}

/// An open reference to a backing device; released on drop
pub struct DeviceHandle {
    registry: Arc<DeviceRegistry>,
    path: String,
    id: DeviceId,
    dev: Arc<dyn BlockDevice>,
}

impl DeviceHandle {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Path the handle was resolved from
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn device(&self) -> &dyn BlockDevice {
        self.dev.as_ref()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.registry.put_device(&self.path);
    }
}
