//! Device records.
//!
//! The registry keeps one [`Device`] per occupied address. Application code
//! never sees the record itself, only a [`DeviceHandle`], which stays valid
//! exactly as long as the device it was issued for.

use core::fmt;

use maple_proto::{Address, Capabilities, DeviceInfo, MemoryDefinition};

/// Names one attached device.
///
/// The generation changes every time a device is attached at the address, so
/// a handle kept past a detach never matches the next device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceHandle {
    /// Bus address
    pub address: Address,
    /// Attach generation at that address
    pub generation: u32,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.address, self.generation)
    }
}

/// Driver-owned per-device state, selected by the bound capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DevicePrivate {
    /// Driver keeps nothing per device
    #[default]
    Empty,
    /// Memory card bookkeeping
    Storage(StoragePrivate),
}

/// Per-device memory card state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoragePrivate {
    /// Layout from the identity record
    pub definition: MemoryDefinition,
    /// Ticks until the next media refresh
    pub refresh_in: u32,
}

/// Runtime record of one attached peripheral.
#[derive(Debug)]
pub struct Device {
    handle: DeviceHandle,
    info: DeviceInfo,
    driver: Option<Capabilities>,
    attached_at: u64,
    /// Driver-private state
    pub private: DevicePrivate,
}

impl Device {
    pub(crate) fn new(handle: DeviceHandle, info: DeviceInfo, attached_at: u64) -> Self {
        Self {
            handle,
            info,
            driver: None,
            attached_at,
            private: DevicePrivate::Empty,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn address(&self) -> Address {
        self.handle.address
    }

    /// Identity record from the scan that found the device
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn functions(&self) -> Capabilities {
        self.info.functions
    }

    /// Capability of the bound driver
    pub fn driver(&self) -> Option<Capabilities> {
        self.driver
    }

    pub(crate) fn bind(&mut self, capability: Capabilities) {
        self.driver = Some(capability);
    }

    /// Tick at which the device was attached
    pub fn attached_at(&self) -> u64 {
        self.attached_at
    }
}
