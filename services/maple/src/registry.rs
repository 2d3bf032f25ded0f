//! # Driver Registry & Dispatch
//!
//! Owns the driver table and the device table. Each tick the scanner's
//! snapshot is reconciled against the tracked devices, firing attach and
//! detach transitions, and then every bound device gets its periodic hook in
//! address order.
//!
//! ```text
//!   snapshot ──► reconcile ──► attach / detach hooks
//!                   │
//!                   ▼
//!   dispatch: A0 ─► A1 ─► ... ─► A5 ─► B0 ─► ... ─► D5   (periodic hooks)
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use maple_proto::{Address, Capabilities, DeviceInfo, SLOT_COUNT};

use crate::device::{Device, DeviceHandle};
use crate::driver::{DeviceContext, Driver};
use crate::engine::Engine;
use crate::scanner::{ScanEntry, Snapshot};
use crate::status::StatusTable;
use crate::MapleError;

/// Registered driver
struct Binding {
    capability: Capabilities,
    driver: Box<dyn Driver>,
}

/// Transitions applied by one reconcile pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transitions {
    /// Devices created
    pub attached: usize,
    /// Devices destroyed
    pub detached: usize,
}

/// Driver and device tables.
pub struct Registry {
    engine: Arc<Engine>,
    status: Arc<StatusTable>,
    drivers: Vec<Binding>,
    devices: [Option<Device>; SLOT_COUNT],
}

impl Registry {
    pub fn new(engine: Arc<Engine>, status: Arc<StatusTable>) -> Self {
        Self {
            engine,
            status,
            drivers: Vec::new(),
            devices: core::array::from_fn(|_| None),
        }
    }

    /// Registers `driver` for `capability`.
    ///
    /// Devices already tracked bind to it on the next reconcile.
    pub fn register(
        &mut self,
        capability: Capabilities,
        driver: Box<dyn Driver>,
    ) -> Result<(), MapleError> {
        if !capability.is_single() {
            return Err(MapleError::InvalidCapability);
        }
        if self.is_registered(capability) {
            return Err(MapleError::CapabilityTaken);
        }
        log::info!("maple: driver {} claims {}", driver.name(), capability.name());
        self.drivers.push(Binding { capability, driver });
        Ok(())
    }

    /// Removes the driver for `capability`, detaching its devices first.
    pub fn unregister(&mut self, capability: Capabilities) -> Result<Box<dyn Driver>, MapleError> {
        let position = self
            .drivers
            .iter()
            .position(|b| b.capability == capability)
            .ok_or(MapleError::DriverNotFound)?;
        for index in 0..SLOT_COUNT {
            if matches!(&self.devices[index], Some(d) if d.driver() == Some(capability)) {
                self.detach(index);
            }
        }
        let binding = self.drivers.remove(position);
        log::info!("maple: driver {} released {}", binding.driver.name(), capability.name());
        Ok(binding.driver)
    }

    pub fn is_registered(&self, capability: Capabilities) -> bool {
        self.drivers.iter().any(|b| b.capability == capability)
    }

    /// Brings the device table in line with `snapshot`.
    pub fn reconcile(&mut self, snapshot: &Snapshot) -> Transitions {
        let mut transitions = Transitions::default();
        for address in Address::all() {
            let index = address.index();
            let tracked = self.devices[index].as_ref().map(|d| d.functions());
            match (snapshot.entry(address), tracked) {
                (ScanEntry::Empty, Some(_)) => {
                    self.detach(index);
                    transitions.detached += 1;
                }
                (ScanEntry::Present(info), Some(functions)) if functions != info.functions => {
                    log::info!(
                        "maple: {} changed functions {:?} -> {:?}",
                        address,
                        functions,
                        info.functions
                    );
                    self.detach(index);
                    self.attach(address, *info);
                    transitions.detached += 1;
                    transitions.attached += 1;
                }
                (ScanEntry::Present(info), None) => {
                    self.attach(address, *info);
                    transitions.attached += 1;
                }
                (_, Some(_)) => self.bind(index),
                (_, None) => {}
            }
        }
        transitions
    }

    /// Runs every bound device's periodic hook, in address order.
    ///
    /// Devices still waiting on a transaction from an earlier tick are
    /// skipped. Returns the number of hooks run.
    pub fn dispatch(&mut self) -> usize {
        let now = self.engine.now();
        let mut visited = 0;
        for slot in self.devices.iter_mut() {
            let Some(device) = slot.as_mut() else { continue };
            let Some(capability) = device.driver() else { continue };
            if matches!(self.engine.busy_since(device.address()), Some(since) if since < now) {
                log::trace!("maple: {} still busy, skipped", device.address());
                continue;
            }
            let Some(binding) = self.drivers.iter_mut().find(|b| b.capability == capability)
            else {
                continue;
            };
            let mut cx =
                DeviceContext::new(device, &self.engine, &self.status, binding.driver.name());
            if let Err(err) = binding.driver.periodic(&mut cx) {
                note_failure(&cx, "periodic", err);
            }
            visited += 1;
        }
        visited
    }

    /// Handles of tracked devices advertising `capability`, in address order.
    pub fn enumerate(&self, capability: Capabilities) -> Vec<DeviceHandle> {
        self.devices
            .iter()
            .flatten()
            .filter(|d| d.functions().contains(capability))
            .map(|d| d.handle())
            .collect()
    }

    pub fn is_tracked(&self, address: Address) -> bool {
        self.devices[address.index()].is_some()
    }

    /// Record of the device behind `handle`, if it is still attached.
    pub fn device(&self, handle: DeviceHandle) -> Option<&Device> {
        self.devices[handle.address.index()]
            .as_ref()
            .filter(|d| d.handle() == handle)
    }

    /// All tracked devices in address order
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().flatten()
    }

    /// Detaches every tracked device.
    pub fn detach_all(&mut self) -> usize {
        let mut detached = 0;
        for index in 0..SLOT_COUNT {
            if self.devices[index].is_some() {
                self.detach(index);
                detached += 1;
            }
        }
        detached
    }

    fn attach(&mut self, address: Address, info: DeviceInfo) {
        let handle = self.status.attach(address, info.functions);
        log::info!(
            "maple: {} attached \"{}\" ({:?})",
            address,
            info.product_name(),
            info.functions
        );
        self.devices[address.index()] = Some(Device::new(handle, info, self.engine.now()));
        self.bind(address.index());
    }

    /// Binds an unbound device to the driver of its primary capability.
    fn bind(&mut self, index: usize) {
        let Some(device) = self.devices[index].as_mut() else { return };
        if device.driver().is_some() {
            return;
        }
        let drivers = &mut self.drivers;
        let Some(position) = device
            .functions()
            .by_precedence()
            .find_map(|f| drivers.iter().position(|b| b.capability == f))
        else {
            return;
        };
        let binding = &mut drivers[position];
        device.bind(binding.capability);
        self.status.bind(device.handle(), binding.capability);
        log::debug!("maple: {} bound to {}", device.address(), binding.driver.name());

        let mut cx = DeviceContext::new(device, &self.engine, &self.status, binding.driver.name());
        if let Err(err) = binding.driver.attach(&mut cx) {
            note_failure(&cx, "attach", err);
        }
    }

    /// Detach hook, status retirement, transaction abandonment, destroy.
    fn detach(&mut self, index: usize) {
        let Some(mut device) = self.devices[index].take() else { return };
        let address = device.address();
        if let Some(capability) = device.driver() {
            if let Some(binding) = self.drivers.iter_mut().find(|b| b.capability == capability) {
                let mut cx =
                    DeviceContext::new(&mut device, &self.engine, &self.status, binding.driver.name());
                binding.driver.detach(&mut cx);
            }
        }
        self.status.retire(address);
        self.engine.abandon(address);
        log::info!("maple: {} detached \"{}\"", address, device.info().product_name());
    }
}

fn note_failure(cx: &DeviceContext<'_>, hook: &str, err: MapleError) {
    if err == MapleError::AddressBusy {
        log::trace!("maple: {} {} deferred, address busy", cx.address(), hook);
        return;
    }
    log::debug!("maple: {} {} hook failed: {}", cx.address(), hook, err);
    cx.record_error(err);
}
