//! # Driver Framework
//!
//! A class driver claims one capability flag and receives hook calls for
//! every device bound to it:
//!
//! - `attach` once when the device is bound
//! - `periodic` once per tick while the device stays attached
//! - `detach` once before the device record is destroyed
//!
//! Hooks run in tick context and must not block. Bus requests are issued
//! through [`DeviceContext::submit`]; their results arrive later in a
//! completion callback, which reports back through a [`Publisher`].

use alloc::sync::Arc;
use alloc::vec::Vec;

use maple_proto::{Address, Capabilities, Command, DeviceInfo};

use crate::device::{Device, DeviceHandle, DevicePrivate};
use crate::engine::{Completion, Engine};
use crate::status::{Publisher, StatusSnapshot, StatusTable};
use crate::transport::TransferHandle;
use crate::MapleError;

/// Driver trait - all class drivers implement this
pub trait Driver: Send {
    /// Driver name, used in logs and as the transaction origin
    fn name(&self) -> &'static str;

    /// Called when a device is bound to this driver
    fn attach(&mut self, _device: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        Ok(())
    }

    /// Called before a bound device is destroyed
    fn detach(&mut self, _device: &mut DeviceContext<'_>) {}

    /// Called once per tick for every bound device
    fn periodic(&mut self, _device: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        Ok(())
    }
}

/// Device as seen by a driver hook.
pub struct DeviceContext<'a> {
    device: &'a mut Device,
    engine: &'a Engine,
    status: &'a Arc<StatusTable>,
    origin: &'static str,
}

impl<'a> DeviceContext<'a> {
    pub(crate) fn new(
        device: &'a mut Device,
        engine: &'a Engine,
        status: &'a Arc<StatusTable>,
        origin: &'static str,
    ) -> Self {
        Self {
            device,
            engine,
            status,
            origin,
        }
    }

    /// Handle of this attachment
    pub fn handle(&self) -> DeviceHandle {
        self.device.handle()
    }

    /// Port/unit the device sits at
    pub fn address(&self) -> Address {
        self.device.address()
    }

    /// Identity record the device was attached with
    pub fn info(&self) -> &DeviceInfo {
        self.device.info()
    }

    /// Functions the device advertises
    pub fn functions(&self) -> Capabilities {
        self.device.functions()
    }

    /// Driver-private state of this device
    pub fn private_mut(&mut self) -> &mut DevicePrivate {
        &mut self.device.private
    }

    /// Current tick
    pub fn now(&self) -> u64 {
        self.engine.now()
    }

    /// Write access to this device's status record, for callbacks.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.status.clone(), self.handle())
    }

    /// Latest status record of this device.
    pub fn status(&self) -> Option<StatusSnapshot> {
        self.status.read(self.handle())
    }

    /// Stores `error` as the device's `last_error` without touching its
    /// status block.
    ///
    /// Returns `false` when the device has been detached in the meantime.
    /// The error stays until the next one replaces it.
    pub fn record_error(&self, error: MapleError) -> bool {
        self.status.record_error(self.handle(), error)
    }

    /// Issues `command` to this device.
    pub fn submit<F>(
        &self,
        command: Command,
        payload: Vec<u32>,
        on_complete: F,
    ) -> Result<TransferHandle, MapleError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.engine
            .submit(self.address(), command, payload, self.origin, on_complete)
    }
}
