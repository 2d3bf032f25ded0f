//! # Bus Context
//!
//! [`MapleBus`] ties the scanner, registry, engine and status table together
//! and is advanced by one [`MapleBus::tick`] per display refresh:
//!
//! ```text
//!   tick ─► poll ─► collect ─► reconcile ─► reidentify ─► dispatch ─► expire ─► probe
//!            │         │           │             │            │          │         │
//!          engine   scanner     registry      scanner      registry   engine   scanner
//! ```
//!
//! Expiry runs after dispatch, so a transaction submitted on the previous
//! tick is still outstanding when dispatch looks at its slot and the
//! device is skipped rather than polled twice. A timeout is reported to
//! the driver that issued the request; it does not detach the device.
//! Only an identity request that goes unanswered does.
//!
//! The bus itself is owned by the tick context. Application threads use a
//! [`BusClient`], which only touches the status table and the engine.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use maple_proto::{Capabilities, Command, DeviceInfo};

use crate::config::BusConfig;
use crate::device::{Device, DeviceHandle};
use crate::driver::Driver;
use crate::engine::{Completion, Engine};
use crate::registry::Registry;
use crate::scanner::Scanner;
use crate::status::{Publisher, StatusSnapshot, StatusTable};
use crate::transport::{TransferHandle, Transport};
use crate::MapleError;

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Tick number
    pub tick: u64,
    /// Transactions timed out after dispatch
    pub expired: usize,
    /// Devices attached
    pub attached: usize,
    /// Devices detached
    pub detached: usize,
    /// Periodic hooks run
    pub dispatched: usize,
    /// Identity requests issued, including re-identification
    pub probed: usize,
}

/// S-MAPLE bus instance.
pub struct MapleBus {
    config: BusConfig,
    engine: Arc<Engine>,
    status: Arc<StatusTable>,
    scanner: Scanner,
    registry: Registry,
    ticks: u64,
}

impl MapleBus {
    /// Creates the bus over `transport`.
    pub fn new(config: BusConfig, transport: Box<dyn Transport>) -> Result<Self, MapleError> {
        config.validate()?;
        let engine = Arc::new(Engine::new(transport, config.timeout_ticks));
        let status = Arc::new(StatusTable::new());
        log::info!(
            "maple: bus up, {} ports x {} units, timeout {} ticks",
            config.ports,
            config.units,
            config.timeout_ticks
        );
        Ok(Self {
            scanner: Scanner::new(config.clone()),
            registry: Registry::new(engine.clone(), status.clone()),
            config,
            engine,
            status,
            ticks: 0,
        })
    }

    /// Advances the bus by one cycle.
    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        self.engine.advance(self.ticks);
        self.engine.poll();
        let snapshot = self.scanner.collect(&self.engine, &self.registry);
        let transitions = self.registry.reconcile(&snapshot);
        let reidentified = self.scanner.reidentify(&self.engine, &self.registry);
        let dispatched = self.registry.dispatch();
        let expired = self.engine.expire(self.ticks);
        let probed = reidentified + self.scanner.probe(&self.engine);
        TickReport {
            tick: self.ticks,
            expired,
            attached: transitions.attached,
            detached: transitions.detached,
            dispatched,
            probed,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Ticks run so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Engine, for the transport's completion path
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Handle for application code
    pub fn client(&self) -> BusClient {
        BusClient {
            engine: self.engine.clone(),
            status: self.status.clone(),
        }
    }

    pub fn register_driver(
        &mut self,
        capability: Capabilities,
        driver: Box<dyn Driver>,
    ) -> Result<(), MapleError> {
        self.registry.register(capability, driver)
    }

    pub fn unregister_driver(
        &mut self,
        capability: Capabilities,
    ) -> Result<Box<dyn Driver>, MapleError> {
        self.registry.unregister(capability)
    }

    /// Registers every built-in class driver.
    pub fn register_standard_drivers(&mut self) -> Result<(), MapleError> {
        for (capability, driver) in crate::drivers::standard() {
            self.registry.register(capability, driver)?;
        }
        Ok(())
    }

    /// Attached devices advertising `capability`, in address order.
    pub fn enumerate(&self, capability: Capabilities) -> Vec<DeviceHandle> {
        self.registry.enumerate(capability)
    }

    pub fn read_status(&self, device: DeviceHandle) -> Option<StatusSnapshot> {
        self.status.read(device)
    }

    pub fn device_info(&self, device: DeviceHandle) -> Option<DeviceInfo> {
        self.registry.device(device).map(|d| *d.info())
    }

    /// Tracked devices in address order
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.registry.devices()
    }

    /// Detaches every device and abandons outstanding transactions.
    pub fn shutdown(mut self) -> usize {
        let detached = self.registry.detach_all();
        let abandoned = self.engine.abandon_all();
        log::info!(
            "maple: bus down after {} ticks, {} devices detached, {} transfers abandoned",
            self.ticks,
            detached,
            abandoned
        );
        detached
    }
}

/// Application-side handle to the bus.
///
/// Reads never block and never observe a half-written status record.
#[derive(Clone)]
pub struct BusClient {
    engine: Arc<Engine>,
    status: Arc<StatusTable>,
}

impl BusClient {
    /// Latest status of `device`; `None` once it is detached.
    pub fn read_status(&self, device: DeviceHandle) -> Option<StatusSnapshot> {
        self.status.read(device)
    }

    pub fn is_attached(&self, device: DeviceHandle) -> bool {
        self.status.read(device).is_some()
    }

    /// Attached devices advertising `capability`, in address order.
    pub fn enumerate(&self, capability: Capabilities) -> Vec<DeviceHandle> {
        self.status.enumerate(capability)
    }

    /// Issues a raw command to `device`.
    pub fn submit<F>(
        &self,
        device: DeviceHandle,
        command: Command,
        payload: Vec<u32>,
        origin: &'static str,
        on_complete: F,
    ) -> Result<TransferHandle, MapleError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        if !self.is_attached(device) {
            return Err(MapleError::DeviceGone);
        }
        self.engine
            .submit(device.address, command, payload, origin, on_complete)
    }

    pub(crate) fn publisher(&self, device: DeviceHandle) -> Publisher {
        Publisher::new(self.status.clone(), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceContext;
    use crate::drivers::{ControllerDriver, StorageStatus};
    use crate::sim::{SimBus, SimDevice};
    use crate::status::StatusBlock;
    use crate::transport::TransportError;
    use alloc::vec;
    use maple_proto::{Address, Frame};
    use spin::Mutex;
    use std::thread;

    type Events = Arc<Mutex<Vec<(&'static str, Address, u64)>>>;

    /// Logs hook calls with the tick they happened on.
    struct Tracer {
        name: &'static str,
        events: Events,
    }

    impl Driver for Tracer {
        fn name(&self) -> &'static str {
            self.name
        }

        fn attach(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
            self.events.lock().push(("attach", dev.address(), dev.now()));
            Ok(())
        }

        fn detach(&mut self, dev: &mut DeviceContext<'_>) {
            self.events.lock().push(("detach", dev.address(), dev.now()));
        }

        fn periodic(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
            self.events.lock().push(("periodic", dev.address(), dev.now()));
            Ok(())
        }
    }

    fn bus() -> (MapleBus, SimBus) {
        let sim = SimBus::new();
        let bus = MapleBus::new(BusConfig::default(), Box::new(sim.clone())).unwrap();
        (bus, sim)
    }

    fn a(port: u8, unit: u8) -> Address {
        Address::new(port, unit).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = BusConfig {
            units: 7,
            ..BusConfig::default()
        };
        assert!(MapleBus::new(config, Box::new(SimBus::new())).is_err());
    }

    #[test]
    fn test_memcard_scenario() {
        let (mut bus, sim) = bus();
        let events = Events::default();
        bus.register_driver(
            Capabilities::MEMCARD,
            Box::new(Tracer {
                name: "MemCard",
                events: events.clone(),
            }),
        )
        .unwrap();
        bus.register_driver(
            Capabilities::CONTROLLER,
            Box::new(Tracer {
                name: "Pad",
                events: events.clone(),
            }),
        )
        .unwrap();
        sim.plug(a(1, 0), SimDevice::controller());
        sim.plug(a(0, 0), SimDevice::vmu());

        // Tick 1 probes, tick 2 attaches
        let first = sim.step(&mut bus);
        assert_eq!(first.attached, 0);
        let second = sim.step(&mut bus);
        assert_eq!(second.attached, 2);
        sim.run(&mut bus, 2);

        let log = events.lock().clone();
        assert_eq!(log[0], ("attach", a(0, 0), 2));
        assert_eq!(log[1], ("attach", a(1, 0), 2));
        for tick in 2..=4 {
            let periodic: Vec<Address> = log
                .iter()
                .filter(|(hook, _, t)| *hook == "periodic" && *t == tick)
                .map(|(_, address, _)| *address)
                .collect();
            assert_eq!(periodic, [a(0, 0), a(1, 0)]);
        }
    }

    #[test]
    fn test_never_seen_address_gets_no_hooks() {
        let (mut bus, sim) = bus();
        let events = Events::default();
        bus.register_driver(
            Capabilities::CONTROLLER,
            Box::new(Tracer {
                name: "Pad",
                events: events.clone(),
            }),
        )
        .unwrap();
        sim.plug(a(2, 0), SimDevice::controller());
        sim.run(&mut bus, 5);

        assert!(events.lock().iter().all(|(_, address, _)| *address == a(2, 0)));
        assert_eq!(bus.devices().count(), 1);
    }

    #[test]
    fn test_hot_plug_cycle() {
        let (mut bus, sim) = bus();
        let events = Events::default();
        bus.register_driver(
            Capabilities::CONTROLLER,
            Box::new(Tracer {
                name: "Pad",
                events: events.clone(),
            }),
        )
        .unwrap();
        let port = a(3, 0);
        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 4);
        let first = bus.enumerate(Capabilities::CONTROLLER)[0];

        sim.unplug(port);
        sim.run(&mut bus, 4);
        assert!(bus.enumerate(Capabilities::CONTROLLER).is_empty());
        assert_eq!(bus.read_status(first), None);

        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 4);
        let second = bus.enumerate(Capabilities::CONTROLLER)[0];
        assert_ne!(first, second);

        let transitions: Vec<&str> = events
            .lock()
            .iter()
            .map(|(hook, _, _)| *hook)
            .filter(|hook| *hook != "periodic")
            .collect();
        assert_eq!(transitions, ["attach", "detach", "attach"]);
    }

    #[test]
    fn test_stale_completion_after_detach() {
        let (mut bus, sim) = bus();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        let port = a(0, 0);
        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 3);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];
        let published = bus.read_status(pad).unwrap().sequence;
        assert!(published > 0);

        // Poll goes out, the pad is pulled before it is answered
        bus.tick();
        let held = sim.hold();
        sim.unplug(port);
        bus.tick();
        bus.tick();
        assert_eq!(bus.read_status(pad), None);

        // The held answer shows up long after the detach
        sim.plug(port, SimDevice::controller());
        sim.release(held, bus.engine());
        assert_eq!(bus.read_status(pad), None);
        assert!(!bus.status.read_address(port).attached);
    }

    #[test]
    fn test_stalled_unit_times_out() {
        let (mut bus, sim) = bus();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        let port = a(1, 0);
        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 3);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];

        sim.stall(port, true);
        let polled = sim.step(&mut bus);
        assert_eq!(polled.dispatched, 1);
        // Still outstanding from the previous tick: skipped, then timed out
        let skipped = sim.step(&mut bus);
        assert_eq!(skipped.dispatched, 0);
        assert_eq!(skipped.expired, 1);
        assert_eq!(skipped.detached, 0);
        assert_eq!(
            bus.read_status(pad).unwrap().last_error,
            Some(MapleError::TransportTimeout)
        );
        // The identity request sent after the timeout goes unanswered too
        let gone = sim.step(&mut bus);
        assert_eq!(gone.detached, 1);
        assert_eq!(bus.read_status(pad), None);
    }

    #[test]
    fn test_brief_stall_keeps_device() {
        let (mut bus, sim) = bus();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        let port = a(0, 0);
        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 3);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];

        sim.stall(port, true);
        sim.step(&mut bus);
        sim.stall(port, false);
        let report = sim.step(&mut bus);
        assert_eq!(report.expired, 1);
        sim.run(&mut bus, 3);

        assert_eq!(bus.enumerate(Capabilities::CONTROLLER), [pad]);
        let status = bus.read_status(pad).unwrap();
        assert_eq!(status.last_error, Some(MapleError::TransportTimeout));
        assert!(matches!(status.block, StatusBlock::Controller(_)));
    }

    #[test]
    fn test_busy_device_skipped_under_default_config() {
        let (mut bus, sim) = bus();
        let events = Events::default();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        bus.register_driver(
            Capabilities::MOUSE,
            Box::new(Tracer {
                name: "Mouse",
                events: events.clone(),
            }),
        )
        .unwrap();
        sim.plug(a(0, 0), SimDevice::controller());
        sim.plug(a(1, 0), SimDevice::mouse());
        sim.run(&mut bus, 3);

        sim.stall(a(0, 0), true);
        sim.step(&mut bus);
        let report = sim.step(&mut bus);
        // The mouse is still visited, the stalled pad is not
        assert_eq!(report.dispatched, 1);
        let last = events.lock().last().copied();
        assert_eq!(last, Some(("periodic", a(1, 0), report.tick)));
    }

    #[test]
    fn test_malformed_condition_is_recorded() {
        let (mut bus, sim) = bus();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        let port = a(2, 0);
        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 3);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];

        // Function word only, the condition words are missing
        sim.set_condition(port, Capabilities::CONTROLLER, vec![Capabilities::CONTROLLER.bits()]);
        sim.run(&mut bus, 2);
        let status = bus.read_status(pad).unwrap();
        assert_eq!(status.last_error, Some(MapleError::MalformedResponse));
        assert_eq!(bus.enumerate(Capabilities::CONTROLLER), [pad]);
    }

    #[test]
    fn test_swapped_unit_rebinds() {
        let (mut bus, sim) = bus();
        bus.register_standard_drivers().unwrap();
        let port = a(3, 0);
        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 3);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];

        // Swapped between two ticks: the pad's poll keeps the slot busy
        sim.unplug(port);
        sim.plug(port, SimDevice::mouse());
        sim.run(&mut bus, 4);

        assert!(bus.enumerate(Capabilities::CONTROLLER).is_empty());
        assert_eq!(bus.read_status(pad), None);
        let mouse = bus.enumerate(Capabilities::MOUSE);
        assert_eq!(mouse.len(), 1);
        assert_eq!(
            bus.read_status(mouse[0]).unwrap().driver,
            Some(Capabilities::MOUSE)
        );
    }

    #[test]
    fn test_polled_device_identified_again() {
        let sim = SimBus::new();
        let config = BusConfig {
            reidentify_ticks: 4,
            ..BusConfig::default()
        };
        let mut bus = MapleBus::new(config, Box::new(sim.clone())).unwrap();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        let port = a(0, 0);
        sim.plug(port, SimDevice::controller());
        sim.run(&mut bus, 3);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];

        let identities = |sim: &SimBus| {
            sim.requests()
                .iter()
                .filter(|f| f.recipient == port.to_wire())
                .filter(|f| Command::from_code(f.code) == Some(Command::DeviceInfo))
                .count()
        };
        let before = identities(&sim);
        sim.run(&mut bus, 10);
        assert!(identities(&sim) >= before + 2);
        assert_eq!(bus.enumerate(Capabilities::CONTROLLER), [pad]);
    }

    #[test]
    fn test_transport_outage_keeps_devices() {
        let (mut bus, sim) = bus();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        sim.plug(a(0, 0), SimDevice::controller());
        sim.run(&mut bus, 3);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];

        sim.set_offline(true);
        let report = sim.step(&mut bus);
        assert_eq!(report.detached, 0);
        sim.run(&mut bus, 3);
        let status = bus.read_status(pad).unwrap();
        assert_eq!(status.last_error, Some(MapleError::TransportUnavailable));

        sim.set_offline(false);
        sim.run(&mut bus, 2);
        assert!(bus.read_status(pad).is_some());
    }

    #[test]
    fn test_late_registration_binds_tracked_device() {
        let (mut bus, sim) = bus();
        sim.plug(a(2, 0), SimDevice::vmu());
        sim.run(&mut bus, 3);
        let vmu = bus.enumerate(Capabilities::MEMCARD)[0];
        assert_eq!(bus.read_status(vmu).unwrap().driver, None);

        bus.register_standard_drivers().unwrap();
        sim.run(&mut bus, 2);
        let status = bus.read_status(vmu).unwrap();
        assert_eq!(status.driver, Some(Capabilities::MEMCARD));
        assert!(matches!(
            status.block,
            StatusBlock::Storage(StorageStatus { media: Some(_), .. })
        ));
    }

    #[test]
    fn test_client_busy_is_immediate() {
        let (mut bus, sim) = bus();
        sim.plug(a(0, 0), SimDevice::controller());
        sim.run(&mut bus, 2);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];
        let client = bus.client();

        client
            .submit(pad, Command::GetCondition, vec![0x0100_0000], "app", |_| {})
            .unwrap();
        assert_eq!(
            client.submit(pad, Command::GetCondition, vec![0x0100_0000], "app", |_| {}),
            Err(MapleError::AddressBusy)
        );
    }

    #[test]
    fn test_unregister_then_shutdown() {
        let (mut bus, sim) = bus();
        bus.register_standard_drivers().unwrap();
        sim.plug(a(0, 0), SimDevice::controller());
        sim.plug(a(0, 1), SimDevice::vmu());
        sim.run(&mut bus, 4);
        assert_eq!(bus.devices().count(), 2);

        let driver = bus.unregister_driver(Capabilities::MEMCARD).unwrap();
        assert_eq!(driver.name(), "memcard");
        assert_eq!(bus.devices().count(), 1);
        assert_eq!(bus.shutdown(), 1);
    }

    #[test]
    fn test_readers_on_other_threads() {
        let (mut bus, sim) = bus();
        bus.register_driver(Capabilities::CONTROLLER, Box::new(ControllerDriver::new()))
            .unwrap();
        sim.plug(a(0, 0), SimDevice::controller());
        sim.run(&mut bus, 2);
        let pad = bus.enumerate(Capabilities::CONTROLLER)[0];

        let client = bus.client();
        let reader = thread::spawn(move || {
            let mut last = 0;
            for _ in 0..1000 {
                if let Some(status) = client.read_status(pad) {
                    assert!(status.sequence >= last);
                    last = status.sequence;
                }
            }
        });
        sim.run(&mut bus, 20);
        reader.join().unwrap();
    }

    struct Refusing;

    impl Transport for Refusing {
        fn submit(&self, _: TransferHandle, _: &Frame) -> Result<(), TransportError> {
            Err(TransportError::QueueFull)
        }
    }

    #[test]
    fn test_refusing_transport_never_attaches() {
        let mut bus = MapleBus::new(BusConfig::default(), Box::new(Refusing)).unwrap();
        for _ in 0..3 {
            let report = bus.tick();
            assert_eq!(report.probed, 0);
            assert_eq!(report.attached, 0);
        }
    }
}
