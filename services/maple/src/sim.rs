//! # Simulated Bus
//!
//! An in-memory [`Transport`] with pluggable units, for tests and for
//! bringing up the service before the DMA driver exists. Frames queue on
//! submit and are answered when [`SimBus::deliver`] runs, which stands in for
//! the end-of-transfer interrupt.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use maple_proto::{
    Address, BlockLocation, Capabilities, Command, ControllerCondition, DeviceInfo, Frame,
    MediaInfo, MouseCondition, Response, SLOT_COUNT,
};
use spin::Mutex;

use crate::bus::{MapleBus, TickReport};
use crate::engine::Engine;
use crate::transport::{TransferHandle, Transport, TransportError};

const LICENSE: &str = "Produced By or Under License From SEGA ENTERPRISES,LTD.";

/// One simulated peripheral
#[derive(Debug, Clone)]
pub struct SimDevice {
    info: DeviceInfo,
    conditions: BTreeMap<u32, Vec<u32>>,
    media: MediaInfo,
    /// Committed blocks keyed by (function, block)
    blocks: BTreeMap<(u32, u16), Vec<u32>>,
    /// Written but not yet synced
    staged: BTreeMap<(u32, u16), Vec<u32>>,
}

impl SimDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            conditions: BTreeMap::new(),
            media: MediaInfo::default(),
            blocks: BTreeMap::new(),
            staged: BTreeMap::new(),
        }
    }

    /// Standard controller, idle
    pub fn controller() -> Self {
        let info = DeviceInfo::new(
            Capabilities::CONTROLLER,
            [0xfe06_0f00, 0, 0],
            "Dreamcast Controller",
            LICENSE,
        );
        Self::new(info).with_condition(
            Capabilities::CONTROLLER,
            ControllerCondition::IDLE.to_words(Capabilities::CONTROLLER),
        )
    }

    /// Memory unit with screen and clock
    pub fn vmu() -> Self {
        let functions = Capabilities::CLOCK | Capabilities::LCD | Capabilities::MEMCARD;
        let info = DeviceInfo::new(
            functions,
            [0x403f_7e7e, 0x0010_0000, 0x000f_4100],
            "Visual Memory",
            LICENSE,
        );
        let mut device = Self::new(info);
        device.media = MediaInfo {
            last_block: 255,
            partition: 0,
            system_block: 255,
            fat_block: 254,
            fat_blocks: 1,
            dir_block: 253,
            dir_blocks: 13,
            icon: 0,
            sort: 0,
            save_block: 0,
            save_blocks: 200,
        };
        device
    }

    /// Screen-only unit
    pub fn lcd() -> Self {
        let info = DeviceInfo::new(Capabilities::LCD, [0x0010_0000, 0, 0], "LCD Unit", LICENSE);
        Self::new(info)
    }

    /// Mouse, idle
    pub fn mouse() -> Self {
        let info = DeviceInfo::new(Capabilities::MOUSE, [0, 0, 0], "Dreamcast Mouse", LICENSE);
        let idle = MouseCondition {
            buttons: !0,
            dx: MouseCondition::CENTER,
            dy: MouseCondition::CENTER,
            dz: MouseCondition::CENTER,
        };
        Self::new(info).with_condition(Capabilities::MOUSE, idle.to_words())
    }

    /// Light gun, trigger released
    pub fn lightgun() -> Self {
        let info = DeviceInfo::new(Capabilities::LIGHTGUN, [0, 0, 0], "Dreamcast Gun", LICENSE);
        Self::new(info).with_condition(
            Capabilities::LIGHTGUN,
            ControllerCondition::IDLE.to_words(Capabilities::LIGHTGUN),
        )
    }

    /// Sets the `GetCondition` reply for `function`.
    pub fn with_condition(mut self, function: Capabilities, words: Vec<u32>) -> Self {
        self.conditions.insert(function.bits(), words);
        self
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn answer(&mut self, request: &Frame) -> (Response, Vec<u32>) {
        let function = request.payload.first().copied().unwrap_or(0);
        let supported = self.info.functions.bits() & function != 0 && function.count_ones() == 1;
        let location = request.payload.get(1).copied().map(BlockLocation::from_word);

        match Command::from_code(request.code) {
            Some(Command::DeviceInfo) => (Response::DeviceInfo, self.info.to_words()),
            Some(Command::Reset) | Some(Command::Kill) | Some(Command::SetCondition) => {
                (Response::Ok, vec![])
            }
            Some(_) if !supported => (Response::FunctionUnsupported, vec![]),
            Some(Command::GetCondition) => match self.conditions.get(&function) {
                Some(words) => (Response::DataTransfer, words.clone()),
                None => (Response::FunctionUnsupported, vec![]),
            },
            Some(Command::GetMemoryInfo) if function == Capabilities::MEMCARD.bits() => {
                (Response::DataTransfer, self.media.to_words())
            }
            Some(Command::BlockRead) => {
                let Some(location) = location else {
                    return (Response::FileError, vec![]);
                };
                let words = self.block_words(function);
                let mut payload = vec![function, location.with_phase(0).to_word()];
                match self.blocks.get(&(function, location.block)) {
                    Some(data) => payload.extend_from_slice(data),
                    None => payload.resize(2 + words, 0),
                }
                (Response::DataTransfer, payload)
            }
            Some(Command::BlockWrite) => {
                let Some(location) = location else {
                    return (Response::FileError, vec![]);
                };
                let data = &request.payload[2..];
                let words = self.block_words(function);
                let key = (function, location.block);
                if function == Capabilities::MEMCARD.bits() {
                    let staged = self.staged.entry(key).or_insert_with(|| vec![0; words]);
                    let start = usize::from(location.phase) * data.len();
                    if start + data.len() > staged.len() {
                        return (Response::FileError, vec![]);
                    }
                    staged[start..start + data.len()].copy_from_slice(data);
                } else {
                    self.blocks.insert(key, data.to_vec());
                }
                (Response::Ok, vec![])
            }
            Some(Command::BlockSync) => {
                let Some(location) = location else {
                    return (Response::FileError, vec![]);
                };
                let key = (function, location.block);
                if let Some(data) = self.staged.remove(&key) {
                    self.blocks.insert(key, data);
                }
                (Response::Ok, vec![])
            }
            _ => (Response::UnknownCommand, vec![]),
        }
    }

    fn block_words(&self, function: u32) -> usize {
        if function == Capabilities::MEMCARD.bits() {
            self.info
                .memory_definition()
                .map_or(128, |def| usize::from(def.block_size) / 4)
        } else {
            48
        }
    }
}

#[derive(Default)]
struct SimState {
    units: BTreeMap<Address, SimDevice>,
    queue: Vec<(TransferHandle, Frame)>,
    requests: Vec<Frame>,
    stalled: [bool; SLOT_COUNT],
    offline: bool,
}

impl SimState {
    /// Reply to `request`, as the addressed unit (or nobody) would send it.
    fn respond(&mut self, request: &Frame) -> Frame {
        let Some(address) = Address::from_wire(request.recipient) else {
            return Frame::reply(request, Response::None, 0, vec![]);
        };
        let root_present = Address::root(address.port())
            .map_or(false, |root| self.units.contains_key(&root));
        if !root_present {
            return Frame::reply(request, Response::None, 0, vec![]);
        }
        let sub_units = self.sub_units(address.port());
        match self.units.get_mut(&address) {
            Some(device) => {
                let (response, payload) = device.answer(request);
                Frame::reply(request, response, sub_units, payload)
            }
            None => Frame::reply(request, Response::None, 0, vec![]),
        }
    }

    fn sub_units(&self, port: u8) -> u8 {
        self.units
            .keys()
            .filter(|a| a.port() == port)
            .fold(0, |mask, a| mask | a.sub_unit_bit())
    }
}

/// Frames taken off the bus by [`SimBus::hold`]
pub struct Held(Vec<(TransferHandle, Frame)>);

/// Simulated bus shared between the test and the engine.
#[derive(Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plug(&self, address: Address, device: SimDevice) {
        self.state.lock().units.insert(address, device);
    }

    pub fn unplug(&self, address: Address) -> Option<SimDevice> {
        self.state.lock().units.remove(&address)
    }

    /// Sets the `GetCondition` reply of the unit at `address`.
    pub fn set_condition(&self, address: Address, function: Capabilities, words: Vec<u32>) {
        if let Some(device) = self.state.lock().units.get_mut(&address) {
            device.conditions.insert(function.bits(), words);
        }
    }

    /// A stalled unit accepts frames but never answers.
    pub fn stall(&self, address: Address, stalled: bool) {
        self.state.lock().stalled[address.index()] = stalled;
    }

    /// While offline every submission is refused.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Every frame accepted so far, oldest first
    pub fn requests(&self) -> Vec<Frame> {
        self.state.lock().requests.clone()
    }

    /// Frames waiting for an answer
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Committed contents of a block on the unit at `address`.
    pub fn block(&self, address: Address, function: Capabilities, block: u16) -> Option<Vec<u32>> {
        let state = self.state.lock();
        state.units.get(&address)?.blocks.get(&(function.bits(), block)).cloned()
    }

    /// Answers every queued frame from a unit that is not stalled.
    ///
    /// Answers go to the engine with the bus unlocked and are then polled,
    /// so completion callbacks may submit again; those frames wait for the
    /// next call.
    pub fn deliver(&self, engine: &Engine) -> usize {
        let answers: Vec<(TransferHandle, Frame)> = {
            let mut state = self.state.lock();
            let queue = core::mem::take(&mut state.queue);
            let (held, ready): (Vec<_>, Vec<_>) = queue.into_iter().partition(|(_, frame)| {
                Address::from_wire(frame.recipient).map_or(false, |a| state.stalled[a.index()])
            });
            state.queue = held;
            ready
                .into_iter()
                .map(|(handle, frame)| (handle, state.respond(&frame)))
                .collect()
        };
        let delivered = answers.len();
        for (handle, reply) in answers {
            engine.complete(handle, Ok(reply));
        }
        engine.poll();
        delivered
    }

    /// Delivers until no answerable frame is left.
    pub fn deliver_all(&self, engine: &Engine) -> usize {
        let mut total = 0;
        loop {
            match self.deliver(engine) {
                0 => return total,
                n => total += n,
            }
        }
    }

    /// Takes every queued frame off the bus without answering it.
    pub fn hold(&self) -> Held {
        Held(core::mem::take(&mut self.state.lock().queue))
    }

    /// Answers held frames now, against the units currently plugged.
    pub fn release(&self, held: Held, engine: &Engine) {
        let answers: Vec<(TransferHandle, Frame)> = {
            let mut state = self.state.lock();
            held.0
                .into_iter()
                .map(|(handle, frame)| (handle, state.respond(&frame)))
                .collect()
        };
        for (handle, reply) in answers {
            engine.complete(handle, Ok(reply));
        }
        engine.poll();
    }

    /// One bus cycle: tick, then the end-of-transfer interrupt.
    pub fn step(&self, bus: &mut MapleBus) -> TickReport {
        let report = bus.tick();
        self.deliver(bus.engine());
        report
    }

    /// Runs `ticks` bus cycles.
    pub fn run(&self, bus: &mut MapleBus, ticks: usize) -> TickReport {
        let mut report = TickReport::default();
        for _ in 0..ticks {
            report = self.step(bus);
        }
        report
    }
}

impl Transport for SimBus {
    fn submit(&self, handle: TransferHandle, frame: &Frame) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(TransportError::Offline);
        }
        state.requests.push(frame.clone());
        state.queue.push((handle, frame.clone()));
        Ok(())
    }

    fn cancel(&self, handle: TransferHandle) {
        self.state.lock().queue.retain(|(h, _)| *h != handle);
    }
}
