//! # Device Status Model
//!
//! Every address has a [`StatusCell`] holding the decoded state of whatever
//! device is attached there. Completion callbacks write it, application code
//! reads it, and neither side ever waits for the other.
//!
//! ## Double Buffer
//!
//! ```text
//!            front ──┐
//!                    ▼
//!   ┌──────────────┬──────────────┐
//!   │ slot 0 (seq) │ slot 1 (seq) │   readers copy the front slot and
//!   └──────────────┴──────────────┘   retry if its sequence moved
//!          ▲
//!   writer fills the back slot (seq odd → even), then flips `front`
//! ```
//!
//! Writers serialize on an owner word `generation << 1 | WRITER`. A write
//! carries the generation of the device it was issued for; once the device is
//! detached the generation moves on and late writes are refused, so a stale
//! completion can never touch the record of a newer device at the same
//! address.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering};

use maple_proto::{Address, Capabilities, SLOT_COUNT};

use crate::device::DeviceHandle;
use crate::drivers::controller::ControllerState;
use crate::drivers::lcd::LcdFrame;
use crate::drivers::lightgun::LightGunState;
use crate::drivers::mouse::MouseState;
use crate::drivers::storage::StorageStatus;
use crate::MapleError;

const WRITER: u32 = 1;
const GENERATION_MASK: u32 = u32::MAX >> 1;

/// Single-writer, many-reader versioned cell.
pub struct StatusCell<T: Copy> {
    slots: [UnsafeCell<T>; 2],
    seq: [AtomicU32; 2],
    front: AtomicUsize,
    owner: AtomicU32,
}

// SAFETY: slot contents are only written while the WRITER bit is held, and
// readers validate every copy against the slot's sequence counter.
unsafe impl<T: Copy + Send> Sync for StatusCell<T> {}
unsafe impl<T: Copy + Send> Send for StatusCell<T> {}

impl<T: Copy> StatusCell<T> {
    /// Creates a cell at generation 0.
    pub fn new(initial: T) -> Self {
        Self {
            slots: [UnsafeCell::new(initial), UnsafeCell::new(initial)],
            seq: [AtomicU32::new(0), AtomicU32::new(0)],
            front: AtomicUsize::new(0),
            owner: AtomicU32::new(0),
        }
    }

    /// Current generation.
    pub fn generation(&self) -> u32 {
        self.owner.load(Ordering::Acquire) >> 1
    }

    /// Copies the latest published value. Never observes a partial write.
    pub fn read(&self) -> T {
        loop {
            let front = self.front.load(Ordering::Acquire);
            let before = self.seq[front].load(Ordering::Acquire);
            if before & 1 != 0 {
                spin_loop();
                continue;
            }
            // SAFETY: the copy is only assumed initialized after the sequence
            // check proves no writer touched the slot meanwhile.
            let copy = unsafe { ptr::read_volatile(self.slots[front].get().cast::<MaybeUninit<T>>()) };
            fence(Ordering::Acquire);
            if self.seq[front].load(Ordering::Relaxed) == before {
                return unsafe { copy.assume_init() };
            }
        }
    }

    /// Replaces the value if `generation` is still current.
    pub fn write(&self, generation: u32, value: T) -> bool {
        self.update(generation, |_| value)
    }

    /// Publishes `f(current)` if `generation` is still current.
    pub fn update(&self, generation: u32, f: impl FnOnce(&T) -> T) -> bool {
        let Some(owned) = self.acquire(Some(generation)) else {
            return false;
        };
        // SAFETY: the WRITER bit is held, nobody else writes either slot.
        let current = unsafe { *self.slots[self.front.load(Ordering::Relaxed)].get() };
        self.store(f(&current));
        self.owner.store(owned & !WRITER, Ordering::Release);
        true
    }

    /// Starts a new generation with the value built by `f`.
    ///
    /// Writes carrying an older generation are refused from now on.
    pub fn reset(&self, f: impl FnOnce(u32) -> T) -> u32 {
        let owned = self.acquire(None).unwrap_or(WRITER);
        let generation = ((owned >> 1).wrapping_add(1)) & GENERATION_MASK;
        self.store(f(generation));
        self.owner.store(generation << 1, Ordering::Release);
        generation
    }

    /// Takes the WRITER bit, optionally only for `generation`.
    fn acquire(&self, generation: Option<u32>) -> Option<u32> {
        loop {
            let current = self.owner.load(Ordering::Acquire);
            if matches!(generation, Some(g) if g != current >> 1) {
                return None;
            }
            if current & WRITER != 0 {
                spin_loop();
                continue;
            }
            let owned = current | WRITER;
            if self
                .owner
                .compare_exchange_weak(current, owned, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(owned);
            }
        }
    }

    /// Fills the back slot and flips it to the front. WRITER bit held.
    fn store(&self, value: T) {
        let back = self.front.load(Ordering::Relaxed) ^ 1;
        let seq = self.seq[back].load(Ordering::Relaxed);
        self.seq[back].store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        // SAFETY: back slot, WRITER bit held; concurrent readers of this slot
        // see an odd or changed sequence and discard their copy.
        unsafe { ptr::write_volatile(self.slots[back].get(), value) };
        self.seq[back].store(seq.wrapping_add(2), Ordering::Release);
        self.front.store(back, Ordering::Release);
    }
}

/// Decoded class-specific state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusBlock {
    /// Nothing published yet
    #[default]
    Empty,
    /// Controller buttons and axes
    Controller(ControllerState),
    /// Mouse deltas and position
    Mouse(MouseState),
    /// Light gun buttons
    LightGun(LightGunState),
    /// Storage geometry
    Storage(StorageStatus),
    /// Last frame committed to an LCD
    Lcd(LcdFrame),
}

/// One device's status record as seen by readers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Device generation this record belongs to
    pub generation: u32,
    /// A device is attached at the address
    pub attached: bool,
    /// Functions the device advertises
    pub functions: Capabilities,
    /// Capability of the bound driver, if any
    pub driver: Option<Capabilities>,
    /// Latest decoded state
    pub block: StatusBlock,
    /// Number of blocks published since attach
    pub sequence: u32,
    /// Most recent transaction error
    pub last_error: Option<MapleError>,
}

impl StatusSnapshot {
    const fn vacant(generation: u32) -> Self {
        Self {
            generation,
            attached: false,
            functions: Capabilities::empty(),
            driver: None,
            block: StatusBlock::Empty,
            sequence: 0,
            last_error: None,
        }
    }
}

/// Status cells for every address on the bus.
pub struct StatusTable {
    cells: [StatusCell<StatusSnapshot>; SLOT_COUNT],
}

impl Default for StatusTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTable {
    pub fn new() -> Self {
        Self {
            cells: core::array::from_fn(|_| StatusCell::new(StatusSnapshot::vacant(0))),
        }
    }

    /// Latest record of `device`, or `None` once it is detached.
    pub fn read(&self, device: DeviceHandle) -> Option<StatusSnapshot> {
        let snapshot = self.cells[device.address.index()].read();
        (snapshot.attached && snapshot.generation == device.generation).then_some(snapshot)
    }

    /// Latest record at `address`, whoever owns it.
    pub fn read_address(&self, address: Address) -> StatusSnapshot {
        self.cells[address.index()].read()
    }

    /// Handles of attached devices advertising `capability`, in address order.
    pub fn enumerate(&self, capability: Capabilities) -> Vec<DeviceHandle> {
        Address::all()
            .filter_map(|address| {
                let snapshot = self.read_address(address);
                (snapshot.attached && snapshot.functions.contains(capability)).then_some(
                    DeviceHandle {
                        address,
                        generation: snapshot.generation,
                    },
                )
            })
            .collect()
    }

    /// Opens a fresh record for a device arriving at `address`.
    pub(crate) fn attach(&self, address: Address, functions: Capabilities) -> DeviceHandle {
        let generation = self.cells[address.index()].reset(|generation| StatusSnapshot {
            attached: true,
            functions,
            ..StatusSnapshot::vacant(generation)
        });
        DeviceHandle {
            address,
            generation,
        }
    }

    /// Closes the record at `address`; pending writes for it are refused.
    pub(crate) fn retire(&self, address: Address) {
        self.cells[address.index()].reset(StatusSnapshot::vacant);
    }

    /// Records the driver a device is bound to.
    pub(crate) fn bind(&self, device: DeviceHandle, driver: Capabilities) -> bool {
        self.update(device, |s| StatusSnapshot {
            driver: Some(driver),
            ..*s
        })
    }

    /// Publishes a new status block for `device`.
    pub fn publish(&self, device: DeviceHandle, block: StatusBlock) -> bool {
        self.publish_with(device, |_| block)
    }

    /// Publishes a block derived from the current one.
    pub fn publish_with(
        &self,
        device: DeviceHandle,
        f: impl FnOnce(&StatusBlock) -> StatusBlock,
    ) -> bool {
        self.update(device, |s| StatusSnapshot {
            block: f(&s.block),
            sequence: s.sequence.wrapping_add(1),
            ..*s
        })
    }

    /// Stores `error` as the device's last error.
    pub fn record_error(&self, device: DeviceHandle, error: MapleError) -> bool {
        self.update(device, |s| StatusSnapshot {
            last_error: Some(error),
            ..*s
        })
    }

    fn update(&self, device: DeviceHandle, f: impl FnOnce(&StatusSnapshot) -> StatusSnapshot) -> bool {
        self.cells[device.address.index()].update(device.generation, f)
    }
}

/// Write access to one device's status record.
///
/// Handed to completion callbacks. Every write is checked against the
/// device generation, so a publisher outliving its device is harmless.
#[derive(Clone)]
pub struct Publisher {
    table: Arc<StatusTable>,
    device: DeviceHandle,
}

impl Publisher {
    pub(crate) fn new(table: Arc<StatusTable>, device: DeviceHandle) -> Self {
        Self { table, device }
    }

    /// Device this publisher writes for
    pub fn device(&self) -> DeviceHandle {
        self.device
    }

    /// True while the device is still attached.
    pub fn is_current(&self) -> bool {
        self.table.read(self.device).is_some()
    }

    /// Current record of the device.
    pub fn current(&self) -> Option<StatusSnapshot> {
        self.table.read(self.device)
    }

    pub fn publish(&self, block: StatusBlock) -> bool {
        self.table.publish(self.device, block)
    }

    pub fn publish_with(&self, f: impl FnOnce(&StatusBlock) -> StatusBlock) -> bool {
        self.table.publish_with(self.device, f)
    }

    /// Stores `error` as the device's last error; `false` once detached.
    pub fn record_error(&self, error: MapleError) -> bool {
        self.table.record_error(self.device, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::controller::ControllerState;
    use std::thread;

    fn a(port: u8, unit: u8) -> Address {
        Address::new(port, unit).unwrap()
    }

    #[test]
    fn test_cell_generation_gate() {
        let cell = StatusCell::new(0u32);
        assert!(cell.write(0, 5));
        let generation = cell.reset(|_| 10);
        assert_eq!(generation, 1);
        assert_eq!(cell.read(), 10);
        assert!(!cell.write(0, 7));
        assert!(cell.update(1, |v| v + 1));
        assert_eq!(cell.read(), 11);
    }

    #[test]
    fn test_attach_retire() {
        let table = StatusTable::new();
        let address = a(0, 0);
        let first = table.attach(address, Capabilities::CONTROLLER);
        assert!(table.read(first).is_some());
        assert!(table.publish(first, StatusBlock::Controller(ControllerState::default())));

        table.retire(address);
        assert_eq!(table.read(first), None);
        assert!(!table.publish(first, StatusBlock::Empty));

        let second = table.attach(address, Capabilities::CONTROLLER);
        assert_ne!(first.generation, second.generation);
        let snapshot = table.read(second).unwrap();
        assert_eq!(snapshot.block, StatusBlock::Empty);
        assert_eq!(snapshot.sequence, 0);

        // A stale write never reaches the new device
        assert!(!table.record_error(first, MapleError::NoResponse));
        assert_eq!(table.read(second).unwrap().last_error, None);
    }

    #[test]
    fn test_enumerate_in_address_order() {
        let table = StatusTable::new();
        table.attach(a(2, 0), Capabilities::CONTROLLER);
        table.attach(a(0, 1), Capabilities::MEMCARD | Capabilities::LCD);
        table.attach(a(0, 0), Capabilities::CONTROLLER);

        let pads: Vec<Address> = table
            .enumerate(Capabilities::CONTROLLER)
            .iter()
            .map(|d| d.address)
            .collect();
        assert_eq!(pads, [a(0, 0), a(2, 0)]);
        assert_eq!(table.enumerate(Capabilities::LCD).len(), 1);
    }

    #[test]
    fn test_concurrent_publish_never_tears() {
        const ROUNDS: u64 = 20_000;
        let cell = Arc::new(StatusCell::new([0u64; 16]));
        let generation = cell.reset(|_| [0u64; 16]);

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..ROUNDS {
                        let value = cell.read();
                        assert!(value.iter().all(|v| *v == value[0]), "torn read {:?}", value);
                        assert!(value[0] >= last);
                        last = value[0];
                    }
                })
            })
            .collect();

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        cell.update(generation, |v| [v[0] + 1; 16]);
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(cell.read(), [2 * ROUNDS; 16]);
    }

    #[test]
    fn test_publisher_outliving_device() {
        let table = Arc::new(StatusTable::new());
        let device = table.attach(a(1, 0), Capabilities::MOUSE);
        let publisher = Publisher::new(table.clone(), device);
        assert!(publisher.publish(StatusBlock::Empty));
        assert_eq!(table.read(device).unwrap().sequence, 1);

        table.retire(device.address);
        assert!(!publisher.is_current());
        assert!(!publisher.publish(StatusBlock::Empty));
        assert_eq!(table.read_address(device.address).sequence, 0);
    }
}
