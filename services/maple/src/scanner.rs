//! # Bus Scanner
//!
//! Walks the port/unit address space once per tick and turns identity
//! responses into a [`Snapshot`]. A scan is split across two ticks:
//!
//! ```text
//!   tick N:   ... dispatch ─► expire ─► probe()   DeviceInfo to every idle address
//!                                          │
//!                               IRQ ◄──────┘  results land in the probe table
//!                                          │
//!   tick N+1: collect() ─► Snapshot ─► reconcile ─► reidentify() ─► dispatch ...
//! ```
//!
//! Root units are settled before sub-units. A sub-unit entry only counts
//! when its root unit is present in the same snapshot and reports the
//! sub-unit's bit in its hub mask; otherwise it is empty. Probes that have
//! not completed by `collect()` are absent for that cycle and are not
//! retried.
//!
//! A device whose driver polls it every tick keeps its slot busy when
//! `probe()` runs. Such devices are identified again by `reidentify()`,
//! which claims the slot ahead of dispatch, every
//! [`BusConfig::reidentify_ticks`] or as soon as the unit refuses the
//! function its driver addressed.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use maple_proto::{Address, Command, DeviceInfo, Response, PORT_COUNT, SLOT_COUNT};
use spin::Mutex;

use crate::config::BusConfig;
use crate::engine::{Engine, Evidence};
use crate::registry::Registry;
use crate::MapleError;

const ORIGIN: &str = "scanner";

/// Scan result for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEntry {
    /// Nothing there this cycle
    Empty,
    /// Unit answered the identity request
    Present(DeviceInfo),
    /// Not probed (busy with a driver transaction) and not seen leaving
    Unchanged,
}

/// Presence and identity of every address for one bus cycle.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entries: [ScanEntry; SLOT_COUNT],
}

impl Snapshot {
    /// Snapshot with every address empty
    pub fn empty() -> Self {
        Self {
            entries: [ScanEntry::Empty; SLOT_COUNT],
        }
    }

    pub fn entry(&self, address: Address) -> &ScanEntry {
        &self.entries[address.index()]
    }

    pub fn set(&mut self, address: Address, entry: ScanEntry) {
        self.entries[address.index()] = entry;
    }

    /// Addresses that answered this cycle
    pub fn present(&self) -> impl Iterator<Item = (Address, &DeviceInfo)> {
        Address::all().filter_map(|address| match self.entry(address) {
            ScanEntry::Present(info) => Some((address, info)),
            _ => None,
        })
    }
}

/// Identity probe state for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Idle,
    Pending(u32),
    Answered(DeviceInfo),
    Silent,
    Failed,
}

/// Topology walker.
pub struct Scanner {
    config: BusConfig,
    probes: Arc<[Mutex<Probe>; SLOT_COUNT]>,
    /// Hub masks of the last collected snapshot
    hubs: [u8; PORT_COUNT],
    /// Tick of the last identity answer per address
    identified_at: [u64; SLOT_COUNT],
    /// Tracked addresses to identify again before the next dispatch
    due: [bool; SLOT_COUNT],
    round: AtomicU32,
}

impl Scanner {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            probes: Arc::new(core::array::from_fn(|_| Mutex::new(Probe::Idle))),
            hubs: [0; PORT_COUNT],
            identified_at: [0; SLOT_COUNT],
            due: [false; SLOT_COUNT],
            round: AtomicU32::new(0),
        }
    }

    /// Hub mask of `port` as of the last snapshot
    pub fn hub_mask(&self, port: u8) -> u8 {
        self.hubs.get(usize::from(port)).copied().unwrap_or(0)
    }

    /// Builds the snapshot from the previous round of probes.
    pub fn collect(&mut self, engine: &Engine, registry: &Registry) -> Snapshot {
        let mut snapshot = Snapshot::empty();
        let mut hubs = [0u8; PORT_COUNT];
        let roots: Vec<Address> = self.roots().collect();
        let sub_units: Vec<Address> = self.sub_units().collect();

        for address in roots {
            let entry = self.settle(address, engine, registry);
            let port = usize::from(address.port());
            hubs[port] = match entry {
                ScanEntry::Empty => 0,
                _ => engine.hub_mask(address.port()),
            };
            snapshot.set(address, entry);
        }

        for address in sub_units {
            let entry = self.settle(address, engine, registry);
            let gated = hubs[usize::from(address.port())] & address.sub_unit_bit() != 0;
            if gated && self.config.probe_sub_units {
                snapshot.set(address, entry);
            }
        }

        self.hubs = hubs;
        snapshot
    }

    /// Issues identity requests to every idle address in the topology.
    ///
    /// Returns the number of requests submitted.
    pub fn probe(&self, engine: &Engine) -> usize {
        let round = self.round.fetch_add(1, Ordering::Relaxed);
        let subs = self.sub_units().filter(|address| {
            self.config.probe_sub_units
                && self.hub_mask(address.port()) & address.sub_unit_bit() != 0
        });
        let targets: Vec<Address> = self.roots().chain(subs).collect();
        targets
            .into_iter()
            .filter(|address| !engine.is_busy(*address))
            .filter(|address| self.request(engine, *address, round))
            .count()
    }

    /// Identifies tracked devices that are due again, ahead of dispatch.
    ///
    /// Returns the number of requests submitted.
    pub fn reidentify(&self, engine: &Engine, registry: &Registry) -> usize {
        let round = self.round.fetch_add(1, Ordering::Relaxed);
        let targets: Vec<Address> = Address::all()
            .filter(|address| self.due[address.index()] && registry.is_tracked(*address))
            .collect();
        targets
            .into_iter()
            .filter(|address| !engine.is_busy(*address))
            .filter(|address| {
                log::trace!("maple: identifying {} again", address);
                self.request(engine, *address, round)
            })
            .count()
    }

    /// Sends one identity request tagged with `round`.
    fn request(&self, engine: &Engine, address: Address, round: u32) -> bool {
        let index = address.index();
        *self.probes[index].lock() = Probe::Pending(round);
        let probes = self.probes.clone();
        let submitted = engine.submit(
            address,
            Command::DeviceInfo,
            Vec::new(),
            ORIGIN,
            move |result| {
                let outcome = match result {
                    Ok(frame) => match identify(&frame) {
                        Ok(info) => Probe::Answered(info),
                        Err(_) => Probe::Failed,
                    },
                    Err(MapleError::NoResponse) | Err(MapleError::TransportTimeout) => {
                        Probe::Silent
                    }
                    Err(_) => Probe::Failed,
                };
                let mut slot = probes[index].lock();
                if *slot == Probe::Pending(round) {
                    *slot = outcome;
                }
            },
        );
        match submitted {
            Ok(_) => true,
            Err(err) => {
                log::debug!("maple: probe {} not sent: {}", address, err);
                *self.probes[index].lock() = Probe::Idle;
                false
            }
        }
    }

    fn settle(&mut self, address: Address, engine: &Engine, registry: &Registry) -> ScanEntry {
        let index = address.index();
        let probe = core::mem::replace(&mut *self.probes[index].lock(), Probe::Idle);
        let evidence = engine.take_evidence(address);
        let tracked = registry.is_tracked(address);
        let now = engine.now();
        self.due[index] = false;
        match probe {
            Probe::Answered(info) => {
                self.identified_at[index] = now;
                ScanEntry::Present(info)
            }
            Probe::Pending(_) | Probe::Silent => ScanEntry::Empty,
            Probe::Failed if tracked => ScanEntry::Unchanged,
            Probe::Failed => ScanEntry::Empty,
            Probe::Idle => match evidence {
                Some(Evidence::Silent) => ScanEntry::Empty,
                _ if tracked => {
                    let stale = now.saturating_sub(self.identified_at[index])
                        >= self.config.reidentify_ticks;
                    self.due[index] = stale || evidence == Some(Evidence::Mismatch);
                    ScanEntry::Unchanged
                }
                _ => ScanEntry::Empty,
            },
        }
    }

    fn roots(&self) -> impl Iterator<Item = Address> {
        (0..self.config.ports as u8).filter_map(Address::root)
    }

    fn sub_units(&self) -> impl Iterator<Item = Address> {
        let units = self.config.units as u8;
        (0..self.config.ports as u8)
            .flat_map(move |port| (1..units).filter_map(move |unit| Address::new(port, unit)))
    }
}

fn identify(frame: &maple_proto::Frame) -> Result<DeviceInfo, MapleError> {
    let payload = frame.expect(Response::DeviceInfo)?;
    Ok(DeviceInfo::parse(payload)?)
}
