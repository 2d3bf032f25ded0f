//! # Memory Card Driver
//!
//! Tracks the media geometry of memory units and provides asynchronous block
//! access for the filesystem layer above.
//!
//! ## Block Writes
//!
//! A block is written in `write_accesses` phases, each carrying an equal
//! slice of the block, and then committed with a sync:
//!
//! ```text
//!   BWRITE phase 0 ─► OK ─► BWRITE phase 1 ─► OK ─► ... ─► BSYNC ─► OK ─► done
//! ```
//!
//! Each step is submitted from the previous step's completion, so the whole
//! exchange holds the address for a few bus cycles at most. Any failure ends
//! the exchange and is reported to the caller; the unit drops unsynced data.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use maple_proto::{BlockLocation, Capabilities, Command, Frame, MediaInfo, MemoryDefinition, Response};
use spin::Mutex;

use crate::bus::BusClient;
use crate::device::{DeviceHandle, DevicePrivate, StoragePrivate};
use crate::driver::{DeviceContext, Driver};
use crate::status::{Publisher, StatusBlock};
use crate::MapleError;

const ORIGIN: &str = "memcard";

/// Default media refresh period, one second at 60 Hz
pub const DEFAULT_REFRESH_TICKS: u32 = 60;

/// Storage status published for memory cards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageStatus {
    /// Layout from the identity record
    pub definition: MemoryDefinition,
    /// Geometry from the last media query
    pub media: Option<MediaInfo>,
}

/// Completion for application block requests
pub type BlockDone<T> = Box<dyn FnOnce(Result<T, MapleError>) + Send>;

/// Memory card class driver.
#[derive(Debug)]
pub struct MemCardDriver {
    refresh_ticks: u32,
}

impl Default for MemCardDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCardDriver {
    pub fn new() -> Self {
        Self::with_refresh(DEFAULT_REFRESH_TICKS)
    }

    /// Queries media geometry every `ticks` ticks.
    pub fn with_refresh(ticks: u32) -> Self {
        Self {
            refresh_ticks: ticks.max(1),
        }
    }
}

impl Driver for MemCardDriver {
    fn name(&self) -> &'static str {
        "memcard"
    }

    fn attach(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        let definition = dev.info().memory_definition().unwrap_or_default();
        *dev.private_mut() = DevicePrivate::Storage(StoragePrivate {
            definition,
            refresh_in: self.refresh_ticks,
        });
        dev.publisher().publish(StatusBlock::Storage(StorageStatus {
            definition,
            media: None,
        }));
        request_media(dev)
    }

    fn periodic(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        let due = match dev.private_mut() {
            DevicePrivate::Storage(state) => {
                state.refresh_in = state.refresh_in.saturating_sub(1);
                state.refresh_in == 0
            }
            _ => return Err(MapleError::InvalidArgument),
        };
        if !due {
            return Ok(());
        }
        request_media(dev)?;
        if let DevicePrivate::Storage(state) = dev.private_mut() {
            state.refresh_in = self.refresh_ticks;
        }
        Ok(())
    }
}

fn request_media(dev: &DeviceContext<'_>) -> Result<(), MapleError> {
    let publisher = dev.publisher();
    dev.submit(
        Command::GetMemoryInfo,
        vec![Capabilities::MEMCARD.bits(), 0],
        move |result| media_done(&publisher, result),
    )?;
    Ok(())
}

fn media_done(publisher: &Publisher, result: Result<Frame, MapleError>) {
    let media = result.and_then(|frame| {
        let payload = frame.expect(Response::DataTransfer)?;
        Ok(MediaInfo::parse(payload)?)
    });
    match media {
        Ok(media) => {
            publisher.publish_with(|prev| {
                let definition = match prev {
                    StatusBlock::Storage(status) => status.definition,
                    _ => MemoryDefinition::default(),
                };
                StatusBlock::Storage(StorageStatus {
                    definition,
                    media: Some(media),
                })
            });
        }
        Err(err) => {
            publisher.record_error(err);
        }
    }
}

/// Layout of an attached memory card.
fn definition(client: &BusClient, device: DeviceHandle) -> Result<MemoryDefinition, MapleError> {
    let status = client.read_status(device).ok_or(MapleError::DeviceGone)?;
    match status.block {
        StatusBlock::Storage(storage) => Ok(storage.definition),
        _ => Err(MapleError::InvalidArgument),
    }
}

/// Reads one block.
///
/// Returns once the request is queued; `done` receives the block contents.
pub fn read_block(
    client: &BusClient,
    device: DeviceHandle,
    block: u16,
    done: impl FnOnce(Result<Vec<u8>, MapleError>) + Send + 'static,
) -> Result<(), MapleError> {
    let definition = definition(client, device)?;
    let location = BlockLocation::block(block);
    client.submit(
        device,
        Command::BlockRead,
        vec![Capabilities::MEMCARD.bits(), location.to_word()],
        ORIGIN,
        move |result| {
            done(result.and_then(|frame| {
                let payload = frame.expect(Response::DataTransfer)?;
                // Function word and location word precede the data
                let data = payload.get(2..).ok_or(MapleError::MalformedResponse)?;
                if BlockLocation::from_word(payload[1]).block != block {
                    return Err(MapleError::MalformedResponse);
                }
                let bytes: Vec<u8> = data.iter().flat_map(|w| w.to_le_bytes()).collect();
                if bytes.len() < usize::from(definition.block_size) {
                    return Err(MapleError::MalformedResponse);
                }
                Ok(bytes[..usize::from(definition.block_size)].to_vec())
            }))
        },
    )?;
    Ok(())
}

/// Writes one block in phases and syncs it.
///
/// `data` must be exactly one block. Returns once the first phase is queued;
/// `done` runs after the sync completes or any step fails.
pub fn write_block(
    client: &BusClient,
    device: DeviceHandle,
    block: u16,
    data: &[u8],
    done: impl FnOnce(Result<(), MapleError>) + Send + 'static,
) -> Result<(), MapleError> {
    let definition = definition(client, device)?;
    if data.len() != usize::from(definition.block_size) {
        return Err(MapleError::InvalidArgument);
    }
    let phase_bytes = definition.write_phase_bytes();
    if phase_bytes == 0 || phase_bytes % 4 != 0 {
        return Err(MapleError::InvalidArgument);
    }
    let phases: Vec<Vec<u32>> = data
        .chunks(phase_bytes)
        .map(|chunk| {
            chunk
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect();
    let done: BlockDone<()> = Box::new(done);
    let job = WriteJob {
        client: client.clone(),
        device,
        location: BlockLocation::block(block),
        phases: Arc::new(phases),
        done: Arc::new(Mutex::new(Some(done))),
    };
    job.submit(0)
}

/// State carried between the steps of one block write
#[derive(Clone)]
struct WriteJob {
    client: BusClient,
    device: DeviceHandle,
    location: BlockLocation,
    phases: Arc<Vec<Vec<u32>>>,
    done: Arc<Mutex<Option<BlockDone<()>>>>,
}

impl WriteJob {
    fn finish(&self, result: Result<(), MapleError>) {
        let done = self.done.lock().take();
        if let Some(done) = done {
            done(result);
        }
    }

    /// Submits write phase `phase`, or the sync once every phase is written.
    fn submit(&self, phase: usize) -> Result<(), MapleError> {
        let function = Capabilities::MEMCARD.bits();
        let (command, payload) = match self.phases.get(phase) {
            Some(words) => {
                let mut payload = vec![function, self.location.with_phase(phase as u8).to_word()];
                payload.extend_from_slice(words);
                (Command::BlockWrite, payload)
            }
            None => {
                let sync = self.location.with_phase(self.phases.len() as u8);
                (Command::BlockSync, vec![function, sync.to_word()])
            }
        };
        let job = self.clone();
        self.client
            .submit(self.device, command, payload, ORIGIN, move |result| {
                let step = result.and_then(|frame| {
                    frame.expect(Response::Ok)?;
                    Ok(())
                });
                match step {
                    Err(err) => job.finish(Err(err)),
                    Ok(()) if phase >= job.phases.len() => job.finish(Ok(())),
                    Ok(()) => {
                        if let Err(err) = job.submit(phase + 1) {
                            job.finish(Err(err));
                        }
                    }
                }
            })?;
        Ok(())
    }
}
