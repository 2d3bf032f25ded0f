//! # Bus Transport
//!
//! The DMA engine that moves frames over the wire. The bus service only
//! needs to hand it a frame and later hear back exactly once per accepted
//! frame; the interrupt handler reports the outcome through
//! [`Engine::complete`](crate::engine::Engine::complete).

use maple_proto::Frame;

/// Identifies one submission between the engine and the transport.
///
/// The low bits name the address slot, the rest is a per-submission sequence
/// number, so a completion for an abandoned submission never matches the
/// slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u32);

impl TransferHandle {
    const SLOT_BITS: u32 = 5;
    const SLOT_MASK: u32 = (1 << Self::SLOT_BITS) - 1;

    pub(crate) const fn new(slot: usize, sequence: u32) -> Self {
        Self((sequence << Self::SLOT_BITS) | (slot as u32 & Self::SLOT_MASK))
    }

    /// Address slot this handle belongs to
    pub const fn slot(&self) -> usize {
        (self.0 & Self::SLOT_MASK) as usize
    }

    /// Raw value, for transports that keep handles in hardware descriptors
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from [`TransferHandle::raw`].
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// Submission refused by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// DMA engine disabled or not initialized
    Offline,
    /// Descriptor queue full for this cycle
    QueueFull,
}

/// Transfer-level failure reported instead of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFault {
    /// Hardware gave up waiting for the unit
    Timeout,
    /// DMA or framing error
    Dma,
}

/// Terminal event for one accepted submission
pub type Outcome = Result<Frame, TransportFault>;

/// Frame channel to the bus.
pub trait Transport: Send + Sync {
    /// Queues `frame` for transfer.
    ///
    /// On `Ok` the transport owes exactly one [`Outcome`] for `handle`. It may
    /// deliver it from inside this call.
    fn submit(&self, handle: TransferHandle, frame: &Frame) -> Result<(), TransportError>;

    /// Drops a queued transfer the engine no longer waits for.
    fn cancel(&self, _handle: TransferHandle) {}
}
