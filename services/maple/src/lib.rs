//! # S-MAPLE: Peripheral Bus Service
//!
//! S-MAPLE owns the console's peripheral expansion bus: four ports, each
//! with a root unit (controller, mouse, light gun, ...) that may expose up
//! to five sub-units (memory cards, screens, vibration packs).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Clients (games, UI, fs)                      │
//! │          read_status / enumerate / submit    (any thread)        │
//! └───────────────┬───────────────────────────────▲──────────────────┘
//!                 │                               │
//!                 ▼                               │
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           MapleBus::tick                         │
//! │                                                                  │
//! │  poll ─► Scanner::collect ─► Registry::reconcile                 │
//! │                                     │                            │
//! │                                     ▼                            │
//! │        Scanner::reidentify ─► Registry::dispatch ─► expire       │
//! │                 │                   │                 │          │
//! │                 │                   │      Scanner::probe        │
//! │  ┌──────────────┐   publish   ┌─────┴──────┐          │          │
//! │  │ StatusTable  │◄────────────│  Drivers   │          │          │
//! │  │ (seqlock x2) │             └─────┬──────┘          │          │
//! │  └──────────────┘                   ▼                 ▼          │
//! │                             ┌─────────────────────────────┐      │
//! │                             │  Engine (one slot per unit) │      │
//! │                             └──────────────┬──────────────┘      │
//! └────────────────────────────────────────────┼─────────────────────┘
//!                                              ▼
//!                                  Transport (DMA / simulated)
//! ```
//!
//! The bus is driven by a periodic tick, normally the vertical blank.
//! Responses arrive asynchronously through [`Engine::complete`], which the
//! transport calls from its end-of-transfer interrupt. It only queues the
//! outcome; callbacks run when [`Engine::poll`] drains the queue at the
//! start of the next tick.
//!
//! ## Example
//!
//! ```ignore
//! let mut bus = MapleBus::new(BusConfig::default(), Box::new(dma))?;
//! bus.register_standard_drivers()?;
//!
//! // vblank handler
//! bus.tick();
//!
//! // anywhere
//! for pad in client.enumerate(Capabilities::CONTROLLER) {
//!     if let Some(StatusSnapshot { block: StatusBlock::Controller(state), .. }) =
//!         client.read_status(pad)
//!     {
//!         handle_input(state);
//!     }
//! }
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod registry;
pub mod scanner;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod status;
pub mod transport;

pub use bus::{BusClient, MapleBus, TickReport};
pub use config::BusConfig;
pub use device::{Device, DeviceHandle, DevicePrivate};
pub use driver::{DeviceContext, Driver};
pub use engine::{Completion, Engine};
pub use error::MapleError;
pub use status::{Publisher, StatusBlock, StatusSnapshot};
pub use transport::{TransferHandle, Transport, TransportError, TransportFault};

pub use maple_proto::{Address, Capabilities, Command, Response};

/// Service version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name used in logs and the service registry
pub const SERVICE_NAME: &str = "maple";
