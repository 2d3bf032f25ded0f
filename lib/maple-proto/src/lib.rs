//! # Maple Wire Protocol
//!
//! Frame layouts and payload structures shared by the S-MAPLE bus service and
//! anything else that has to speak to peripherals on the expansion bus.
//!
//! ## Frame Layout
//!
//! ```text
//! ┌─────────┬───────────┬──────────┬───────────────┬──────────────────────┐
//! │ byte 0  │  byte 1   │  byte 2  │    byte 3     │ payload (u32 LE) ... │
//! │ command │ recipient │  sender  │ payload words │                      │
//! └─────────┴───────────┴──────────┴───────────────┴──────────────────────┘
//! ```
//!
//! Every exchange is one request frame from the host followed by one response
//! frame from the addressed unit. The first payload word of class-specific
//! commands is the function code (see [`Capabilities`]) the command targets.

#![no_std]

extern crate alloc;

pub mod address;
pub mod command;
pub mod condition;
pub mod devinfo;
pub mod frame;
pub mod function;

pub use address::{Address, PORT_COUNT, SLOT_COUNT, SUB_UNIT_MASK, UNIT_COUNT};
pub use command::{Command, Response};
pub use condition::{
    BlockLocation, Buttons, ControllerCondition, MediaInfo, MouseButtons, MouseCondition,
};
pub use devinfo::{DeviceInfo, MemoryDefinition, DEVINFO_WORDS};
pub use frame::{Frame, MAX_PAYLOAD_WORDS};
pub use function::{Capabilities, PRECEDENCE};

/// Errors raised while decoding or building frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoError {
    /// Fewer words than the layout requires
    Truncated,
    /// Payload exceeds [`MAX_PAYLOAD_WORDS`]
    PayloadTooLong,
    /// Address byte does not name a single unit
    BadAddress,
    /// Payload targets a different function than expected
    WrongFunction,
    /// Response code is not the one the command expects
    UnexpectedResponse(u8),
}

impl core::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "frame truncated"),
            Self::PayloadTooLong => write!(f, "payload too long"),
            Self::BadAddress => write!(f, "bad unit address"),
            Self::WrongFunction => write!(f, "payload for another function"),
            Self::UnexpectedResponse(code) => write!(f, "unexpected response 0x{:02x}", code),
        }
    }
}
