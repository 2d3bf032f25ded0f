//! # Bus Errors
//!
//! Registration errors are local configuration mistakes reported to the
//! caller. Transaction errors are recorded on the device they concern and
//! surfaced through its status record. None of them stop the bus.

use core::fmt;

use maple_proto::{ProtoError, Response};

/// S-MAPLE error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapleError {
    /// Another driver already owns the capability
    CapabilityTaken,
    /// Capability mask is empty, unknown or names several functions
    InvalidCapability,
    /// No driver registered for the capability
    DriverNotFound,
    /// A transaction is already outstanding at the address
    AddressBusy,
    /// Transport refused the submission or lost the transfer
    TransportUnavailable,
    /// No terminal event within the bus-cycle budget
    TransportTimeout,
    /// Response could not be decoded or came from the wrong unit
    MalformedResponse,
    /// Nothing answered at the address
    NoResponse,
    /// The unit answered with an error code
    Refused(Response),
    /// The device behind a handle has been detached
    DeviceGone,
    /// Invalid argument
    InvalidArgument,
}

impl MapleError {
    /// Transient back-pressure, retried on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::AddressBusy | Self::Refused(Response::Again))
    }
}

impl fmt::Display for MapleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapabilityTaken => write!(f, "capability already claimed"),
            Self::InvalidCapability => write!(f, "invalid capability"),
            Self::DriverNotFound => write!(f, "driver not found"),
            Self::AddressBusy => write!(f, "address busy"),
            Self::TransportUnavailable => write!(f, "transport unavailable"),
            Self::TransportTimeout => write!(f, "transport timeout"),
            Self::MalformedResponse => write!(f, "malformed response"),
            Self::NoResponse => write!(f, "no response"),
            Self::Refused(code) => write!(f, "refused by unit ({:?})", code),
            Self::DeviceGone => write!(f, "device gone"),
            Self::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl From<ProtoError> for MapleError {
    fn from(_: ProtoError) -> Self {
        Self::MalformedResponse
    }
}
