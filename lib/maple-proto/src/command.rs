//! Request and response codes.

/// Requests sent by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Identity of the addressed unit
    DeviceInfo = 1,
    /// Identity plus extended free-form data
    AllInfo = 2,
    /// Soft reset
    Reset = 3,
    /// Shut the unit down until the next reset
    Kill = 4,
    /// Read the function's condition (buttons, axes, ...)
    GetCondition = 9,
    /// Read storage geometry
    GetMemoryInfo = 10,
    /// Read one block (or one phase of one)
    BlockRead = 11,
    /// Write one phase of a block
    BlockWrite = 12,
    /// Commit a phased block write
    BlockSync = 13,
    /// Set the function's condition (vibration, clock, ...)
    SetCondition = 14,
}

impl Command {
    /// Raw opcode byte
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Response code a successful exchange answers with.
    pub const fn expected_response(self) -> Response {
        match self {
            Command::DeviceInfo => Response::DeviceInfo,
            Command::AllInfo => Response::AllInfo,
            Command::GetCondition | Command::GetMemoryInfo | Command::BlockRead => {
                Response::DataTransfer
            }
            Command::Reset
            | Command::Kill
            | Command::BlockWrite
            | Command::BlockSync
            | Command::SetCondition => Response::Ok,
        }
    }

    /// Decodes a request opcode.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Command::DeviceInfo,
            2 => Command::AllInfo,
            3 => Command::Reset,
            4 => Command::Kill,
            9 => Command::GetCondition,
            10 => Command::GetMemoryInfo,
            11 => Command::BlockRead,
            12 => Command::BlockWrite,
            13 => Command::BlockSync,
            14 => Command::SetCondition,
            _ => return None,
        })
    }
}

/// Responses sent by a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Response {
    /// Identity record follows
    DeviceInfo = 5,
    /// Extended identity follows
    AllInfo = 6,
    /// Command accepted, no data
    Ok = 7,
    /// Data follows
    DataTransfer = 8,
    /// Storage-level failure
    FileError = 0xfb,
    /// Unit busy, ask again
    Again = 0xfc,
    /// Opcode not understood
    UnknownCommand = 0xfd,
    /// Function code not provided by this unit
    FunctionUnsupported = 0xfe,
    /// Nothing answered at this address
    None = 0xff,
}

impl Response {
    /// Raw code byte
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decodes a response code.
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            5 => Response::DeviceInfo,
            6 => Response::AllInfo,
            7 => Response::Ok,
            8 => Response::DataTransfer,
            0xfb => Response::FileError,
            0xfc => Response::Again,
            0xfd => Response::UnknownCommand,
            0xfe => Response::FunctionUnsupported,
            0xff => Response::None,
            _ => return None,
        })
    }

    /// Error codes occupy the top of the byte range.
    pub const fn is_error(self) -> bool {
        (self as u8) >= 0xfb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_responses() {
        assert_eq!(Command::DeviceInfo.expected_response(), Response::DeviceInfo);
        assert_eq!(Command::BlockRead.expected_response(), Response::DataTransfer);
        assert_eq!(Command::BlockWrite.expected_response(), Response::Ok);
    }

    #[test]
    fn test_error_codes() {
        assert!(Response::None.is_error());
        assert!(Response::Again.is_error());
        assert!(!Response::DataTransfer.is_error());
        assert_eq!(Response::from_code(0xfe), Some(Response::FunctionUnsupported));
        assert_eq!(Response::from_code(0x42), None);
        assert_eq!(Command::from_code(13), Some(Command::BlockSync));
    }
}
