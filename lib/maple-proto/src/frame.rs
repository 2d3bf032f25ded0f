//! Frame encoding and decoding.

use alloc::vec::Vec;

use crate::address::{Address, SUB_UNIT_MASK};
use crate::command::{Command, Response};
use crate::ProtoError;

/// Largest payload a header can describe, in 32-bit words
pub const MAX_PAYLOAD_WORDS: usize = 255;

/// One bus frame, request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command or response code
    pub code: u8,
    /// Recipient address byte
    pub recipient: u8,
    /// Sender address byte
    pub sender: u8,
    /// Payload words
    pub payload: Vec<u32>,
}

impl Frame {
    /// Builds a host request to `to`.
    pub fn request(command: Command, to: Address, payload: Vec<u32>) -> Result<Self, ProtoError> {
        if payload.len() > MAX_PAYLOAD_WORDS {
            return Err(ProtoError::PayloadTooLong);
        }
        Ok(Self {
            code: command.code(),
            recipient: to.to_wire(),
            sender: to.host_wire(),
            payload,
        })
    }

    /// Builds a unit's response to `request`.
    ///
    /// `sub_units` is only meaningful when the responder is a root unit.
    pub fn reply(request: &Frame, response: Response, sub_units: u8, payload: Vec<u32>) -> Self {
        let mut sender = request.recipient;
        if sender & 0x20 != 0 {
            sender = (sender & !SUB_UNIT_MASK) | (sub_units & SUB_UNIT_MASK);
        }
        Self {
            code: response.code(),
            recipient: request.sender,
            sender,
            payload,
        }
    }

    /// Header word: `code | recipient << 8 | sender << 16 | len << 24`.
    pub fn header(&self) -> u32 {
        let len = self.payload.len().min(MAX_PAYLOAD_WORDS) as u32;
        u32::from(self.code)
            | u32::from(self.recipient) << 8
            | u32::from(self.sender) << 16
            | len << 24
    }

    /// Serializes header and payload as words.
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(self.payload.len() + 1);
        words.push(self.header());
        words.extend_from_slice(&self.payload[..self.payload.len().min(MAX_PAYLOAD_WORDS)]);
        words
    }

    /// Parses a frame from a receive buffer.
    ///
    /// Receive buffers are usually larger than the frame; trailing words past
    /// the length in the header are ignored.
    pub fn from_words(words: &[u32]) -> Result<Self, ProtoError> {
        let header = *words.first().ok_or(ProtoError::Truncated)?;
        let len = (header >> 24) as usize;
        let body = words.get(1..1 + len).ok_or(ProtoError::Truncated)?;
        Ok(Self {
            code: header as u8,
            recipient: (header >> 8) as u8,
            sender: (header >> 16) as u8,
            payload: body.to_vec(),
        })
    }

    /// Serializes to little-endian bytes, as placed in a DMA buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_words()
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect()
    }

    /// Parses little-endian bytes from a DMA buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::from_words(&words)
    }

    /// Decoded response code, if this is a known response.
    pub fn response(&self) -> Option<Response> {
        Response::from_code(self.code)
    }

    /// Address of the unit that sent this frame.
    pub fn source(&self) -> Option<Address> {
        Address::from_wire(self.sender)
    }

    /// Sub-unit presence mask reported by a root unit (0 otherwise).
    pub fn sub_units(&self) -> u8 {
        if self.sender & 0x20 != 0 {
            self.sender & SUB_UNIT_MASK
        } else {
            0
        }
    }

    /// Function code in the first payload word.
    pub fn function(&self) -> Option<u32> {
        self.payload.first().copied()
    }

    /// Checks the response code and returns the payload.
    pub fn expect(&self, response: Response) -> Result<&[u32], ProtoError> {
        if self.code != response.code() {
            return Err(ProtoError::UnexpectedResponse(self.code));
        }
        Ok(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_header_layout() {
        let to = Address::new(1, 2).unwrap();
        let frame = Frame::request(Command::GetCondition, to, vec![0x0100_0000]).unwrap();
        // code 9, recipient 0x42, sender 0x40, one payload word
        assert_eq!(frame.header(), 0x0140_4209);
        assert_eq!(&frame.to_bytes()[..4], &[0x09, 0x42, 0x40, 0x01]);
    }

    #[test]
    fn test_parse_ignores_buffer_tail() {
        let words = [0x0220_0005u32, 1, 2, 0xdead_beef, 0xdead_beef];
        let frame = Frame::from_words(&words).unwrap();
        assert_eq!(frame.payload, vec![1, 2]);
        assert_eq!(frame.response(), Some(Response::DeviceInfo));
        assert_eq!(frame.source(), Address::root(0));
    }

    #[test]
    fn test_truncated() {
        assert_eq!(Frame::from_words(&[]), Err(ProtoError::Truncated));
        assert_eq!(Frame::from_words(&[0x0300_0008, 1]), Err(ProtoError::Truncated));
        assert_eq!(Frame::from_bytes(&[0x08, 0, 0]), Err(ProtoError::Truncated));
    }

    #[test]
    fn test_reply_carries_sub_unit_mask() {
        let req = Frame::request(Command::DeviceInfo, Address::root(3).unwrap(), vec![]).unwrap();
        let resp = Frame::reply(&req, Response::DeviceInfo, 0b00101, vec![]);
        assert_eq!(resp.recipient, 0xC0);
        assert_eq!(resp.sender, 0xE5);
        assert_eq!(resp.sub_units(), 0b00101);
        assert_eq!(resp.source(), Address::root(3));
    }

    #[test]
    fn test_payload_limit() {
        let to = Address::root(0).unwrap();
        let too_long = vec![0u32; MAX_PAYLOAD_WORDS + 1];
        assert_eq!(
            Frame::request(Command::BlockWrite, to, too_long),
            Err(ProtoError::PayloadTooLong)
        );
    }

    #[test]
    fn test_expect() {
        let req = Frame::request(Command::GetCondition, Address::root(0).unwrap(), vec![]).unwrap();
        let resp = Frame::reply(&req, Response::FunctionUnsupported, 0, vec![]);
        assert_eq!(
            resp.expect(Response::DataTransfer),
            Err(ProtoError::UnexpectedResponse(0xfe))
        );
    }
}
