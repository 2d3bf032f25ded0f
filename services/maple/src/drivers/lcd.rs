//! LCD screens (memory unit displays).
//!
//! The screen is 48 x 32 monochrome pixels, written in one block with
//! BWRITE. Rendering text or images onto a [`LcdFrame`] is up to the caller.

use alloc::vec;
use alloc::vec::Vec;

use maple_proto::{BlockLocation, Capabilities, Command, Response};

use crate::bus::BusClient;
use crate::device::DeviceHandle;
use crate::driver::{DeviceContext, Driver};
use crate::engine::Completion;
use crate::status::{Publisher, StatusBlock};
use crate::MapleError;

/// Screen width in pixels
pub const LCD_WIDTH: usize = 48;
/// Screen height in pixels
pub const LCD_HEIGHT: usize = 32;
/// Framebuffer size, 1 bit per pixel
pub const LCD_BYTES: usize = LCD_WIDTH * LCD_HEIGHT / 8;

const ORIGIN: &str = "lcd";

/// 1 bpp framebuffer, rows top to bottom, most significant bit leftmost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LcdFrame([u8; LCD_BYTES]);

impl Default for LcdFrame {
    fn default() -> Self {
        Self::blank()
    }
}

impl LcdFrame {
    pub const fn blank() -> Self {
        Self([0; LCD_BYTES])
    }

    /// Wraps a raw bitmap; `None` unless exactly [`LCD_BYTES`] long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; LCD_BYTES] {
        &self.0
    }

    /// Sets one pixel. Out-of-range coordinates are ignored.
    pub fn set(&mut self, x: usize, y: usize, on: bool) {
        if let Some((byte, mask)) = Self::locate(x, y) {
            if on {
                self.0[byte] |= mask;
            } else {
                self.0[byte] &= !mask;
            }
        }
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        matches!(Self::locate(x, y), Some((byte, mask)) if self.0[byte] & mask != 0)
    }

    fn locate(x: usize, y: usize) -> Option<(usize, u8)> {
        if x >= LCD_WIDTH || y >= LCD_HEIGHT {
            return None;
        }
        Some((y * LCD_WIDTH / 8 + x / 8, 0x80 >> (x % 8)))
    }

    fn to_words(&self) -> Vec<u32> {
        self.0
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// Clears LCDs as they attach.
#[derive(Debug, Default)]
pub struct LcdDriver;

impl LcdDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for LcdDriver {
    fn name(&self) -> &'static str {
        "lcd"
    }

    fn attach(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        let publisher = dev.publisher();
        let blank = LcdFrame::blank();
        dev.submit(Command::BlockWrite, write_payload(&blank), move |result| {
            commit(&publisher, &blank, acknowledged(result));
        })?;
        Ok(())
    }
}

fn write_payload(frame: &LcdFrame) -> Vec<u32> {
    let mut payload = vec![Capabilities::LCD.bits(), BlockLocation::block(0).to_word()];
    payload.extend(frame.to_words());
    payload
}

fn acknowledged(result: Completion) -> Result<(), MapleError> {
    result.and_then(|reply| {
        reply.expect(Response::Ok)?;
        Ok(())
    })
}

fn commit(publisher: &Publisher, frame: &LcdFrame, result: Result<(), MapleError>) {
    match result {
        Ok(()) => {
            publisher.publish(StatusBlock::Lcd(*frame));
        }
        Err(err) => {
            publisher.record_error(err);
        }
    }
}

/// Sends `frame` to the screen of `device`.
///
/// The committed frame becomes the device's status block when the device is
/// bound to the LCD driver; otherwise only `done` hears about it.
pub fn draw(
    client: &BusClient,
    device: DeviceHandle,
    frame: &LcdFrame,
    done: impl FnOnce(Result<(), MapleError>) + Send + 'static,
) -> Result<(), MapleError> {
    let status = client.read_status(device).ok_or(MapleError::DeviceGone)?;
    if !status.functions.contains(Capabilities::LCD) {
        return Err(MapleError::InvalidArgument);
    }
    let publisher = (status.driver == Some(Capabilities::LCD)).then(|| client.publisher(device));
    let frame = *frame;
    client.submit(
        device,
        Command::BlockWrite,
        write_payload(&frame),
        ORIGIN,
        move |result| {
            let result = acknowledged(result);
            if let Some(publisher) = publisher {
                commit(&publisher, &frame, result);
            }
            done(result);
        },
    )?;
    Ok(())
}
