//! Class-specific payload layouts.
//!
//! Condition payloads start with the function code word, followed by the
//! function's fixed-layout data. Button fields on the wire are active low.

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::function::Capabilities;
use crate::ProtoError;

bitflags! {
    /// Controller buttons (set = pressed once decoded)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u16 {
        const C = 1 << 0;
        const B = 1 << 1;
        const A = 1 << 2;
        const START = 1 << 3;
        const DPAD_UP = 1 << 4;
        const DPAD_DOWN = 1 << 5;
        const DPAD_LEFT = 1 << 6;
        const DPAD_RIGHT = 1 << 7;
        const Z = 1 << 8;
        const Y = 1 << 9;
        const X = 1 << 10;
        const D = 1 << 11;
        const DPAD2_UP = 1 << 12;
        const DPAD2_DOWN = 1 << 13;
        const DPAD2_LEFT = 1 << 14;
        const DPAD2_RIGHT = 1 << 15;
    }
}

bitflags! {
    /// Mouse buttons (set = pressed once decoded)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MouseButtons: u32 {
        const RIGHT = 1 << 1;
        const LEFT = 1 << 2;
        const SIDE = 1 << 3;
    }
}

/// Checks the function word and returns the data words after it.
fn body(payload: &[u32], function: Capabilities, words: usize) -> Result<&[u32], ProtoError> {
    let first = *payload.first().ok_or(ProtoError::Truncated)?;
    if first != function.bits() {
        return Err(ProtoError::WrongFunction);
    }
    payload.get(1..1 + words).ok_or(ProtoError::Truncated)
}

/// Raw controller condition, as sent by the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerCondition {
    /// Button bits, active low
    pub buttons: u16,
    /// Right trigger (0 = released)
    pub rtrig: u8,
    /// Left trigger (0 = released)
    pub ltrig: u8,
    /// Main stick X, centered at 128
    pub joyx: u8,
    /// Main stick Y, centered at 128
    pub joyy: u8,
    /// Second stick X, centered at 128
    pub joy2x: u8,
    /// Second stick Y, centered at 128
    pub joy2y: u8,
}

impl ControllerCondition {
    /// Condition of an idle controller.
    pub const IDLE: Self = Self {
        buttons: 0xffff,
        rtrig: 0,
        ltrig: 0,
        joyx: 128,
        joyy: 128,
        joy2x: 128,
        joy2y: 128,
    };

    /// Parses a `GetCondition` payload for `function`.
    ///
    /// Light guns report buttons through the controller layout, so the
    /// function word is a parameter.
    pub fn parse_for(payload: &[u32], function: Capabilities) -> Result<Self, ProtoError> {
        let data = body(payload, function, 2)?;
        let [w0, w1] = [data[0].to_le_bytes(), data[1].to_le_bytes()];
        Ok(Self {
            buttons: u16::from_le_bytes([w0[0], w0[1]]),
            rtrig: w0[2],
            ltrig: w0[3],
            joyx: w1[0],
            joyy: w1[1],
            joy2x: w1[2],
            joy2y: w1[3],
        })
    }

    /// Parses a controller `GetCondition` payload.
    pub fn parse(payload: &[u32]) -> Result<Self, ProtoError> {
        Self::parse_for(payload, Capabilities::CONTROLLER)
    }

    /// Payload words as the unit sends them.
    pub fn to_words(&self, function: Capabilities) -> Vec<u32> {
        let w0 = u32::from(self.buttons) | u32::from(self.rtrig) << 16 | u32::from(self.ltrig) << 24;
        let w1 = u32::from_le_bytes([self.joyx, self.joyy, self.joy2x, self.joy2y]);
        vec![function.bits(), w0, w1]
    }

    /// Pressed buttons.
    pub fn pressed(&self) -> Buttons {
        Buttons::from_bits_retain(!self.buttons)
    }
}

/// Raw mouse condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseCondition {
    /// Button bits, active low
    pub buttons: u32,
    /// X delta, centered at [`MouseCondition::CENTER`]
    pub dx: u16,
    /// Y delta, centered at [`MouseCondition::CENTER`]
    pub dy: u16,
    /// Wheel delta, centered at [`MouseCondition::CENTER`]
    pub dz: u16,
}

impl MouseCondition {
    /// Zero point of the delta fields
    pub const CENTER: u16 = 0x200;

    /// Parses a mouse `GetCondition` payload.
    pub fn parse(payload: &[u32]) -> Result<Self, ProtoError> {
        let data = body(payload, Capabilities::MOUSE, 4)?;
        Ok(Self {
            buttons: data[0],
            dx: data[2] as u16,
            dy: (data[2] >> 16) as u16,
            dz: data[3] as u16,
        })
    }

    /// Payload words as the unit sends them.
    pub fn to_words(&self) -> Vec<u32> {
        vec![
            Capabilities::MOUSE.bits(),
            self.buttons,
            0,
            u32::from(self.dx) | u32::from(self.dy) << 16,
            u32::from(self.dz),
        ]
    }

    /// Pressed buttons.
    pub fn pressed(&self) -> MouseButtons {
        MouseButtons::from_bits_truncate(!self.buttons)
    }

    /// Signed (dx, dy, dz).
    pub fn deltas(&self) -> (i16, i16, i16) {
        let center = |v: u16| (v as i32 - Self::CENTER as i32) as i16;
        (center(self.dx), center(self.dy), center(self.dz))
    }
}

/// Storage geometry returned by `GetMemoryInfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MediaInfo {
    /// Number of the last block
    pub last_block: u16,
    /// Partition described
    pub partition: u16,
    /// System area (root) block
    pub system_block: u16,
    /// First FAT block
    pub fat_block: u16,
    /// FAT length in blocks
    pub fat_blocks: u16,
    /// First directory block
    pub dir_block: u16,
    /// Directory length in blocks
    pub dir_blocks: u16,
    /// Volume icon
    pub icon: u8,
    /// Sort flag
    pub sort: u8,
    /// First block of the save area
    pub save_block: u16,
    /// Save area length in blocks
    pub save_blocks: u16,
}

impl MediaInfo {
    const WORDS: usize = 6;

    /// Parses a `GetMemoryInfo` payload.
    pub fn parse(payload: &[u32]) -> Result<Self, ProtoError> {
        let d = body(payload, Capabilities::MEMCARD, Self::WORDS)?;
        let lo = |w: u32| w as u16;
        let hi = |w: u32| (w >> 16) as u16;
        Ok(Self {
            last_block: lo(d[0]),
            partition: hi(d[0]),
            system_block: lo(d[1]),
            fat_block: hi(d[1]),
            fat_blocks: lo(d[2]),
            dir_block: hi(d[2]),
            dir_blocks: lo(d[3]),
            icon: (d[3] >> 16) as u8,
            sort: (d[3] >> 24) as u8,
            save_block: lo(d[4]),
            save_blocks: hi(d[4]),
        })
    }

    /// Payload words as the unit sends them.
    pub fn to_words(&self) -> Vec<u32> {
        let pair = |lo: u16, hi: u16| u32::from(lo) | u32::from(hi) << 16;
        vec![
            Capabilities::MEMCARD.bits(),
            pair(self.last_block, self.partition),
            pair(self.system_block, self.fat_block),
            pair(self.fat_blocks, self.dir_block),
            u32::from(self.dir_blocks) | u32::from(self.icon) << 16 | u32::from(self.sort) << 24,
            pair(self.save_block, self.save_blocks),
            0,
        ]
    }

    /// Number of blocks on the partition.
    pub fn total_blocks(&self) -> u32 {
        u32::from(self.last_block) + 1
    }
}

/// Block address word for read/write/sync commands.
///
/// Wire byte order is partition, phase, block high, block low.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    /// Partition number
    pub partition: u8,
    /// Access phase within the block
    pub phase: u8,
    /// Block number
    pub block: u16,
}

impl BlockLocation {
    /// Location of `block` on partition 0, phase 0.
    pub const fn block(block: u16) -> Self {
        Self {
            partition: 0,
            phase: 0,
            block,
        }
    }

    /// Same block, another phase.
    pub const fn with_phase(self, phase: u8) -> Self {
        Self { phase, ..self }
    }

    /// Encodes the location word.
    pub const fn to_word(&self) -> u32 {
        let [hi, lo] = self.block.to_be_bytes();
        u32::from_le_bytes([self.partition, self.phase, hi, lo])
    }

    /// Decodes a location word.
    pub const fn from_word(word: u32) -> Self {
        let [partition, phase, hi, lo] = word.to_le_bytes();
        Self {
            partition,
            phase,
            block: u16::from_be_bytes([hi, lo]),
        }
    }
}
