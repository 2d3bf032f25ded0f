//! Identity record returned for a `DeviceInfo` request.

use alloc::vec::Vec;

use crate::function::Capabilities;
use crate::ProtoError;

/// Size of the identity record in payload words
pub const DEVINFO_WORDS: usize = 28;

const DEVINFO_BYTES: usize = DEVINFO_WORDS * 4;

/// Identity record (112 bytes)
///
/// Strings are fixed-width, space padded, and kept raw; use
/// [`DeviceInfo::product_name`] and [`DeviceInfo::product_license`] to read
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Functions provided by the unit
    pub functions: Capabilities,
    /// Per-function definition words, most significant function first
    pub function_data: [u32; 3],
    /// Region code
    pub area_code: u8,
    /// Connector orientation
    pub connector_direction: u8,
    /// Product name
    pub product_name: [u8; 30],
    /// Product license / manufacturer string
    pub product_license: [u8; 60],
    /// Standby current (0.1 mA units)
    pub standby_power: u16,
    /// Maximum current (0.1 mA units)
    pub max_power: u16,
}

impl DeviceInfo {
    /// Builds a record from its parts, padding strings with spaces.
    pub fn new(functions: Capabilities, function_data: [u32; 3], name: &str, license: &str) -> Self {
        Self {
            functions,
            function_data,
            area_code: 0xff,
            connector_direction: 0,
            product_name: padded(name),
            product_license: padded(license),
            standby_power: 0,
            max_power: 0,
        }
    }

    /// Parses the payload of a `DeviceInfo` response.
    pub fn parse(payload: &[u32]) -> Result<Self, ProtoError> {
        if payload.len() < DEVINFO_WORDS {
            return Err(ProtoError::Truncated);
        }
        let mut raw = [0u8; DEVINFO_BYTES];
        for (chunk, word) in raw.chunks_exact_mut(4).zip(payload) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }

        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut product_name = [0u8; 30];
        product_name.copy_from_slice(&raw[18..48]);
        let mut product_license = [0u8; 60];
        product_license.copy_from_slice(&raw[48..108]);

        Ok(Self {
            functions: Capabilities::from_bits_retain(word(0)),
            function_data: [word(4), word(8), word(12)],
            area_code: raw[16],
            connector_direction: raw[17],
            product_name,
            product_license,
            standby_power: u16::from_le_bytes([raw[108], raw[109]]),
            max_power: u16::from_le_bytes([raw[110], raw[111]]),
        })
    }

    /// Serializes the record into response payload words.
    pub fn to_words(&self) -> Vec<u32> {
        let mut raw = [0u8; DEVINFO_BYTES];
        raw[0..4].copy_from_slice(&self.functions.bits().to_le_bytes());
        for (i, data) in self.function_data.iter().enumerate() {
            raw[4 + i * 4..8 + i * 4].copy_from_slice(&data.to_le_bytes());
        }
        raw[16] = self.area_code;
        raw[17] = self.connector_direction;
        raw[18..48].copy_from_slice(&self.product_name);
        raw[48..108].copy_from_slice(&self.product_license);
        raw[108..110].copy_from_slice(&self.standby_power.to_le_bytes());
        raw[110..112].copy_from_slice(&self.max_power.to_le_bytes());
        raw.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Product name without padding.
    pub fn product_name(&self) -> &str {
        trimmed(&self.product_name)
    }

    /// License string without padding.
    pub fn product_license(&self) -> &str {
        trimmed(&self.product_license)
    }

    /// Definition word for one of the unit's functions.
    pub fn function_data_for(&self, function: Capabilities) -> Option<u32> {
        let index = self.functions.function_data_index(function)?;
        self.function_data.get(index).copied()
    }

    /// Storage layout of a memory-card function, if present.
    pub fn memory_definition(&self) -> Option<MemoryDefinition> {
        self.function_data_for(Capabilities::MEMCARD)
            .map(MemoryDefinition::from_word)
    }
}

fn padded<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    let len = s.len().min(N);
    out[..len].copy_from_slice(&s.as_bytes()[..len]);
    out
}

fn trimmed(raw: &[u8]) -> &str {
    let end = raw
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |p| p + 1);
    match core::str::from_utf8(&raw[..end]) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or(""),
    }
}

/// Memory-card function definition word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDefinition {
    /// Number of partitions
    pub partitions: u16,
    /// Bytes per block
    pub block_size: u16,
    /// Phases needed to write one block
    pub write_accesses: u8,
    /// Phases needed to read one block
    pub read_accesses: u8,
    /// Media can be removed
    pub removable: bool,
    /// Transfers carry a CRC
    pub crc: bool,
}

impl MemoryDefinition {
    /// Decodes the definition word.
    pub const fn from_word(word: u32) -> Self {
        Self {
            partitions: ((word >> 24) & 0xff) as u16 + 1,
            block_size: ((((word >> 16) & 0xff) + 1) * 32) as u16,
            write_accesses: ((word >> 12) & 0xf) as u8,
            read_accesses: ((word >> 8) & 0xf) as u8,
            removable: word & 0x80 != 0,
            crc: word & 0x40 != 0,
        }
    }

    /// Encodes the definition word.
    pub const fn to_word(&self) -> u32 {
        ((self.partitions.saturating_sub(1) as u32) << 24)
            | (((self.block_size as u32 / 32).saturating_sub(1)) << 16)
            | ((self.write_accesses as u32 & 0xf) << 12)
            | ((self.read_accesses as u32 & 0xf) << 8)
            | (if self.removable { 0x80 } else { 0 })
            | (if self.crc { 0x40 } else { 0 })
    }

    /// Bytes moved by one write phase.
    pub const fn write_phase_bytes(&self) -> usize {
        if self.write_accesses == 0 {
            self.block_size as usize
        } else {
            self.block_size as usize / self.write_accesses as usize
        }
    }
}

impl Default for MemoryDefinition {
    /// Standard 128 KiB memory unit: one partition, 512-byte blocks, written
    /// in four phases and read in one.
    fn default() -> Self {
        Self::from_word(0x000f_4100)
    }
}
