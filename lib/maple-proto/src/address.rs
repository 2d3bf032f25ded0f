//! Bus addressing.
//!
//! Each port carries one root unit and up to five sub-units cascaded behind
//! it. On the wire a unit is named by one byte: the port in the top two bits,
//! `0x20` for the root unit, or a single bit `1 << (unit - 1)` for a sub-unit.

use core::fmt;

/// Number of physical ports
pub const PORT_COUNT: usize = 4;

/// Units per port, root unit included
pub const UNIT_COUNT: usize = 6;

/// Total number of addressable unit slots
pub const SLOT_COUNT: usize = PORT_COUNT * UNIT_COUNT;

/// Wire bit marking the root unit
const ROOT_BIT: u8 = 0x20;

/// Sub-unit presence bits in a root unit's sender byte
pub const SUB_UNIT_MASK: u8 = 0x1f;

/// A (port, unit) coordinate on the bus.
///
/// Unit 0 is the root unit plugged straight into the port. Ordering is by
/// port, then unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    port: u8,
    unit: u8,
}

impl Address {
    /// Creates an address, or `None` if outside the fixed topology.
    pub const fn new(port: u8, unit: u8) -> Option<Self> {
        if (port as usize) < PORT_COUNT && (unit as usize) < UNIT_COUNT {
            Some(Self { port, unit })
        } else {
            None
        }
    }

    /// Root unit of a port.
    pub const fn root(port: u8) -> Option<Self> {
        Self::new(port, 0)
    }

    /// Port number (0-based)
    pub const fn port(&self) -> u8 {
        self.port
    }

    /// Unit number, 0 for the root unit
    pub const fn unit(&self) -> u8 {
        self.unit
    }

    /// Returns true for the unit plugged directly into the port.
    pub const fn is_root(&self) -> bool {
        self.unit == 0
    }

    /// Dense slot index: port-major, unit-minor.
    pub const fn index(&self) -> usize {
        self.port as usize * UNIT_COUNT + self.unit as usize
    }

    /// Inverse of [`Address::index`].
    pub const fn from_index(index: usize) -> Option<Self> {
        if index >= SLOT_COUNT {
            return None;
        }
        Some(Self {
            port: (index / UNIT_COUNT) as u8,
            unit: (index % UNIT_COUNT) as u8,
        })
    }

    /// All addresses in ascending (port, unit) order.
    pub fn all() -> impl Iterator<Item = Address> {
        (0..SLOT_COUNT).filter_map(Self::from_index)
    }

    /// Bit for this sub-unit in the root unit's presence mask (0 for root).
    pub const fn sub_unit_bit(&self) -> u8 {
        if self.unit == 0 {
            0
        } else {
            1 << (self.unit - 1)
        }
    }

    /// Encodes the address as a recipient/sender byte.
    pub const fn to_wire(&self) -> u8 {
        let unit = if self.unit == 0 {
            ROOT_BIT
        } else {
            self.sub_unit_bit()
        };
        (self.port << 6) | unit
    }

    /// Decodes a unit address byte.
    ///
    /// A root unit's byte may carry sub-unit presence bits alongside `0x20`;
    /// they are ignored here (see [`SUB_UNIT_MASK`]).
    pub const fn from_wire(byte: u8) -> Option<Self> {
        let port = byte >> 6;
        if byte & ROOT_BIT != 0 {
            return Some(Self { port, unit: 0 });
        }
        let bits = byte & SUB_UNIT_MASK;
        if bits.count_ones() != 1 {
            return None;
        }
        Some(Self {
            port,
            unit: bits.trailing_zeros() as u8 + 1,
        })
    }

    /// The host's own address byte on this address's port.
    pub const fn host_wire(&self) -> u8 {
        self.port << 6
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", (b'A' + self.port) as char, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_encoding() {
        let root = Address::root(2).unwrap();
        assert_eq!(root.to_wire(), 0xA0);
        let sub = Address::new(1, 3).unwrap();
        assert_eq!(sub.to_wire(), 0x44);
        assert_eq!(Address::from_wire(0x44), Some(sub));
        assert_eq!(sub.host_wire(), 0x40);
    }

    #[test]
    fn test_root_ignores_presence_bits() {
        // Root unit on port A reporting sub-units 1 and 2 behind it
        assert_eq!(Address::from_wire(0x23), Address::root(0));
        assert_eq!(Address::from_wire(0x03), None);
        assert_eq!(Address::from_wire(0x00), None);
    }

    #[test]
    fn test_ordering_and_index() {
        let all: alloc::vec::Vec<Address> = Address::all().collect();
        assert_eq!(all.len(), SLOT_COUNT);
        assert!(all.windows(2).all(|w| w[0] < w[1]));
        for (i, addr) in all.iter().enumerate() {
            assert_eq!(addr.index(), i);
        }
        assert!(Address::new(4, 0).is_none());
        assert!(Address::new(0, 6).is_none());
    }

    #[test]
    fn test_display() {
        use alloc::string::ToString;
        assert_eq!(Address::new(3, 5).unwrap().to_string(), "D5");
    }
}
