//! Peripheral function codes.
//!
//! A unit advertises the functions it implements as a bitmask in its identity
//! record. Class commands name the function they address in their first
//! payload word using the same codes.

use bitflags::bitflags;

bitflags! {
    /// Function (capability) bitmask as reported in the identity record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct Capabilities: u32 {
        /// Vibration pack
        const PURUPURU = 0x0001_0000;
        /// Mouse
        const MOUSE = 0x0002_0000;
        /// Camera
        const CAMERA = 0x0008_0000;
        /// Standard controller
        const CONTROLLER = 0x0100_0000;
        /// Memory card / block storage
        const MEMCARD = 0x0200_0000;
        /// Auxiliary monochrome display
        const LCD = 0x0400_0000;
        /// Real-time clock
        const CLOCK = 0x0800_0000;
        /// Microphone
        const MICROPHONE = 0x1000_0000;
        /// AR gun
        const AR_GUN = 0x2000_0000;
        /// Keyboard
        const KEYBOARD = 0x4000_0000;
        /// Light gun
        const LIGHTGUN = 0x8000_0000;
    }
}

/// Order in which a multi-function unit's primary function is chosen.
pub const PRECEDENCE: [Capabilities; 11] = [
    Capabilities::CONTROLLER,
    Capabilities::MEMCARD,
    Capabilities::LCD,
    Capabilities::CLOCK,
    Capabilities::MICROPHONE,
    Capabilities::AR_GUN,
    Capabilities::KEYBOARD,
    Capabilities::LIGHTGUN,
    Capabilities::PURUPURU,
    Capabilities::MOUSE,
    Capabilities::CAMERA,
];

const NAMES: [(Capabilities, &str); 11] = [
    (Capabilities::CONTROLLER, "Controller"),
    (Capabilities::MEMCARD, "MemoryCard"),
    (Capabilities::LCD, "LCD"),
    (Capabilities::CLOCK, "Clock"),
    (Capabilities::MICROPHONE, "Microphone"),
    (Capabilities::AR_GUN, "ARGun"),
    (Capabilities::KEYBOARD, "Keyboard"),
    (Capabilities::LIGHTGUN, "LightGun"),
    (Capabilities::PURUPURU, "PuruPuru"),
    (Capabilities::MOUSE, "Mouse"),
    (Capabilities::CAMERA, "Camera"),
];

impl Capabilities {
    /// True when exactly one known function bit is set.
    pub fn is_single(self) -> bool {
        self.bits().count_ones() == 1 && Self::all().contains(self)
    }

    /// Human-readable name of a single function.
    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(f, _)| *f == self)
            .map_or("Unknown", |(_, name)| *name)
    }

    /// Set functions in precedence order.
    pub fn by_precedence(self) -> impl Iterator<Item = Capabilities> {
        PRECEDENCE.into_iter().filter(move |f| self.contains(*f))
    }

    /// Index of `function`'s entry in the identity record's function data.
    ///
    /// Function data words are assigned to set bits starting from the most
    /// significant one.
    pub fn function_data_index(self, function: Capabilities) -> Option<usize> {
        if !function.is_single() || !self.contains(function) {
            return None;
        }
        let above = self.bits() & !(function.bits() | (function.bits() - 1));
        Some(above.count_ones() as usize)
    }
}
