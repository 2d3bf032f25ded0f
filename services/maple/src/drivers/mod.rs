//! # Class Drivers
//!
//! | Capability   | Driver             | Status block             |
//! |--------------|--------------------|--------------------------|
//! | `CONTROLLER` | [`ControllerDriver`] | [`ControllerState`]    |
//! | `MEMCARD`    | [`MemCardDriver`]  | [`StorageStatus`]        |
//! | `LCD`        | [`LcdDriver`]      | [`LcdFrame`]             |
//! | `LIGHTGUN`   | [`LightGunDriver`] | [`LightGunState`]        |
//! | `MOUSE`      | [`MouseDriver`]    | [`MouseState`]           |

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use maple_proto::Capabilities;

use crate::driver::Driver;

pub mod controller;
pub mod lcd;
pub mod lightgun;
pub mod mouse;
pub mod storage;

pub use controller::{ControllerDriver, ControllerState};
pub use lcd::{LcdDriver, LcdFrame};
pub use lightgun::{LightGunDriver, LightGunState};
pub use mouse::{MouseDriver, MouseState};
pub use storage::{MemCardDriver, StorageStatus};

/// Every built-in driver with the capability it claims.
pub fn standard() -> Vec<(Capabilities, Box<dyn Driver>)> {
    vec![
        (Capabilities::CONTROLLER, Box::new(ControllerDriver::new()) as Box<dyn Driver>),
        (Capabilities::MEMCARD, Box::new(MemCardDriver::new()) as Box<dyn Driver>),
        (Capabilities::LCD, Box::new(LcdDriver::new()) as Box<dyn Driver>),
        (Capabilities::LIGHTGUN, Box::new(LightGunDriver::new()) as Box<dyn Driver>),
        (Capabilities::MOUSE, Box::new(MouseDriver::new()) as Box<dyn Driver>),
    ]
}
