//! Mouse.
//!
//! The unit reports movement since the last poll; the driver keeps a running
//! position on top of it.

use alloc::vec;

use maple_proto::{Capabilities, Command, MouseButtons, MouseCondition, Response};

use crate::driver::{DeviceContext, Driver};
use crate::status::StatusBlock;
use crate::MapleError;

/// Decoded mouse state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MouseState {
    /// Pressed buttons
    pub buttons: MouseButtons,
    /// Movement reported by the last poll
    pub dx: i16,
    pub dy: i16,
    pub dz: i16,
    /// Accumulated position since attach
    pub x: i32,
    pub y: i32,
    pub wheel: i32,
}

impl MouseState {
    /// Applies one poll on top of `self`.
    pub fn advance(&self, cond: &MouseCondition) -> Self {
        let (dx, dy, dz) = cond.deltas();
        Self {
            buttons: cond.pressed(),
            dx,
            dy,
            dz,
            x: self.x.wrapping_add(i32::from(dx)),
            y: self.y.wrapping_add(i32::from(dy)),
            wheel: self.wheel.wrapping_add(i32::from(dz)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MouseDriver;

impl MouseDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for MouseDriver {
    fn name(&self) -> &'static str {
        "mouse"
    }

    fn periodic(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        let publisher = dev.publisher();
        dev.submit(
            Command::GetCondition,
            vec![Capabilities::MOUSE.bits()],
            move |result| {
                let cond = result.and_then(|frame| {
                    let payload = frame.expect(Response::DataTransfer)?;
                    Ok(MouseCondition::parse(payload)?)
                });
                match cond {
                    Ok(cond) => {
                        publisher.publish_with(|prev| {
                            let base = match prev {
                                StatusBlock::Mouse(state) => *state,
                                _ => MouseState::default(),
                            };
                            StatusBlock::Mouse(base.advance(&cond))
                        });
                    }
                    Err(err) => {
                        publisher.record_error(err);
                    }
                }
            },
        )?;
        Ok(())
    }
}
