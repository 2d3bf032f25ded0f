//! Standard controller.

use alloc::vec;

use maple_proto::{Buttons, Capabilities, Command, ControllerCondition, Frame, Response};

use crate::driver::{DeviceContext, Driver};
use crate::status::StatusBlock;
use crate::MapleError;

/// Decoded controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    /// Pressed buttons
    pub buttons: Buttons,
    /// Right trigger (0 = released, 255 = fully pulled)
    pub rtrig: u8,
    /// Left trigger
    pub ltrig: u8,
    /// Main stick X (-128 left .. 127 right)
    pub joyx: i8,
    /// Main stick Y (-128 up .. 127 down)
    pub joyy: i8,
    /// Second stick X
    pub joy2x: i8,
    /// Second stick Y
    pub joy2y: i8,
}

impl ControllerState {
    pub fn is_pressed(&self, buttons: Buttons) -> bool {
        self.buttons.contains(buttons)
    }
}

impl From<&ControllerCondition> for ControllerState {
    fn from(cond: &ControllerCondition) -> Self {
        let axis = |raw: u8| (i16::from(raw) - 128) as i8;
        Self {
            buttons: cond.pressed(),
            rtrig: cond.rtrig,
            ltrig: cond.ltrig,
            joyx: axis(cond.joyx),
            joyy: axis(cond.joyy),
            joy2x: axis(cond.joy2x),
            joy2y: axis(cond.joy2y),
        }
    }
}

/// Polls controller condition once per tick.
#[derive(Debug, Default)]
pub struct ControllerDriver;

impl ControllerDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for ControllerDriver {
    fn name(&self) -> &'static str {
        "controller"
    }

    fn periodic(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        let publisher = dev.publisher();
        dev.submit(
            Command::GetCondition,
            vec![Capabilities::CONTROLLER.bits()],
            move |result| match result.and_then(|frame| decode(&frame)) {
                Ok(state) => {
                    publisher.publish(StatusBlock::Controller(state));
                }
                Err(err) => {
                    publisher.record_error(err);
                }
            },
        )?;
        Ok(())
    }
}

fn decode(frame: &Frame) -> Result<ControllerState, MapleError> {
    let payload = frame.expect(Response::DataTransfer)?;
    Ok(ControllerState::from(&ControllerCondition::parse(payload)?))
}
