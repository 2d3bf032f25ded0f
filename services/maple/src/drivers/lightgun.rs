//! Light gun.
//!
//! Guns report their buttons through the controller condition layout. Units
//! that also advertise the controller function are polled on it, others on
//! the light gun function. Position sensing needs raster timing from the
//! video hardware and is left to the display side.

use alloc::vec;

use maple_proto::{Buttons, Capabilities, Command, ControllerCondition, Response};

use crate::driver::{DeviceContext, Driver};
use crate::status::StatusBlock;
use crate::MapleError;

/// Button that fires the gun
pub const TRIGGER: Buttons = Buttons::A;

/// Decoded light gun state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LightGunState {
    /// Pressed buttons
    pub buttons: Buttons,
    /// Trigger pulls seen since attach, wrapping at `u32::MAX`
    pub trigger_pulls: u32,
}

impl LightGunState {
    pub fn trigger_held(&self) -> bool {
        self.buttons.contains(TRIGGER)
    }

    fn advance(&self, buttons: Buttons) -> Self {
        let pulled = buttons.contains(TRIGGER) && !self.trigger_held();
        Self {
            buttons,
            trigger_pulls: self.trigger_pulls.wrapping_add(u32::from(pulled)),
        }
    }
}

#[derive(Debug, Default)]
pub struct LightGunDriver;

impl LightGunDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for LightGunDriver {
    fn name(&self) -> &'static str {
        "lightgun"
    }

    fn periodic(&mut self, dev: &mut DeviceContext<'_>) -> Result<(), MapleError> {
        let function = if dev.functions().contains(Capabilities::CONTROLLER) {
            Capabilities::CONTROLLER
        } else {
            Capabilities::LIGHTGUN
        };
        let publisher = dev.publisher();
        dev.submit(
            Command::GetCondition,
            vec![function.bits()],
            move |result| {
                let cond = result.and_then(|frame| {
                    let payload = frame.expect(Response::DataTransfer)?;
                    Ok(ControllerCondition::parse_for(payload, function)?)
                });
                match cond {
                    Ok(cond) => {
                        publisher.publish_with(|prev| {
                            let base = match prev {
                                StatusBlock::LightGun(state) => *state,
                                _ => LightGunState::default(),
                            };
                            StatusBlock::LightGun(base.advance(cond.pressed()))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MapleBus;
    use crate::config::BusConfig;
    use crate::sim::{SimBus, SimDevice};
    use alloc::boxed::Box;
    use maple_proto::Address;

    #[test]
    fn test_trigger_edges() {
        let state = LightGunState::default()
            .advance(TRIGGER)
            .advance(TRIGGER)
            .advance(Buttons::empty())
            .advance(TRIGGER | Buttons::START);
        assert_eq!(state.trigger_pulls, 2);
        assert!(state.trigger_held());
    }

    #[test]
    fn test_trigger_count_wraps() {
        let worn = LightGunState {
            buttons: Buttons::empty(),
            trigger_pulls: u32::MAX,
        };
        assert_eq!(worn.advance(TRIGGER).trigger_pulls, 0);
    }

    #[test]
    fn test_polls_on_light_gun_function() {
        let sim = SimBus::new();
        let mut bus = MapleBus::new(BusConfig::default(), Box::new(sim.clone())).unwrap();
        bus.register_driver(Capabilities::LIGHTGUN, Box::new(LightGunDriver::new()))
            .unwrap();
        let root = Address::root(3).unwrap();
        sim.plug(root, SimDevice::lightgun());
        let firing = ControllerCondition {
            buttons: !TRIGGER.bits(),
            ..ControllerCondition::IDLE
        };
        sim.set_condition(root, Capabilities::LIGHTGUN, firing.to_words(Capabilities::LIGHTGUN));

        sim.run(&mut bus, 4);

        let gun = bus.enumerate(Capabilities::LIGHTGUN)[0];
        let StatusBlock::LightGun(state) = bus.read_status(gun).unwrap().block else {
            panic!("no light gun state");
        };
        assert!(state.trigger_held());
        assert_eq!(state.trigger_pulls, 1);
        assert!(sim
            .requests()
            .iter()
            .any(|frame| frame.function() == Some(Capabilities::LIGHTGUN.bits())));
    }
}
