//! Bus configuration.

use maple_proto::{PORT_COUNT, UNIT_COUNT};

use crate::MapleError;

/// S-MAPLE configuration
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Ports walked by the scanner (at most 4)
    pub ports: usize,
    /// Units walked per port, root unit included (at most 6)
    pub units: usize,
    /// Ticks a transaction may stay outstanding before it times out
    pub timeout_ticks: u64,
    /// Probe sub-units advertised by root units
    pub probe_sub_units: bool,
    /// Ticks between identity requests to a device its driver keeps busy
    pub reidentify_ticks: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            ports: PORT_COUNT,
            units: UNIT_COUNT,
            timeout_ticks: 1,
            probe_sub_units: true,
            reidentify_ticks: 30,
        }
    }
}

impl BusConfig {
    /// Checks the configuration against the fixed topology.
    pub fn validate(&self) -> Result<(), MapleError> {
        if self.ports == 0 || self.ports > PORT_COUNT {
            return Err(MapleError::InvalidArgument);
        }
        if self.units == 0 || self.units > UNIT_COUNT {
            return Err(MapleError::InvalidArgument);
        }
        if self.timeout_ticks == 0 || self.reidentify_ticks == 0 {
            return Err(MapleError::InvalidArgument);
        }
        Ok(())
    }

    /// Single port, no hub walking. Handy for bring-up.
    pub fn single_port() -> Self {
        Self {
            ports: 1,
            units: 1,
            probe_sub_units: false,
            ..Self::default()
        }
    }
}
