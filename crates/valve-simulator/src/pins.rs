//! In-memory pin bank
//!
//! Applies the same availability rules as the chip so requests fail the way
//! they would on hardware, and remembers the last level written per pin.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use log::info;
use valve_core::gpio::{ActuationError, Level, PinActuator, PinAvailability, PinId};

pub struct SimulatedPins {
    availability: PinAvailability,
    levels: Mutex<BTreeMap<u8, Level>>,
}

impl SimulatedPins {
    pub fn new(availability: PinAvailability) -> Self {
        Self {
            availability,
            levels: Mutex::new(BTreeMap::new()),
        }
    }

    /// Last level driven on `pin`, `None` if it was never configured
    pub fn level(&self, pin: u8) -> Option<Level> {
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pin)
            .copied()
    }
}

impl PinActuator for SimulatedPins {
    fn set_output(&self, pin: PinId, level: Level) -> Result<(), ActuationError> {
        self.availability.check(pin)?;
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pin.number(), level);
        info!("{} -> {:?}", pin, level);
        Ok(())
    }
}
