//! Pin identifiers, logical levels and the actuator seam
//!
//! The firmware drives real GPIO registers; the simulator drives an in-memory
//! pin bank. Both implement [`PinActuator`].

use thiserror_no_std::Error;

/// Highest addressable digital pin number accepted by the control endpoint.
pub const MAX_PIN: u8 = 46;

/// A validated digital pin number in `0..=MAX_PIN`.
///
/// A `PinId` can only be built through [`PinId::new`] (or `TryFrom`), so any
/// value of this type is known to be in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PinId(u8);

impl PinId {
    /// Returns `None` when `raw` lies outside `0..=MAX_PIN`.
    pub const fn new(raw: i64) -> Option<Self> {
        if raw >= 0 && raw <= MAX_PIN as i64 {
            Some(Self(raw as u8))
        } else {
            None
        }
    }

    pub const fn number(self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for PinId {
    type Error = i64;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(raw)
    }
}

impl core::fmt::Display for PinId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "GPIO{}", self.0)
    }
}

/// Logical output level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    /// Maps a state token to a level: `"on"` (any case) is high, everything
    /// else is low.
    pub fn from_token(token: &str) -> Self {
        if token.eq_ignore_ascii_case("on") {
            Self::High
        } else {
            Self::Low
        }
    }

    pub const fn is_high(self) -> bool {
        matches!(self, Self::High)
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Self::High } else { Self::Low }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuationError {
    #[error("GPIO{0} does not exist on this chip")]
    NoSuchPin(u8),
    #[error("GPIO{0} is reserved for another peripheral")]
    Reserved(u8),
}

/// Drives a single digital output pin.
///
/// Implementations reconfigure the pin as a plain push-pull output (no pulls,
/// no interrupts) on every call and then apply `level`. Calls may come from
/// several HTTP workers at once; there is no cross-call locking, so two
/// writes to the same pin resolve as last-write-wins.
pub trait PinActuator {
    fn set_output(&self, pin: PinId, level: Level) -> Result<(), ActuationError>;
}

impl<T: PinActuator + ?Sized> PinActuator for &T {
    fn set_output(&self, pin: PinId, level: Level) -> Result<(), ActuationError> {
        (**self).set_output(pin, level)
    }
}

/// Set of pin numbers, one bit per pin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PinMask(u64);

impl PinMask {
    pub const EMPTY: Self = Self(0);

    pub const fn with(self, pin: u8) -> Self {
        Self(self.0 | (1u64 << pin))
    }

    /// Adds every pin in `first..=last`.
    pub const fn with_range(self, first: u8, last: u8) -> Self {
        let mut mask = self;
        let mut pin = first;
        while pin <= last {
            mask = mask.with(pin);
            pin += 1;
        }
        mask
    }

    pub const fn contains(self, pin: u8) -> bool {
        pin < 64 && self.0 & (1u64 << pin) != 0
    }
}

/// Which pins a chip can actually drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinAvailability {
    /// Pin numbers not bonded out on the chip
    pub absent: PinMask,
    /// Pins wired to flash, PSRAM or board peripherals
    pub reserved: PinMask,
}

impl PinAvailability {
    /// ESP32-S3 with quad SPI flash/PSRAM: GPIO22..=25 do not exist and
    /// GPIO26..=32 carry the flash and PSRAM bus.
    pub const ESP32S3: Self = Self {
        absent: PinMask::EMPTY.with_range(22, 25),
        reserved: PinMask::EMPTY.with_range(26, 32),
    };

    /// Additionally reserve board-specific pins.
    pub const fn reserve(self, extra: PinMask) -> Self {
        Self {
            absent: self.absent,
            reserved: PinMask(self.reserved.0 | extra.0),
        }
    }

    pub const fn check(&self, pin: PinId) -> Result<(), ActuationError> {
        let n = pin.number();
        if self.absent.contains(n) {
            Err(ActuationError::NoSuchPin(n))
        } else if self.reserved.contains(n) {
            Err(ActuationError::Reserved(n))
        } else {
            Ok(())
        }
    }
}
