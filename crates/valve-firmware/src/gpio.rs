//! Register-level GPIO output driver for ESP32-S3
//!
//! esp-hal hands out pins as distinct types chosen at compile time, but the
//! control endpoint picks the pin at runtime. This driver programs the IO MUX
//! and GPIO matrix registers directly for whatever pin number a request names,
//! after checking it against the chip's (and board's) unavailable pins.

use core::ptr::{read_volatile, write_volatile};

use valve_core::gpio::{ActuationError, Level, PinActuator, PinAvailability, PinId};

const GPIO_BASE: u32 = 0x6000_4000;
const IO_MUX_BASE: u32 = 0x6000_9000;

// GPIO 0-31 (low bank)
const GPIO_OUT_W1TS_REG: u32 = GPIO_BASE + 0x0008; // Set output bits
const GPIO_OUT_W1TC_REG: u32 = GPIO_BASE + 0x000C; // Clear output bits
const GPIO_ENABLE_W1TS_REG: u32 = GPIO_BASE + 0x0020; // Enable output mode

// GPIO 32-48 (high bank)
const GPIO_OUT1_W1TS_REG: u32 = GPIO_BASE + 0x0014;
const GPIO_OUT1_W1TC_REG: u32 = GPIO_BASE + 0x0018;
const GPIO_ENABLE1_W1TS_REG: u32 = GPIO_BASE + 0x0030;

/// GPIO_PINn_REG, one per pin
const GPIO_PIN0_REG: u32 = GPIO_BASE + 0x0074;
/// GPIO_FUNCn_OUT_SEL_CFG_REG, one per pin
const GPIO_FUNC0_OUT_SEL_CFG_REG: u32 = GPIO_BASE + 0x0554;
/// IO_MUX_GPIOn_REG, one per pin
const IO_MUX_GPIO0_REG: u32 = IO_MUX_BASE + 0x0004;

// GPIO_PINn_REG fields
const PIN_PAD_DRIVER: u32 = 1 << 2; // open drain
const PIN_INT_TYPE_MASK: u32 = 0b111 << 7;
const PIN_INT_ENA_MASK: u32 = 0b1_1111 << 13;

// GPIO_FUNCn_OUT_SEL_CFG_REG: signal 256 routes GPIO_OUT_REG to the pad,
// OEN_SEL takes the output enable from GPIO_ENABLE_REG.
const OUT_SEL_SIMPLE_GPIO: u32 = 0x100;
const OUT_SEL_OEN_SEL: u32 = 1 << 9;

// IO_MUX_GPIOn_REG fields
const MUX_FUN_WPD: u32 = 1 << 7;
const MUX_FUN_WPU: u32 = 1 << 8;
const MUX_FUN_IE: u32 = 1 << 9;
const MUX_MCU_SEL_MASK: u32 = 0b111 << 12;
const MUX_MCU_SEL_GPIO: u32 = 1 << 12;

/// Drives any available pin as a push-pull output.
///
/// Shared by every HTTP worker through `&'static`. Each call runs inside a
/// critical section, so one pin's reconfiguration is never interleaved with
/// another call; ordering between requests is still last-write-wins.
pub struct RegisterGpio {
    availability: PinAvailability,
}

impl RegisterGpio {
    pub const fn new(availability: PinAvailability) -> Self {
        Self { availability }
    }

    /// Returns (out set, out clear, enable set, bit) for this pin's bank
    #[inline]
    const fn bank(pin: u8) -> (u32, u32, u32, u32) {
        if pin < 32 {
            (
                GPIO_OUT_W1TS_REG,
                GPIO_OUT_W1TC_REG,
                GPIO_ENABLE_W1TS_REG,
                1u32 << pin,
            )
        } else {
            (
                GPIO_OUT1_W1TS_REG,
                GPIO_OUT1_W1TC_REG,
                GPIO_ENABLE1_W1TS_REG,
                1u32 << (pin - 32),
            )
        }
    }
}

impl PinActuator for RegisterGpio {
    fn set_output(&self, pin: PinId, level: Level) -> Result<(), ActuationError> {
        self.availability.check(pin)?;

        let n = pin.number();
        let offset = 4 * u32::from(n);
        let (out_set, out_clr, enable_set, bit) = Self::bank(n);

        critical_section::with(|_| unsafe {
            // Pad as plain GPIO: no pull-up, no pull-down, input buffer off
            let mux = (IO_MUX_GPIO0_REG + offset) as *mut u32;
            let mut value = read_volatile(mux);
            value &= !(MUX_FUN_WPU | MUX_FUN_WPD | MUX_FUN_IE | MUX_MCU_SEL_MASK);
            write_volatile(mux, value | MUX_MCU_SEL_GPIO);

            write_volatile(
                (GPIO_FUNC0_OUT_SEL_CFG_REG + offset) as *mut u32,
                OUT_SEL_SIMPLE_GPIO | OUT_SEL_OEN_SEL,
            );

            // Push-pull, interrupts off
            let pin_reg = (GPIO_PIN0_REG + offset) as *mut u32;
            let value = read_volatile(pin_reg);
            write_volatile(
                pin_reg,
                value & !(PIN_PAD_DRIVER | PIN_INT_TYPE_MASK | PIN_INT_ENA_MASK),
            );

            // Latch the level before enabling the driver so the pin never
            // glitches to the opposite state
            match level {
                Level::High => write_volatile(out_set as *mut u32, bit),
                Level::Low => write_volatile(out_clr as *mut u32, bit),
            }
            write_volatile(enable_set as *mut u32, bit);
        });

        Ok(())
    }
}
