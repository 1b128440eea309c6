//! ESP32-S3 firmware-specific modules for valve-ap
//!
//! This crate contains hardware-specific code that cannot compile on desktop
//! targets: GPIO register manipulation, flash access to the settings
//! partition, the esp-radio access point and the embassy-net tasks that serve
//! DHCP and HTTP.

#![no_std]

extern crate alloc;

pub mod ap_config;
pub mod gpio;
pub mod net;
pub mod platform;
pub mod settings_flash;
