//! Hardware-independent core library for valve-ap
//!
//! This crate contains all platform-agnostic logic of the access-point actuator
//! controller: configuration, the control request decoder, the HTTP control
//! endpoint, the network bring-up sequencer, the DHCP lease pool and the
//! settings-store health check.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both the
//! ESP32-S3 firmware and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod bringup;
pub mod config;
pub mod control;
pub mod dhcp;
pub mod endpoint;
pub mod gpio;
pub mod http;
pub mod settings;
