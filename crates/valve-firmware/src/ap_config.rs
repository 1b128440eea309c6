//! Build-time access-point settings
//!
//! Values come from `VALVE_*` variables captured by the build script (see
//! `.env.example`). Anything unset falls back to [`NetworkConfig::default`].

use core::net::Ipv4Addr;
use core::str::FromStr;

use thiserror_no_std::Error;
use valve_core::config::{AccessMode, NetworkConfig};

const SSID: Option<&str> = option_env!("VALVE_AP_SSID");
const PASSPHRASE: Option<&str> = option_env!("VALVE_AP_PASSPHRASE");
const ACCESS_MODE: Option<&str> = option_env!("VALVE_AP_ACCESS_MODE");
const CHANNEL: Option<&str> = option_env!("VALVE_AP_CHANNEL");
const ADDRESS: Option<&str> = option_env!("VALVE_AP_ADDRESS");
const NETMASK: Option<&str> = option_env!("VALVE_AP_NETMASK");
const HTTP_PORT: Option<&str> = option_env!("VALVE_HTTP_PORT");

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("{name} has an invalid value: {value:?}")]
    Invalid {
        name: &'static str,
        value: &'static str,
    },
}

fn parse<T: FromStr>(name: &'static str, value: Option<&'static str>) -> Result<Option<T>, EnvError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| EnvError::Invalid { name, value: raw }),
    }
}

fn parse_access_mode(value: Option<&'static str>) -> Result<Option<AccessMode>, EnvError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some("open") => Ok(Some(AccessMode::Open)),
        Some("wpa2_personal") => Ok(Some(AccessMode::Wpa2Personal)),
        Some(raw) => Err(EnvError::Invalid {
            name: "VALVE_AP_ACCESS_MODE",
            value: raw,
        }),
    }
}

/// Builds the access-point configuration from the build environment.
///
/// The result is not validated here; the bring-up sequencer does that before
/// touching the radio.
pub fn network_config() -> Result<NetworkConfig<'static>, EnvError> {
    let mut config = NetworkConfig::default();

    if let Some(ssid) = SSID.filter(|s| !s.is_empty()) {
        config.ssid = ssid.into();
    }
    config.passphrase = PASSPHRASE.unwrap_or("").into();

    // Without an explicit choice a passphrase implies WPA2
    config.access_mode = parse_access_mode(ACCESS_MODE)?.unwrap_or(if config.passphrase.is_empty() {
        AccessMode::Open
    } else {
        AccessMode::Wpa2Personal
    });

    if let Some(channel) = parse::<u8>("VALVE_AP_CHANNEL", CHANNEL)? {
        config.channel = channel;
    }
    if let Some(address) = parse::<Ipv4Addr>("VALVE_AP_ADDRESS", ADDRESS)? {
        config.static_address = address;
    }
    if let Some(netmask) = parse::<Ipv4Addr>("VALVE_AP_NETMASK", NETMASK)? {
        config.netmask = netmask;
    }
    if let Some(port) = parse::<u16>("VALVE_HTTP_PORT", HTTP_PORT)? {
        config.port = port;
    }

    Ok(config)
}
