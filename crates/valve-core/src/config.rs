use alloc::borrow::Cow;
use core::net::Ipv4Addr;

use serde::Deserialize;
use thiserror_no_std::Error;

use crate::dhcp::MAX_LEASES;

/// Default TCP port of the control endpoint
pub const DEFAULT_PORT: u16 = 8080;

/// Regulatory and PHY settings the radio is brought up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioPlan {
    /// ISO 3166-1 alpha-2 code
    pub country: [u8; 2],
    pub first_channel: u8,
    pub channel_count: u8,
    /// 802.11b, g and n
    pub protocols: &'static str,
    /// 20 MHz channels only
    pub ht20: bool,
    /// In 0.25 dBm steps
    pub max_tx_power: i8,
}

pub const RADIO_PLAN: RadioPlan = RadioPlan {
    country: *b"AR",
    first_channel: 1,
    channel_count: 13,
    protocols: "11b/g/n",
    ht20: true,
    max_tx_power: 78,
};

impl RadioPlan {
    pub const fn last_channel(&self) -> u8 {
        self.first_channel + self.channel_count - 1
    }

    pub fn allows_channel(&self, channel: u8) -> bool {
        (self.first_channel..=self.last_channel()).contains(&channel)
    }

    pub fn country_code(&self) -> &str {
        core::str::from_utf8(&self.country).unwrap_or("??")
    }
}

/// Access-point network configuration
///
/// Built once at boot (from the build environment on the firmware, from an
/// optional JSON file in the simulator), checked with [`NetworkConfig::validate`]
/// and then only ever shared by reference.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig<'a> {
    /// Borrowed from the source when it holds no escapes
    #[serde(borrow)]
    pub ssid: Cow<'a, str>,
    /// Ignored (and must be empty) when `access_mode` is [`AccessMode::Open`]
    #[serde(borrow)]
    pub passphrase: Cow<'a, str>,
    pub channel: u8,
    pub access_mode: AccessMode,
    pub static_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub port: u16,
    /// Maximum number of associated stations
    pub max_connections: u8,
    /// Beacon interval in time units (1 TU = 1024 µs)
    pub beacon_interval: u16,
    pub leasing: LeasingConfig,
}

impl Default for NetworkConfig<'_> {
    fn default() -> Self {
        Self {
            ssid: Cow::Borrowed("valve-ap"),
            passphrase: Cow::Borrowed(""),
            channel: 6,
            access_mode: AccessMode::Open,
            static_address: Ipv4Addr::new(192, 168, 4, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            port: DEFAULT_PORT,
            max_connections: 4,
            beacon_interval: 100,
            leasing: LeasingConfig::default(),
        }
    }
}

/// How stations authenticate with the access point
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Open,
    Wpa2Personal,
}

impl AccessMode {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Wpa2Personal => "wpa2-personal",
        }
    }
}

/// Address-leasing (DHCP server) settings
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct LeasingConfig {
    /// Restart the leasing facility after the static address is bound
    pub enabled: bool,
    /// Number of addresses handed out, starting right after the AP address
    pub pool_size: u8,
    pub lease_secs: u32,
}

impl Default for LeasingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool_size: 8,
            lease_secs: 7200,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SSID must be 1-32 bytes, got {0}")]
    SsidLength(usize),
    #[error("WPA2 passphrase must be 8-63 bytes, got {0}")]
    PassphraseLength(usize),
    #[error("an open network cannot carry a passphrase")]
    PassphraseOnOpenNetwork,
    #[error("channel {0} is outside 1-13")]
    Channel(u8),
    #[error("netmask {0} is not a contiguous prefix")]
    Netmask(Ipv4Addr),
    #[error("{0} is not a usable host address in its subnet")]
    AddressNotHost(Ipv4Addr),
    #[error("listener port must be non-zero")]
    Port,
    #[error("max connections must be 1-10, got {0}")]
    MaxConnections(u8),
    #[error("beacon interval must be 100-60000 TU, got {0}")]
    BeaconInterval(u16),
    #[error("lease pool of {0} addresses does not fit in the subnet")]
    LeasePool(u8),
    #[error("lease pool must hold 1-10 addresses, got {0}")]
    LeasePoolSize(u8),
}

impl NetworkConfig<'_> {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(ConfigError::SsidLength(self.ssid.len()));
        }

        match self.access_mode {
            AccessMode::Open if !self.passphrase.is_empty() => {
                return Err(ConfigError::PassphraseOnOpenNetwork);
            }
            AccessMode::Wpa2Personal if !(8..=63).contains(&self.passphrase.len()) => {
                return Err(ConfigError::PassphraseLength(self.passphrase.len()));
            }
            _ => {}
        }

        if !RADIO_PLAN.allows_channel(self.channel) {
            return Err(ConfigError::Channel(self.channel));
        }

        let prefix = self
            .prefix_len()
            .ok_or(ConfigError::Netmask(self.netmask))?;

        // /31 and /32 leave no room for both the AP and its clients
        if prefix > 30
            || self.static_address == self.network_address()
            || self.static_address == self.broadcast_address()
        {
            return Err(ConfigError::AddressNotHost(self.static_address));
        }

        if self.port == 0 {
            return Err(ConfigError::Port);
        }

        if !(1..=10).contains(&self.max_connections) {
            return Err(ConfigError::MaxConnections(self.max_connections));
        }

        if !(100..=60000).contains(&self.beacon_interval) {
            return Err(ConfigError::BeaconInterval(self.beacon_interval));
        }

        if self.leasing.enabled {
            let size = self.leasing.pool_size;
            if size == 0 || usize::from(size) > MAX_LEASES {
                return Err(ConfigError::LeasePoolSize(size));
            }
            let last = u32::from(self.static_address)
                .checked_add(1)
                .and_then(|first| first.checked_add(u32::from(size)));
            if last.is_none_or(|last| last > u32::from(self.broadcast_address())) {
                return Err(ConfigError::LeasePool(size));
            }
        }

        Ok(())
    }

    /// Prefix length of the netmask, `None` when the mask is not contiguous.
    pub fn prefix_len(&self) -> Option<u8> {
        netmask_to_prefix(self.netmask)
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.static_address) & u32::from(self.netmask))
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.static_address) | !u32::from(self.netmask))
    }

    /// First address handed out by the leasing facility.
    pub fn lease_pool_start(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.static_address).saturating_add(1))
    }
}

pub fn netmask_to_prefix(mask: Ipv4Addr) -> Option<u8> {
    let value = u32::from(mask);
    let prefix = value.count_ones() as u8;
    let reconstructed = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    };
    (reconstructed == value).then_some(prefix)
}
