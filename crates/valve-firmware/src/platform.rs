//! ESP32-S3 implementation of the bring-up platform
//!
//! Holds the peripherals until the sequencer asks for them, then the radio
//! controller and network stack for as long as the device runs.

use alloc::string::String;

use embassy_executor::{SpawnError, Spawner};
use embassy_net::{ConfigV4, Ipv4Cidr, Stack, StackResources, StaticConfigV4};
use esp_hal::peripherals::{FLASH, WIFI};
use esp_hal::rng::Rng;
use esp_radio::wifi::event::{self, EventExt};
use esp_radio::wifi::{
    AccessPointConfig, AuthMethod, CountryInfo, ModeConfig, PowerSaveMode, WifiController,
    WifiError,
};
use esp_storage::FlashStorage;
use log::{debug, info, warn};
use static_cell::StaticCell;
use thiserror_no_std::Error;
use valve_core::bringup::{BringUpPlatform, Toggle};
use valve_core::config::{AccessMode, NetworkConfig, RADIO_PLAN};
use valve_core::dhcp::LeasePool;
use valve_core::settings::StorageStatus;

use crate::gpio::RegisterGpio;
use crate::net::{self, HTTP_WORKERS};
use crate::settings_flash::{SettingsError, SettingsPartition};

/// HTTP workers plus the DHCP socket
const SOCKETS: usize = HTTP_WORKERS + 1;

static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();
static NET_RESOURCES: StaticCell<StackResources<SOCKETS>> = StaticCell::new();

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("settings store: {0}")]
    Settings(#[from] SettingsError),
    #[error("radio init failed: {0:?}")]
    RadioInit(esp_radio::InitializationError),
    #[error("wifi driver: {0:?}")]
    Wifi(WifiError),
    #[error("{0} requested before it was available")]
    NotReady(&'static str),
    #[error("netmask is not a contiguous prefix")]
    Netmask,
    #[error("task spawn failed: {0:?}")]
    Spawn(SpawnError),
}

impl From<WifiError> for PlatformError {
    fn from(err: WifiError) -> Self {
        PlatformError::Wifi(err)
    }
}

impl From<SpawnError> for PlatformError {
    fn from(err: SpawnError) -> Self {
        PlatformError::Spawn(err)
    }
}

pub struct EspPlatform {
    spawner: Spawner,
    actuator: &'static RegisterGpio,
    flash: Option<FLASH<'static>>,
    wifi: Option<WIFI<'static>>,
    settings: Option<SettingsPartition>,
    resources: Option<&'static mut StackResources<SOCKETS>>,
    controller: Option<WifiController<'static>>,
    stack: Option<Stack<'static>>,
    dhcp_spawned: bool,
}

impl EspPlatform {
    pub fn new(
        spawner: Spawner,
        flash: FLASH<'static>,
        wifi: WIFI<'static>,
        actuator: &'static RegisterGpio,
    ) -> Self {
        Self {
            spawner,
            actuator,
            flash: Some(flash),
            wifi: Some(wifi),
            settings: None,
            resources: None,
            controller: None,
            stack: None,
            dhcp_spawned: false,
        }
    }

    fn stack(&self) -> Result<Stack<'static>, PlatformError> {
        self.stack.ok_or(PlatformError::NotReady("network stack"))
    }

    fn controller(&mut self) -> Result<&mut WifiController<'static>, PlatformError> {
        self.controller
            .as_mut()
            .ok_or(PlatformError::NotReady("wifi controller"))
    }

    /// Logs what actually came up and starts reporting station joins.
    pub fn finish(&self, config: &NetworkConfig<'_>) {
        match self.stack.and_then(|stack| stack.config_v4()) {
            Some(v4) => info!("interface address {}", v4.address),
            None => warn!("interface has no IPv4 address after bring-up"),
        }

        let started = self
            .controller
            .as_ref()
            .and_then(|c| c.is_started().ok())
            .unwrap_or(false);
        info!(
            "ready: ssid=\"{}\" channel={} auth={} started={} leasing={} control=http://{}:{}/gpio",
            config.ssid,
            config.channel,
            config.access_mode.label(),
            started,
            net::leasing_enabled(),
            config.static_address,
            config.port
        );

        event::ApStaConnected::update_handler(|event| {
            info!("station joined: {:02x?} (aid {})", event.mac(), event.aid());
        });
        event::ApStaDisconnected::update_handler(|event| {
            info!("station left: {:02x?} (aid {})", event.mac(), event.aid());
        });
    }
}

impl BringUpPlatform for EspPlatform {
    type Error = PlatformError;

    fn init_storage(&mut self) -> Result<StorageStatus, PlatformError> {
        if self.settings.is_none() {
            let flash = self.flash.take().ok_or(PlatformError::NotReady("flash"))?;
            self.settings = Some(SettingsPartition::locate(FlashStorage::new(flash))?);
        }
        let settings = self
            .settings
            .as_mut()
            .ok_or(PlatformError::NotReady("settings partition"))?;
        Ok(settings.scan()?)
    }

    fn erase_storage(&mut self) -> Result<(), PlatformError> {
        let settings = self
            .settings
            .as_mut()
            .ok_or(PlatformError::NotReady("settings partition"))?;
        Ok(settings.erase()?)
    }

    fn create_ap_interface(&mut self) -> Result<(), PlatformError> {
        let resources = NET_RESOURCES
            .try_init(StackResources::new())
            .ok_or(PlatformError::NotReady("fresh socket resources"))?;
        self.resources = Some(resources);
        Ok(())
    }

    fn init_radio(&mut self) -> Result<(), PlatformError> {
        let resources = self
            .resources
            .take()
            .ok_or(PlatformError::NotReady("access-point interface"))?;
        let wifi = self.wifi.take().ok_or(PlatformError::NotReady("wifi"))?;

        let radio = esp_radio::init().map_err(PlatformError::RadioInit)?;
        let radio = RADIO
            .try_init(radio)
            .ok_or(PlatformError::NotReady("fresh radio"))?;
        // The country code selects channels 1-13 in the driver
        let radio_config = esp_radio::wifi::Config::default()
            .with_country_code(CountryInfo::from(RADIO_PLAN.country));
        let (controller, interfaces) = esp_radio::wifi::new(radio, wifi, radio_config)?;
        info!(
            "radio country {} channels {}-{}",
            RADIO_PLAN.country_code(),
            RADIO_PLAN.first_channel,
            RADIO_PLAN.last_channel()
        );

        let rng = Rng::new();
        let seed = (u64::from(rng.random()) << 32) | u64::from(rng.random());

        // No address yet; it is assigned once the radio is up
        let (stack, runner) = embassy_net::new(
            interfaces.ap,
            embassy_net::Config::default(),
            resources,
            seed,
        );
        self.spawner.spawn(net::net_task(runner)?);

        self.controller = Some(controller);
        self.stack = Some(stack);
        Ok(())
    }

    fn configure_access_point(&mut self, config: &NetworkConfig<'_>) -> Result<(), PlatformError> {
        let auth = match config.access_mode {
            AccessMode::Open => AuthMethod::None,
            AccessMode::Wpa2Personal => AuthMethod::Wpa2Personal,
        };
        let ap = AccessPointConfig::default()
            .with_ssid(String::from(config.ssid.as_ref()))
            .with_password(String::from(config.passphrase.as_ref()))
            .with_channel(config.channel)
            .with_auth_method(auth)
            .with_max_connections(u16::from(config.max_connections));

        let controller = self.controller()?;
        controller.set_config(&ModeConfig::AccessPoint(ap))?;
        debug!(
            "beacon interval {} TU left at driver default",
            config.beacon_interval
        );
        Ok(())
    }

    async fn start_radio(&mut self) -> Result<(), PlatformError> {
        let controller = self.controller()?;
        controller.start_async().await?;
        controller.set_power_saving(PowerSaveMode::None)?;
        debug!(
            "protocols {}, ht20={}, max tx power {} (0.25 dBm) left at driver default",
            RADIO_PLAN.protocols,
            RADIO_PLAN.ht20,
            RADIO_PLAN.max_tx_power
        );
        Ok(())
    }

    fn stop_leasing(&mut self) -> Result<Toggle, PlatformError> {
        Ok(net::set_leasing(false))
    }

    fn assign_address(&mut self, config: &NetworkConfig<'_>) -> Result<(), PlatformError> {
        let prefix = config.prefix_len().ok_or(PlatformError::Netmask)?;
        let stack = self.stack()?;
        stack.set_config_v4(ConfigV4::Static(StaticConfigV4 {
            address: Ipv4Cidr::new(config.static_address, prefix),
            gateway: Some(config.static_address),
            dns_servers: Default::default(),
        }));
        Ok(())
    }

    fn start_leasing(&mut self, config: &NetworkConfig<'_>) -> Result<Toggle, PlatformError> {
        if !self.dhcp_spawned {
            let stack = self.stack()?;
            self.spawner
                .spawn(net::dhcp_task(stack, LeasePool::new(config))?);
            self.dhcp_spawned = true;
        }
        Ok(net::set_leasing(true))
    }

    fn start_listener(&mut self, port: u16) -> Result<(), PlatformError> {
        let stack = self.stack()?;
        for worker_id in 0..HTTP_WORKERS {
            self.spawner
                .spawn(net::http_worker(stack, port, self.actuator, worker_id)?);
        }
        info!("listening on port {} with {} workers", port, HTTP_WORKERS);
        Ok(())
    }
}
