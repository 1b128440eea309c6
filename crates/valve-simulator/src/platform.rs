//! Host implementation of the bring-up platform
//!
//! Mirrors the firmware's ordering rules without a radio: the settings store
//! is a list of page headers in memory, the "access point" is a record of the
//! applied settings, and the listener is a std TCP socket on localhost.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use embassy_futures::block_on;
use log::{debug, info, warn};
use thiserror_no_std::Error;
use valve_core::bringup::{BringUpPlatform, Toggle};
use valve_core::config::NetworkConfig;
use valve_core::endpoint::serve_connection;
use valve_core::settings::{PAGE_HEADER_LEN, StorageStatus, StoreScan};

use crate::pins::SimulatedPins;
use crate::stream::StreamIo;

const STORE_PAGES: usize = 6;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SimError {
    #[error("{0} requested before it was available")]
    OutOfOrder(&'static str),
    #[error("cannot listen on port {port}: {cause}")]
    Bind { port: u16, cause: io::Error },
}

/// Access-point settings as the simulated radio accepted them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub channel: u8,
    pub max_connections: u8,
}

pub struct SimulatedPlatform {
    pins: Arc<SimulatedPins>,
    store: Vec<[u8; PAGE_HEADER_LEN]>,
    interface_created: bool,
    radio_initialized: bool,
    access_point: Option<AccessPoint>,
    radio_started: bool,
    address: Option<Ipv4Addr>,
    leasing: bool,
    listener: Option<(SocketAddr, JoinHandle<()>)>,
}

impl SimulatedPlatform {
    pub fn new(pins: Arc<SimulatedPins>) -> Self {
        Self {
            pins,
            store: vec![[0xFF; PAGE_HEADER_LEN]; STORE_PAGES],
            interface_created: false,
            radio_initialized: false,
            access_point: None,
            radio_started: false,
            address: None,
            leasing: false,
            listener: None,
        }
    }

    /// Overwrites the first store page with an unknown state word.
    pub fn corrupt_store(&mut self) {
        self.store[0][..4].copy_from_slice(&0x1234_5678u32.to_le_bytes());
    }

    pub fn access_point(&self) -> Option<&AccessPoint> {
        self.access_point.as_ref()
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    pub fn leasing(&self) -> bool {
        self.leasing
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|(addr, _)| *addr)
    }

    /// Blocks on the accept loop until the listener fails.
    pub fn serve_forever(self) {
        if let Some((_, handle)) = self.listener
            && handle.join().is_err()
        {
            warn!("accept loop panicked");
        }
    }
}

impl BringUpPlatform for SimulatedPlatform {
    type Error = SimError;

    fn init_storage(&mut self) -> Result<StorageStatus, SimError> {
        let mut scan = StoreScan::new();
        for header in &self.store {
            scan.push_page(header);
        }
        Ok(scan.finish())
    }

    fn erase_storage(&mut self) -> Result<(), SimError> {
        for header in &mut self.store {
            *header = [0xFF; PAGE_HEADER_LEN];
        }
        Ok(())
    }

    fn create_ap_interface(&mut self) -> Result<(), SimError> {
        self.interface_created = true;
        Ok(())
    }

    fn init_radio(&mut self) -> Result<(), SimError> {
        if !self.interface_created {
            return Err(SimError::OutOfOrder("radio driver"));
        }
        self.radio_initialized = true;
        Ok(())
    }

    fn configure_access_point(&mut self, config: &NetworkConfig<'_>) -> Result<(), SimError> {
        if !self.radio_initialized {
            return Err(SimError::OutOfOrder("access-point settings"));
        }
        self.access_point = Some(AccessPoint {
            ssid: config.ssid.to_string(),
            channel: config.channel,
            max_connections: config.max_connections,
        });
        Ok(())
    }

    async fn start_radio(&mut self) -> Result<(), SimError> {
        if self.access_point.is_none() {
            return Err(SimError::OutOfOrder("radio start"));
        }
        self.radio_started = true;
        Ok(())
    }

    fn stop_leasing(&mut self) -> Result<Toggle, SimError> {
        Ok(switch(&mut self.leasing, false))
    }

    fn assign_address(&mut self, config: &NetworkConfig<'_>) -> Result<(), SimError> {
        if !self.radio_started {
            return Err(SimError::OutOfOrder("static address"));
        }
        if self.leasing {
            return Err(SimError::OutOfOrder("static address while leasing"));
        }
        self.address = Some(config.static_address);
        Ok(())
    }

    fn start_leasing(&mut self, config: &NetworkConfig<'_>) -> Result<Toggle, SimError> {
        if self.address.is_none() {
            return Err(SimError::OutOfOrder("leasing"));
        }
        debug!(
            "leasing {} addresses from {}",
            config.leasing.pool_size,
            config.lease_pool_start()
        );
        Ok(switch(&mut self.leasing, true))
    }

    fn start_listener(&mut self, port: u16) -> Result<(), SimError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .map_err(|cause| SimError::Bind { port, cause })?;
        let addr = listener
            .local_addr()
            .map_err(|cause| SimError::Bind { port, cause })?;

        let pins = Arc::clone(&self.pins);
        let handle = thread::spawn(move || accept_loop(listener, pins));
        info!("control endpoint at http://{}/gpio", addr);

        self.listener = Some((addr, handle));
        Ok(())
    }
}

fn switch(flag: &mut bool, on: bool) -> Toggle {
    if *flag == on {
        Toggle::AlreadyInState
    } else {
        *flag = on;
        Toggle::Changed
    }
}

fn accept_loop(listener: TcpListener, pins: Arc<SimulatedPins>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
            warn!("cannot set read timeout: {}", e);
        }

        let pins = Arc::clone(&pins);
        thread::spawn(move || {
            let mut io = StreamIo(stream);
            if let Err(e) = block_on(serve_connection(&mut io, &*pins)) {
                debug!("connection dropped: {}", e);
            }
        });
    }
}
