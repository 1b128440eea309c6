//! Network tasks running on top of the embassy-net stack
//!
//! - `net_task` drives the stack itself
//! - `dhcp_task` answers address requests from joining stations
//! - `http_worker` accepts control connections, several in parallel

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_net::tcp::TcpSocket;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use embassy_time::{Duration, Instant, Timer};
use esp_radio::wifi::WifiDevice;
use log::{debug, info, warn};
use valve_core::bringup::Toggle;
use valve_core::dhcp::{self, LeasePool};
use valve_core::endpoint::serve_connection;

use crate::gpio::RegisterGpio;

/// Connections served concurrently
pub const HTTP_WORKERS: usize = 3;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_millis(200);

static LEASING_ENABLED: AtomicBool = AtomicBool::new(false);

/// Switches the leasing facility. The DHCP task keeps its socket open either
/// way; while disabled it drops every request and forgets its leases.
pub fn set_leasing(enabled: bool) -> Toggle {
    if LEASING_ENABLED.swap(enabled, Ordering::AcqRel) == enabled {
        Toggle::AlreadyInState
    } else {
        Toggle::Changed
    }
}

pub fn leasing_enabled() -> bool {
    LEASING_ENABLED.load(Ordering::Acquire)
}

#[embassy_executor::task]
pub async fn net_task(mut runner: embassy_net::Runner<'static, WifiDevice<'static>>) {
    runner.run().await;
}

#[embassy_executor::task]
pub async fn dhcp_task(stack: Stack<'static>, mut pool: LeasePool) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_storage = [0u8; 2 * dhcp::FRAME_SIZE];
    let mut tx_storage = [0u8; 2 * dhcp::FRAME_SIZE];
    let mut frame = [0u8; dhcp::FRAME_SIZE];
    let mut reply = [0u8; dhcp::FRAME_SIZE];

    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_storage,
        &mut tx_meta,
        &mut tx_storage,
    );
    while let Err(err) = socket.bind(dhcp::SERVER_PORT) {
        warn!("dhcp: bind {} failed: {:?}", dhcp::SERVER_PORT, err);
        Timer::after(RETRY_DELAY).await;
    }

    info!("dhcp: serving on port {}", dhcp::SERVER_PORT);

    loop {
        let len = match socket.recv_from(&mut frame).await {
            Ok((len, _meta)) => len,
            Err(err) => {
                warn!("dhcp: receive failed: {:?}", err);
                continue;
            }
        };

        if !leasing_enabled() {
            if pool.active_leases() > 0 {
                debug!("dhcp: disabled, dropping {} leases", pool.active_leases());
                pool.clear();
            }
            continue;
        }

        let now_ms = Instant::now().as_millis();
        let Some(out) = pool.handle(&frame[..len], now_ms, &mut reply) else {
            continue;
        };
        let destination = IpEndpoint::new(IpAddress::Ipv4(out.destination), dhcp::CLIENT_PORT);
        if let Err(err) = socket.send_to(&reply[..out.len], destination).await {
            warn!("dhcp: send failed: {:?}", err);
        }
    }
}

#[embassy_executor::task(pool_size = HTTP_WORKERS)]
pub async fn http_worker(
    stack: Stack<'static>,
    port: u16,
    actuator: &'static RegisterGpio,
    worker_id: usize,
) {
    let mut rx_buf = [0u8; 1536];
    let mut tx_buf = [0u8; 512];

    debug!("http worker {} listening on port {}", worker_id, port);

    loop {
        let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
        socket.set_timeout(Some(HTTP_TIMEOUT));

        match socket.accept(port).await {
            Ok(()) => {
                if let Err(err) = serve_connection(&mut SocketIo(&mut socket), actuator).await {
                    warn!("http worker {}: {}", worker_id, err);
                }
            }
            Err(err) => {
                warn!("http worker {} accept error: {:?}", worker_id, err);
                Timer::after(RETRY_DELAY).await;
            }
        }

        socket.abort();
    }
}

#[derive(Debug)]
pub struct SocketError(embassy_net::tcp::Error);

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket error: {:?}", self.0)
    }
}

impl core::error::Error for SocketError {}

impl embedded_io::Error for SocketError {
    fn kind(&self) -> embedded_io::ErrorKind {
        embedded_io::ErrorKind::ConnectionReset
    }
}

/// Exposes a TCP socket through the I/O traits the connection handler is
/// written against.
struct SocketIo<'s, 'a>(&'s mut TcpSocket<'a>);

impl embedded_io_async::ErrorType for SocketIo<'_, '_> {
    type Error = SocketError;
}

impl embedded_io_async::Read for SocketIo<'_, '_> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf).await.map_err(SocketError)
    }
}

impl embedded_io_async::Write for SocketIo<'_, '_> {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf).await.map_err(SocketError)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush().await.map_err(SocketError)
    }
}
