//! Blocking `TcpStream` behind the async I/O traits
//!
//! Each connection runs on its own thread under `block_on`, so blocking
//! inside the async methods only stalls that connection.

use std::io::{Read as _, Write as _};
use std::net::TcpStream;

pub struct StreamIo(pub TcpStream);

impl embedded_io_async::ErrorType for StreamIo {
    type Error = std::io::Error;
}

impl embedded_io_async::Read for StreamIo {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.0.read(buf)
    }
}

impl embedded_io_async::Write for StreamIo {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.write(buf)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        self.0.flush()
    }
}
