//! Blocking TCP transport used inside device drivers

use super::DeviceError;
use socket2::SockRef;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::warn;

/// Default bound on a transport connect attempt
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Byte transport seam between drivers and the wire. Split out so the Delsys
/// and Magstim protocol code can run over scripted transports in tests.
///
/// Not thread-safe; every link is owned by exactly one worker (or sits behind
/// the shared command-channel mutex).
pub trait Link: Send {
    fn connect(&mut self) -> Result<(), DeviceError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// Read exactly `buf.len()` bytes or fail
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError>;
    /// Read whatever is available, up to `buf.len()` bytes
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;
    /// Write all of `data` or fail
    fn write_all(&mut self, data: &[u8]) -> Result<(), DeviceError>;
}

/// A blocking TCP [`Link`]. Every read/write failure closes the socket and
/// surfaces [`DeviceError::TransportClosed`]; the enclosing worker turns that
/// into a device disconnect.
pub struct TcpLink {
    host: String,
    port: u16,
    connect_timeout: Duration,
    recv_buffer_size: Option<usize>,
    stream: Option<TcpStream>,
}

impl TcpLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: CONNECT_TIMEOUT,
            recv_buffer_size: None,
            stream: None,
        }
    }

    /// Ask the kernel for a bigger receive buffer (high-rate data sockets)
    pub fn with_recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer_size = Some(bytes);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Close on error and report the transport gone
    fn fail(&mut self, context: &str, e: std::io::Error) -> DeviceError {
        warn!("TCP {context} error on {}:{} - {e}", self.host, self.port);
        self.disconnect();
        DeviceError::TransportClosed
    }
}

impl Link for TcpLink {
    fn connect(&mut self) -> Result<(), DeviceError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| DeviceError::ConnectFailed(e.to_string()))?
            .next()
            .ok_or_else(|| {
                DeviceError::ConnectFailed(format!("could not resolve {}", self.host))
            })?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| DeviceError::ConnectFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| DeviceError::ConnectFailed(e.to_string()))?;
        if let Some(bytes) = self.recv_buffer_size {
            SockRef::from(&stream)
                .set_recv_buffer_size(bytes)
                .map_err(|e| DeviceError::ConnectFailed(e.to_string()))?;
        }
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;
        match stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail("read", e)),
        }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;
        match stream.read(buf) {
            Ok(0) => Err(self.fail(
                "read",
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed"),
            )),
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail("read", e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;
        match stream.write_all(data) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail("write", e)),
        }
    }
}
