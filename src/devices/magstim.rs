//! Magstim Rapid stimulator driver (serial poke/arm protocol)
//!
//! The stimulator drops out of remote control unless it is poked
//! periodically: every 5 s while disarmed, every 500 ms while armed. Arming
//! and disarming therefore retune the command worker's keep-alive cadence on
//! the fly, preserving the elapsed part of the current poke cycle.

use super::worker::Heartbeat;
use super::{Ack, Command, CommandDriver, Device, DeviceError};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{info, warn};

/// USB identity of the Prolific adapter the stimulator ships with
pub const USB_VID: u16 = 0x067B;
pub const USB_PID: u16 = 0x2303;

pub const BAUD_RATE: u32 = 9600;
/// Poke cadence while armed
pub const ARMED_POKE_INTERVAL: Duration = Duration::from_millis(500);
/// Poke cadence while disarmed
pub const DISARMED_POKE_INTERVAL: Duration = Duration::from_secs(5);

/// Serial read deadline; replies are short and prompt
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Status replies are fixed-size
const REPLY_LEN: usize = 9;

/// Checksum appended to every on-wire command: the inverted byte sum
pub fn checksum(data: &[u8]) -> u8 {
    !(data.iter().fold(0u32, |acc, &b| acc + u32::from(b)) as u8)
}

/// Serial transport seam; the production implementation wraps `serialport`,
/// tests script it
pub trait StimPort: Send + 'static {
    fn connect(&mut self) -> Result<(), DeviceError>;
    fn disconnect(&mut self);
    fn write_all(&mut self, data: &[u8]) -> Result<(), DeviceError>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError>;
    /// RTS line; raised for the fast-communication mode
    fn set_rts(&mut self, on: bool) -> Result<(), DeviceError>;
}

/// 9600 8-N-1, no flow control
pub struct SerialLink {
    path: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            port: None,
        }
    }
}

impl StimPort for SerialLink {
    fn connect(&mut self) -> Result<(), DeviceError> {
        let port = serialport::new(&self.path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| DeviceError::ConnectFailed(e.to_string()))?;
        self.port = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.port = None;
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let port = self.port.as_mut().ok_or(DeviceError::NotConnected)?;
        port.write_all(data).map_err(|e| {
            warn!("Serial write error on {} - {e}", self.path);
            self.port = None;
            DeviceError::TransportClosed
        })
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let port = self.port.as_mut().ok_or(DeviceError::NotConnected)?;
        port.read_exact(buf).map_err(|e| {
            warn!("Serial read error on {} - {e}", self.path);
            self.port = None;
            DeviceError::TransportClosed
        })
    }

    fn set_rts(&mut self, on: bool) -> Result<(), DeviceError> {
        let port = self.port.as_mut().ok_or(DeviceError::NotConnected)?;
        port.write_request_to_send(on).map_err(|e| {
            warn!("Could not set RTS on {} - {e}", self.path);
            DeviceError::TransportClosed
        })?;
        info!("RTS set to {}", if on { "ON" } else { "OFF" });
        Ok(())
    }
}

/// Scan the serial ports for the stimulator's USB adapter
pub fn find_port() -> Result<String, DeviceError> {
    let ports = serialport::available_ports()
        .map_err(|e| DeviceError::ConnectFailed(e.to_string()))?;
    ports
        .into_iter()
        .find_map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(usb)
                if usb.vid == USB_VID && usb.pid == USB_PID =>
            {
                Some(p.port_name)
            }
            _ => None,
        })
        .ok_or_else(|| {
            DeviceError::ConnectFailed(format!(
                "no serial port with VID {USB_VID:04X} / PID {USB_PID:04X}"
            ))
        })
}

struct MagstimDriver {
    port: Box<dyn StimPort>,
    is_armed: bool,
    armed_interval: Duration,
    disarmed_interval: Duration,
}

impl MagstimDriver {
    fn write_command(&mut self, token: &[u8]) -> Result<(), DeviceError> {
        let mut wire = token.to_vec();
        wire.push(checksum(token));
        self.port.write_all(&wire)
    }

    /// Flip the armed state and swap the poke cadence, keeping the elapsed
    /// part of the current cycle
    fn set_armed(&mut self, armed: bool, heartbeat: &mut Heartbeat) -> Result<(), DeviceError> {
        self.write_command(if armed { b"EB" } else { b"EA" })?;
        self.is_armed = armed;
        let interval = if armed {
            self.armed_interval
        } else {
            self.disarmed_interval
        };
        heartbeat.set_interval(interval);
        info!(
            "{} the stimulator, poke interval is now {interval:?}",
            if armed { "Armed" } else { "Disarmed" }
        );
        Ok(())
    }
}

impl CommandDriver for MagstimDriver {
    fn connect(&mut self) -> Result<(), DeviceError> {
        self.port.connect()
    }

    fn disconnect(&mut self) {
        self.port.disconnect();
    }

    fn command(
        &mut self,
        command: &Command,
        heartbeat: &mut Heartbeat,
    ) -> Result<Ack, DeviceError> {
        match command {
            Command::Poke => {
                self.write_command(b"Q@")?;
                Ok(Ack::Ok)
            }
            Command::Print(message) => {
                info!("Sent command: {message}");
                Ok(Ack::Ok)
            }
            Command::GetTemperature => {
                self.write_command(b"F@")?;
                let mut reply = [0u8; REPLY_LEN];
                self.port.read_exact(&mut reply)?;
                let celsius = std::str::from_utf8(&reply[2..5])
                    .ok()
                    .and_then(|s| s.parse::<i32>().ok())
                    .ok_or(DeviceError::TransportClosed)?;
                Ok(Ack::Value(celsius))
            }
            Command::Arm => {
                if self.is_armed {
                    return Err(DeviceError::AlreadyArmed);
                }
                self.set_armed(true, heartbeat)?;
                Ok(Ack::Ok)
            }
            Command::Disarm => {
                if !self.is_armed {
                    return Err(DeviceError::NotArmed);
                }
                self.set_armed(false, heartbeat)?;
                Ok(Ack::Ok)
            }
            Command::SetFastCommunication(on) => {
                self.port.set_rts(*on)?;
                Ok(Ack::Ok)
            }
            _ => Err(DeviceError::UnknownCommand),
        }
    }

    fn ping(&mut self) -> Result<(), DeviceError> {
        self.write_command(b"Q@")
    }

    fn keep_alive_interval(&self) -> Duration {
        self.disarmed_interval
    }
}

/// A Magstim Rapid on a known serial port
pub fn rapid(path: impl Into<String>) -> Device {
    rapid_over(Box::new(SerialLink::new(path)))
}

/// A Magstim Rapid on the first matching USB serial adapter
pub fn rapid_auto() -> Result<Device, DeviceError> {
    Ok(rapid(find_port()?))
}

/// A Magstim device over an arbitrary transport (mocks in tests)
pub fn rapid_over(port: Box<dyn StimPort>) -> Device {
    Device::new(
        "magstim",
        Box::new(MagstimDriver {
            port,
            is_armed: false,
            armed_interval: ARMED_POKE_INTERVAL,
            disarmed_interval: DISARMED_POKE_INTERVAL,
        }),
    )
}
