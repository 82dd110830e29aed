//! Fixed-header framing shared by the control server and client
//!
//! Every frame on every socket is the same 8 bytes: a big-endian protocol
//! version followed by a big-endian code. The code is a command on the
//! command socket, OK/NOK on acknowledgments, and a payload byte count on
//! the preamble of a data frame.

use std::io::{Read, Write};

/// Must match on both ends of the handshake
pub const PROTOCOL_VERSION: u32 = 1;
/// Every frame is exactly this long
pub const PACKET_LEN: usize = 8;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum WireError {
    #[error("connection failed: {0}")]
    Io(String),
    #[error("protocol version {0} does not match {PROTOCOL_VERSION}")]
    VersionMismatch(u32),
    #[error("unknown command code {0}")]
    UnknownCommand(u32),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Client-to-server command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientCommand {
    Handshake = 0,
    ConnectDelsysAnalog = 1,
    ConnectDelsysEmg = 2,
    ConnectMagstim = 3,
    DisconnectDelsysAnalog = 4,
    DisconnectDelsysEmg = 5,
    DisconnectMagstim = 6,
    StartRecording = 7,
    StopRecording = 8,
    GetLastTrialData = 9,
    Failed = 10,
}

impl TryFrom<u32> for ClientCommand {
    type Error = WireError;

    fn try_from(code: u32) -> Result<Self, WireError> {
        Ok(match code {
            0 => Self::Handshake,
            1 => Self::ConnectDelsysAnalog,
            2 => Self::ConnectDelsysEmg,
            3 => Self::ConnectMagstim,
            4 => Self::DisconnectDelsysAnalog,
            5 => Self::DisconnectDelsysEmg,
            6 => Self::DisconnectMagstim,
            7 => Self::StartRecording,
            8 => Self::StopRecording,
            9 => Self::GetLastTrialData,
            10 => Self::Failed,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

/// Server-to-client acknowledgment codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AckCode {
    Nok = 0,
    Ok = 1,
}

/// One 8-byte frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub version: u32,
    pub code: u32,
}

impl Packet {
    pub fn new(code: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            code,
        }
    }

    pub fn command(command: ClientCommand) -> Self {
        Self::new(command as u32)
    }

    pub fn ack(ack: AckCode) -> Self {
        Self::new(ack as u32)
    }

    pub fn to_bytes(self) -> [u8; PACKET_LEN] {
        let mut out = [0u8; PACKET_LEN];
        out[..4].copy_from_slice(&self.version.to_be_bytes());
        out[4..].copy_from_slice(&self.code.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; PACKET_LEN]) -> Self {
        Self {
            version: u32::from_be_bytes(bytes[..4].try_into().unwrap()),
            code: u32::from_be_bytes(bytes[4..].try_into().unwrap()),
        }
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self, WireError> {
        let mut buf = [0u8; PACKET_LEN];
        reader.read_exact(&mut buf)?;
        Ok(Self::from_bytes(buf))
    }

    pub fn write_to(self, writer: &mut impl Write) -> Result<(), WireError> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Version-check, then interpret the code as a command
    pub fn parse_command(self) -> Result<ClientCommand, WireError> {
        if self.version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch(self.version));
        }
        ClientCommand::try_from(self.code)
    }

    /// Version-check, then interpret the code as an acknowledgment
    pub fn parse_ack(self) -> Result<AckCode, WireError> {
        if self.version != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch(self.version));
        }
        match self.code {
            0 => Ok(AckCode::Nok),
            _ => Ok(AckCode::Ok),
        }
    }
}

/// Send a `(version, length)` preamble followed by the payload bytes
pub fn write_payload(writer: &mut impl Write, payload: &[u8]) -> Result<(), WireError> {
    Packet::new(payload.len() as u32).write_to(writer)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read a `(version, length)` preamble and the payload it announces
pub fn read_payload(reader: &mut impl Read) -> Result<Vec<u8>, WireError> {
    let preamble = Packet::read_from(reader)?;
    if preamble.version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch(preamble.version));
    }
    let mut payload = vec![0u8; preamble.code as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_are_big_endian() {
        let bytes = Packet::command(ClientCommand::GetLastTrialData).to_bytes();
        assert_eq!(bytes, [0, 0, 0, 1, 0, 0, 0, 9]);
        let packet = Packet::from_bytes(bytes);
        assert_eq!(packet.version, 1);
        assert_eq!(packet.code, 9);
    }

    #[test]
    fn command_codes_round_trip() {
        for code in 0..=10u32 {
            let command = ClientCommand::try_from(code).unwrap();
            assert_eq!(command as u32, code);
        }
        assert_eq!(
            ClientCommand::try_from(11),
            Err(WireError::UnknownCommand(11))
        );
    }

    #[test]
    fn version_is_checked() {
        let stale = Packet {
            version: 2,
            code: 0,
        };
        assert_eq!(
            stale.parse_command(),
            Err(WireError::VersionMismatch(2))
        );
        assert_eq!(stale.parse_ack(), Err(WireError::VersionMismatch(2)));
    }

    #[test]
    fn payload_framing_round_trips() {
        let mut wire = Vec::new();
        write_payload(&mut wire, b"{\"x\":1}").unwrap();
        assert_eq!(&wire[..8], &[0, 0, 0, 1, 0, 0, 0, 7]);
        let mut cursor = std::io::Cursor::new(wire);
        let payload = read_payload(&mut cursor).unwrap();
        assert_eq!(payload, b"{\"x\":1}");
    }

    #[test]
    fn stream_io_round_trips() {
        let mut wire = Vec::new();
        Packet::ack(AckCode::Ok).write_to(&mut wire).unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let packet = Packet::read_from(&mut cursor).unwrap();
        assert_eq!(packet.parse_ack(), Ok(AckCode::Ok));
    }
}
