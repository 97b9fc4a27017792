//! Binary frame format.
//!
//! Frame layout (4 bytes header + payload + 1 byte checksum), identical in
//! both directions:
//!
//! ```text
//! +-----------+---------+-----------+--------+-------------+----------+
//! | direction | command | type code | length | payload     | checksum |
//! |  1 byte   | 1 byte  |  1 byte   | 1 byte | length bytes|  1 byte  |
//! +-----------+---------+-----------+--------+-------------+----------+
//! ```
//!
//! `checksum = (type + length + sum(payload)) mod 256`.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};

/// Header, length and checksum bytes around the payload.
pub const FRAME_OVERHEAD: usize = 5;

/// The length field is a single byte.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Which side sent the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host (`0xF0`).
    DeviceToHost,
    /// Host to device (`0xF1`).
    HostToDevice,
}

impl Direction {
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::DeviceToHost => 0xF0,
            Direction::HostToDevice => 0xF1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0xF0 => Ok(Direction::DeviceToHost),
            0xF1 => Ok(Direction::HostToDevice),
            other => Err(ProtocolError::UnknownDirection(other)),
        }
    }
}

/// Frame command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Read a value (`0xA1`). Device responses and pushes use this code too.
    Get,
    /// Write a value (`0xB1`).
    Set,
    /// Select the link baud rate by 1-based table index (`0xB0`).
    SelectBaud,
    /// Open (payload 1) or close (payload 0) the host session (`0xC1`).
    Session,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        match self {
            Command::Get => 0xA1,
            Command::Set => 0xB1,
            Command::SelectBaud => 0xB0,
            Command::Session => 0xC1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0xA1 => Ok(Command::Get),
            0xB1 => Ok(Command::Set),
            0xB0 => Ok(Command::SelectBaud),
            0xC1 => Ok(Command::Session),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Computes the frame checksum over the type code, payload length and payload.
pub fn checksum(type_code: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(type_code.wrapping_add(payload.len() as u8), |acc, b| {
            acc.wrapping_add(*b)
        })
}

/// A protocol frame.
///
/// The checksum is not stored: it is computed on encode and verified on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub direction: Direction,
    pub command: Command,
    pub type_code: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new frame with the given payload.
    pub fn new(
        direction: Direction,
        command: Command,
        type_code: u8,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            direction,
            command,
            type_code,
            payload: payload.into(),
        }
    }

    /// Creates a frame with a single-byte payload.
    pub fn with_byte(direction: Direction, command: Command, type_code: u8, value: u8) -> Self {
        Self::new(
            direction,
            command,
            type_code,
            Bytes::copy_from_slice(&[value]),
        )
    }

    /// Creates a frame whose payload is a little-endian f32.
    pub fn with_f32(direction: Direction, command: Command, type_code: u8, value: f32) -> Self {
        Self::new(
            direction,
            command,
            type_code,
            Bytes::copy_from_slice(&value.to_le_bytes()),
        )
    }

    /// Host request for the value behind `type_code`.
    ///
    /// The device expects a single zero byte as payload.
    pub fn get(type_code: u8) -> Self {
        Self::with_byte(Direction::HostToDevice, Command::Get, type_code, 0)
    }

    /// Host write of a float value.
    pub fn set_f32(type_code: u8, value: f32) -> Self {
        Self::with_f32(Direction::HostToDevice, Command::Set, type_code, value)
    }

    /// Host write of a byte value.
    pub fn set_byte(type_code: u8, value: u8) -> Self {
        Self::with_byte(Direction::HostToDevice, Command::Set, type_code, value)
    }

    /// Device response or push carrying `payload`.
    pub fn response(type_code: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(Direction::DeviceToHost, Command::Get, type_code, payload)
    }

    /// Checksum this frame will carry on the wire.
    pub fn checksum(&self) -> u8 {
        checksum(self.type_code, &self.payload)
    }

    /// Total encoded length.
    pub fn encoded_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    /// Encodes the frame into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.direction.as_byte());
        buf.put_u8(self.command.as_byte());
        buf.put_u8(self.type_code);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_u8(self.checksum());

        Ok(buf)
    }

    /// Reads a little-endian f32 at `offset`, if the payload is long enough.
    pub fn f32_at(&self, offset: usize) -> Option<f32> {
        read_f32(&self.payload, offset)
    }
}

pub(crate) fn read_f32(payload: &[u8], offset: usize) -> Option<f32> {
    let bytes = payload.get(offset..offset + 4)?;
    Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(0, &[]), 0);
        assert_eq!(checksum(0xC1, &[0x00, 0x00, 0xA0, 0x40]), 0xA5);
        // wraps modulo 256
        assert_eq!(checksum(0xFF, &[0xFF, 0xFF]), (0xFFu32 * 3 + 2) as u8);
    }

    #[test]
    fn test_encode_set_voltage() {
        let encoded = Frame::set_f32(193, 5.0).encode().unwrap();
        let expected_checksum = ((0xC1u32 + 4 + 0xA0 + 0x40) % 256) as u8;
        assert_eq!(
            &encoded[..],
            &[0xF1, 0xB1, 0xC1, 0x04, 0x00, 0x00, 0xA0, 0x40, expected_checksum]
        );
    }

    #[test]
    fn test_encode_byte_payload() {
        let encoded = Frame::set_byte(219, 1).encode().unwrap();
        assert_eq!(&encoded[..], &[0xF1, 0xB1, 219, 1, 1, 221]);
    }

    #[test]
    fn test_encode_get_request() {
        let encoded = Frame::get(255).encode().unwrap();
        assert_eq!(&encoded[..], &[0xF1, 0xA1, 0xFF, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_empty_payload() {
        let frame = Frame::new(Direction::HostToDevice, Command::Get, 7, Bytes::new());
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), FRAME_OVERHEAD);
        assert_eq!(&encoded[..], &[0xF1, 0xA1, 7, 0, 7]);
    }

    #[test]
    fn test_encode_max_payload() {
        let frame = Frame::response(1, vec![1u8; MAX_PAYLOAD_LEN]);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), MAX_PAYLOAD_LEN + FRAME_OVERHEAD);
        assert_eq!(encoded[3], 0xFF);
    }

    #[test]
    fn test_payload_too_large() {
        let frame = Frame::response(1, vec![0u8; MAX_PAYLOAD_LEN + 1]);
        let result = frame.encode();
        assert!(matches!(
            result,
            Err(ProtocolError::PayloadTooLarge { size: 256, max: 255 })
        ));
    }

    #[test]
    fn test_direction_and_command_bytes() {
        for dir in [Direction::DeviceToHost, Direction::HostToDevice] {
            assert_eq!(Direction::from_byte(dir.as_byte()).unwrap(), dir);
        }
        for cmd in [
            Command::Get,
            Command::Set,
            Command::SelectBaud,
            Command::Session,
        ] {
            assert_eq!(Command::from_byte(cmd.as_byte()).unwrap(), cmd);
        }
        assert!(matches!(
            Direction::from_byte(0x00),
            Err(ProtocolError::UnknownDirection(0x00))
        ));
        assert!(matches!(
            Command::from_byte(0xC0),
            Err(ProtocolError::UnknownCommand(0xC0))
        ));
    }

    #[test]
    fn test_f32_at() {
        let frame = Frame::response(195, {
            let mut p = Vec::new();
            p.extend_from_slice(&1.5f32.to_le_bytes());
            p.extend_from_slice(&2.5f32.to_le_bytes());
            p
        });
        assert_eq!(frame.f32_at(0), Some(1.5));
        assert_eq!(frame.f32_at(4), Some(2.5));
        assert_eq!(frame.f32_at(5), None);
    }
}
