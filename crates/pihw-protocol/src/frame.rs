//! Frame header and typed packet payloads
//!
//! ```text
//! byte 0: [type:3 | len:5]   len counts the whole frame, header included
//! byte 1: seq
//! byte 2: ack (0xFF = not a response)
//! byte 3..len: payload
//! ```

use crate::error::{ParseError, ProtocolError};
use crate::gpio::GpioStatus;
use crate::i2c::I2cPacket;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 3;
/// Largest frame the 5-bit length field can describe
pub const MAX_FRAME_LEN: usize = 0x1F;
/// Acknowledgment value meaning "this frame answers nothing"
pub const NO_ACK: u8 = 0xFF;

const TYPE_SHIFT: u8 = 5;
const LENGTH_MASK: u8 = 0x1F;

/// Packet type carried in the top three bits of the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PacketType {
    /// Reserved, never sent
    Unused = 0,
    /// Addressed chip transaction relayed by the board
    I2c = 1,
    /// Port-group status snapshot
    Gpio = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unused),
            1 => Ok(Self::I2c),
            2 => Ok(Self::Gpio),
            _ => Err(ParseError::UnknownPacketType(value)),
        }
    }
}

/// Typed frame payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// I2C relay transaction
    I2c(I2cPacket),
    /// GPIO status request or report
    Gpio(GpioStatus),
    /// A type this implementation does not interpret; kept so the stream
    /// can be skipped past it
    Other { packet_type: u8, payload: Vec<u8> },
}

impl Packet {
    /// Numeric packet type for the header
    pub fn type_code(&self) -> u8 {
        match self {
            Packet::I2c(_) => PacketType::I2c as u8,
            // The board firmware takes update requests under the I2C type
            Packet::Gpio(g) if g.is_update_request() => PacketType::I2c as u8,
            Packet::Gpio(_) => PacketType::Gpio as u8,
            Packet::Other { packet_type, .. } => *packet_type,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Packet::I2c(p) => p.assemble(),
            Packet::Gpio(g) => g.assemble(),
            Packet::Other { payload, .. } => Ok(payload.clone()),
        }
    }
}

/// A complete protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number of this frame
    pub seq: u8,
    /// Sequence number this frame responds to
    pub ack: Option<u8>,
    /// Typed payload
    pub packet: Packet,
}

impl Frame {
    /// Create a frame
    pub fn new(seq: u8, ack: Option<u8>, packet: Packet) -> Self {
        Self { seq, ack, packet }
    }

    /// Encode this frame to its wire format
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let type_code = self.packet.type_code();
        if type_code > 0x07 {
            return Err(ProtocolError::FieldOutOfRange(format!(
                "packet type {}",
                type_code
            )));
        }

        let payload = self.packet.payload()?;
        let total = HEADER_LEN + payload.len();
        if total > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLong(total));
        }

        let mut out = Vec::with_capacity(total);
        out.push(type_code << TYPE_SHIFT | total as u8);
        out.push(self.seq);
        out.push(self.ack.unwrap_or(NO_ACK));
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse exactly one frame; `bytes` must hold the whole frame and nothing else
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let length = declared_length(bytes).ok_or(ParseError::Incomplete {
            needed: HEADER_LEN,
        })?;
        if length < HEADER_LEN || length != bytes.len() {
            return Err(ParseError::InvalidLength {
                length,
                available: bytes.len(),
            });
        }

        let type_code = bytes[0] >> TYPE_SHIFT;
        let seq = bytes[1];
        let ack = match bytes[2] {
            NO_ACK => None,
            other => Some(other),
        };
        let payload = &bytes[HEADER_LEN..];

        let packet = match PacketType::try_from(type_code) {
            Ok(PacketType::I2c) => match GpioStatus::parse_update_request(payload) {
                Some(request) => Packet::Gpio(request),
                None => Packet::I2c(I2cPacket::parse(payload)?),
            },
            Ok(PacketType::Gpio) => Packet::Gpio(GpioStatus::parse(payload)?),
            Ok(PacketType::Unused) | Err(_) => Packet::Other {
                packet_type: type_code,
                payload: payload.to_vec(),
            },
        };

        Ok(Self { seq, ack, packet })
    }
}

/// Length announced by the first header byte, if any byte is present
pub fn declared_length(bytes: &[u8]) -> Option<usize> {
    bytes.first().map(|b| (b & LENGTH_MASK) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpio_update_request_layout() {
        let frame = Frame::new(4, None, Packet::Gpio(GpioStatus::update_request(2)));
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, vec![0x25, 4, 0xFF, 0x82, 0xFF]);
        assert_eq!(Frame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_other_gpio_requests_keep_gpio_type() {
        let mut bare = GpioStatus::update_request(2);
        bare.state = None;
        let frame = Frame::new(1, None, Packet::Gpio(bare));
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes, vec![0x40 | 4, 1, 0xFF, 0x82]);
        assert_eq!(Frame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_header_carries_ack() {
        let frame = Frame::new(9, Some(7), Packet::I2c(I2cPacket::write(0x20, vec![0x01])));
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes[0] >> 5, 1);
        assert_eq!((bytes[0] & 0x1F) as usize, bytes.len());
        assert_eq!(bytes[1], 9);
        assert_eq!(bytes[2], 7);
    }

    #[test]
    fn test_frame_too_long_rejected() {
        let packet = I2cPacket::write(0x20, vec![0; 27]);
        let err = Frame::new(0, None, Packet::I2c(packet)).encode().unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLong(32));
    }

    #[test]
    fn test_length_mismatch_is_parse_failure() {
        // Declares 6 bytes but only 5 are present
        let bytes = [0x20 | 6, 0, 0xFF, 0x82, 0x01];
        assert!(matches!(
            Frame::parse(&bytes),
            Err(ParseError::InvalidLength { length: 6, available: 5 })
        ));
    }

    #[test]
    fn test_unknown_type_kept_as_other() {
        let bytes = [0xE0 | 4, 1, 0xFF, 0xAA];
        let frame = Frame::parse(&bytes).unwrap();
        assert_eq!(
            frame.packet,
            Packet::Other {
                packet_type: 7,
                payload: vec![0xAA]
            }
        );
    }
}
