//! I2C relay payload
//!
//! The board performs a bus transaction on the controller's behalf and
//! echoes the packet back with the request flag cleared.
//!
//! ```text
//! write: [r=0 | addr:7] [req | err | 0:6]          [command...]
//! read:  [r=1 | addr:7] [req | err | 0 | len:5]    [command...] [data... (responses only)]
//! ```

use crate::error::{ParseError, ProtocolError};

const READ_FLAG: u8 = 0x80;
const ADDRESS_MASK: u8 = 0x7F;
const REQUEST_FLAG: u8 = 0x80;
const ERROR_FLAG: u8 = 0x40;
const READ_LENGTH_MASK: u8 = 0x1F;

/// Addressed chip transaction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct I2cPacket {
    /// 7-bit chip address
    pub address: u8,
    /// Whether data is read back from the chip
    pub read: bool,
    /// Set on requests, cleared on responses
    pub request: bool,
    /// Set by the board when the bus transaction failed
    pub error: bool,
    /// Number of bytes to read (reads only)
    pub read_len: u8,
    /// Bytes written to the chip before any read
    pub command: Vec<u8>,
    /// Bytes read back (read responses only)
    pub data: Vec<u8>,
}

impl I2cPacket {
    /// Build a write request
    pub fn write(address: u8, command: Vec<u8>) -> Self {
        Self {
            address,
            read: false,
            request: true,
            command,
            ..Self::default()
        }
    }

    /// Build a read request; `command` is written first (e.g. a register pointer)
    pub fn read(address: u8, command: Vec<u8>, read_len: u8) -> Self {
        Self {
            address,
            read: true,
            request: true,
            read_len,
            command,
            ..Self::default()
        }
    }

    /// Turn a request into the response the board would send
    pub fn into_response(mut self, data: Vec<u8>, error: bool) -> Self {
        self.request = false;
        self.error = error;
        if self.read {
            self.data = data;
        }
        self
    }

    /// Size this packet occupies once assembled
    pub fn size(&self) -> usize {
        let data_len = if self.read && !self.request {
            self.data.len()
        } else {
            0
        };
        2 + self.command.len() + data_len
    }

    /// Assemble the payload bytes
    pub fn assemble(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.address > ADDRESS_MASK {
            return Err(ProtocolError::FieldOutOfRange(format!(
                "chip address 0x{:02X}",
                self.address
            )));
        }
        if self.read_len > READ_LENGTH_MASK {
            return Err(ProtocolError::FieldOutOfRange(format!(
                "read length {}",
                self.read_len
            )));
        }

        let mut out = Vec::with_capacity(self.size());
        out.push(if self.read { READ_FLAG } else { 0 } | self.address);

        let mut flags = 0u8;
        if self.request {
            flags |= REQUEST_FLAG;
        }
        if self.error {
            flags |= ERROR_FLAG;
        }

        if self.read {
            out.push(flags | self.read_len);
            out.extend_from_slice(&self.command);
            if !self.request {
                if self.data.len() != self.read_len as usize {
                    return Err(ProtocolError::FieldOutOfRange(format!(
                        "response carries {} bytes, read length is {}",
                        self.data.len(),
                        self.read_len
                    )));
                }
                out.extend_from_slice(&self.data);
            }
        } else {
            out.push(flags);
            out.extend_from_slice(&self.command);
        }

        Ok(out)
    }

    /// Parse a payload
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < 2 {
            return Err(ParseError::Incomplete {
                needed: 2 - buf.len(),
            });
        }

        let read = buf[0] & READ_FLAG != 0;
        let address = buf[0] & ADDRESS_MASK;
        let request = buf[1] & REQUEST_FLAG != 0;
        let error = buf[1] & ERROR_FLAG != 0;
        let body = &buf[2..];

        if !read {
            return Ok(Self {
                address,
                read,
                request,
                error,
                read_len: 0,
                command: body.to_vec(),
                data: Vec::new(),
            });
        }

        let read_len = buf[1] & READ_LENGTH_MASK;
        let data_len = if request { 0 } else { read_len as usize };
        if data_len > body.len() {
            return Err(ParseError::InvalidPayload(format!(
                "read response announces {} bytes but carries {}",
                read_len,
                body.len()
            )));
        }

        let (command, data) = body.split_at(body.len() - data_len);
        Ok(Self {
            address,
            read,
            request,
            error,
            read_len,
            command: command.to_vec(),
            data: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_request_layout() {
        let packet = I2cPacket::write(0x20, vec![0xAA, 0x55]);
        assert_eq!(packet.assemble().unwrap(), vec![0x20, 0x80, 0xAA, 0x55]);
    }

    #[test]
    fn test_read_request_layout() {
        let packet = I2cPacket::read(0x21, vec![], 2);
        assert_eq!(packet.assemble().unwrap(), vec![0xA1, 0x82]);
    }

    #[test]
    fn test_read_response_splits_command_and_data() {
        let response = I2cPacket::read(0x48, vec![0x8C], 1).into_response(vec![0x7F], false);
        let bytes = response.assemble().unwrap();
        assert_eq!(bytes, vec![0xC8, 0x01, 0x8C, 0x7F]);

        let parsed = I2cPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.command, vec![0x8C]);
        assert_eq!(parsed.data, vec![0x7F]);
        assert!(!parsed.request);
    }

    #[test]
    fn test_short_read_response_rejected() {
        // Announces 4 data bytes, carries 1
        assert!(matches!(
            I2cPacket::parse(&[0xA0, 0x04, 0x00]),
            Err(ParseError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_error_flag_parsed() {
        let parsed = I2cPacket::parse(&[0x20, 0x40]).unwrap();
        assert!(parsed.error);
        assert!(!parsed.request);
        assert!(parsed.command.is_empty());
    }

    #[test]
    fn test_address_out_of_range() {
        assert!(I2cPacket::write(0x80, vec![]).assemble().is_err());
    }
}
