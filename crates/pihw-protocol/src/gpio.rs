//! GPIO status payload
//!
//! ```text
//! [req | err | 0 | group:5] [state]
//! ```
//!
//! The board sends status frames unsolicited whenever a line in a port group
//! changes, and in answer to an update request. `state` holds one bit per
//! line of the group.
//!
//! The board firmware expects update requests under the I2C packet type
//! (header byte `0x25`). Their payload `[0x80 | group, 0xFF]` carries the
//! error flag, which no genuine I2C request does, so the two stay apart.

use crate::error::{ParseError, ProtocolError};

const REQUEST_FLAG: u8 = 0x80;
const ERROR_FLAG: u8 = 0x40;
const GROUP_MASK: u8 = 0x1F;

/// Port-group status request or report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpioStatus {
    /// Set when the controller asks for a snapshot
    pub request: bool,
    /// Set by the board when it could not sample the group
    pub error: bool,
    /// Port group identifier (0-31)
    pub port_group: u8,
    /// One bit per line; absent on bare requests
    pub state: Option<u8>,
}

impl GpioStatus {
    /// Request a fresh snapshot of `port_group`
    ///
    /// The board firmware expects the state byte to be present and all ones.
    pub fn update_request(port_group: u8) -> Self {
        Self {
            request: true,
            error: false,
            port_group,
            state: Some(0xFF),
        }
    }

    /// Whether this is exactly what [`GpioStatus::update_request`] builds
    pub fn is_update_request(&self) -> bool {
        self.request && !self.error && self.port_group <= GROUP_MASK && self.state == Some(0xFF)
    }

    /// Recognize an update request carried under the I2C packet type
    pub fn parse_update_request(buf: &[u8]) -> Option<Self> {
        match buf {
            [flags, 0xFF] if flags & !GROUP_MASK == REQUEST_FLAG => {
                Some(Self::update_request(flags & GROUP_MASK))
            }
            _ => None,
        }
    }

    /// A status report as sent by the board
    pub fn report(port_group: u8, state: u8) -> Self {
        Self {
            request: false,
            error: false,
            port_group,
            state: Some(state),
        }
    }

    /// Whether `pin` is set in the snapshot
    pub fn line(&self, pin: u8) -> Option<bool> {
        self.state.map(|s| pin < 8 && s & (1 << pin) != 0)
    }

    /// Assemble the payload bytes
    pub fn assemble(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.port_group > GROUP_MASK {
            return Err(ProtocolError::FieldOutOfRange(format!(
                "port group {}",
                self.port_group
            )));
        }

        let mut flags = self.port_group;
        if self.request {
            flags |= REQUEST_FLAG;
        }
        if self.error {
            flags |= ERROR_FLAG;
        }

        let mut out = vec![flags];
        if let Some(state) = self.state {
            out.push(state);
        }
        Ok(out)
    }

    /// Parse a payload of one or two bytes
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        match buf {
            [flags] => Ok(Self::from_flags(*flags, None)),
            [flags, state] => Ok(Self::from_flags(*flags, Some(*state))),
            [] => Err(ParseError::Incomplete { needed: 1 }),
            _ => Err(ParseError::InvalidPayload(format!(
                "GPIO status payload of {} bytes",
                buf.len()
            ))),
        }
    }

    fn from_flags(flags: u8, state: Option<u8>) -> Self {
        Self {
            request: flags & REQUEST_FLAG != 0,
            error: flags & ERROR_FLAG != 0,
            port_group: flags & GROUP_MASK,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_parse() {
        let status = GpioStatus::parse(&[0x02, 0b0000_0101]).unwrap();
        assert!(!status.request);
        assert!(!status.error);
        assert_eq!(status.port_group, 2);
        assert_eq!(status.line(0), Some(true));
        assert_eq!(status.line(1), Some(false));
        assert_eq!(status.line(2), Some(true));
    }

    #[test]
    fn test_error_flag() {
        let status = GpioStatus::parse(&[0x43, 0x00]).unwrap();
        assert!(status.error);
        assert_eq!(status.port_group, 3);
    }

    #[test]
    fn test_bare_request_has_no_state() {
        let status = GpioStatus::parse(&[0x85]).unwrap();
        assert!(status.request);
        assert_eq!(status.state, None);
        assert_eq!(status.line(0), None);
    }

    #[test]
    fn test_update_request_recognized() {
        assert_eq!(
            GpioStatus::parse_update_request(&[0x83, 0xFF]),
            Some(GpioStatus::update_request(3))
        );
        assert!(GpioStatus::update_request(3).is_update_request());
        assert!(!GpioStatus::report(3, 0xFF).is_update_request());

        // A real I2C read request never has the error flag set
        assert_eq!(GpioStatus::parse_update_request(&[0x83, 0x82]), None);
        assert_eq!(GpioStatus::parse_update_request(&[0xA3, 0xFF]), None);
        assert_eq!(GpioStatus::parse_update_request(&[0x83, 0xFF, 0x00]), None);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(GpioStatus::parse(&[0x01, 0x02, 0x03]).is_err());
    }
}
