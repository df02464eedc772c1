//! Error types for board protocol parsing and encoding

use thiserror::Error;

/// Errors that can occur while parsing protocol data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is incomplete - need more data
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Length field is smaller than the header or larger than the data
    #[error("invalid frame length {length} ({available} bytes available)")]
    InvalidLength { length: usize, available: usize },

    /// Packet type not understood by this implementation
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// Invalid payload structure
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Bytes left over at the end of a datagram
    #[error("truncated frame: {0} trailing bytes")]
    Truncated(usize),
}

/// Higher-level protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Encoded frame does not fit the 5-bit length field
    #[error("frame too long: {0} bytes")]
    FrameTooLong(usize),

    /// Field value outside its bit width
    #[error("field out of range: {0}")]
    FieldOutOfRange(String),
}
