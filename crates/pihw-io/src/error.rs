//! Error types for transports, chip transactions and configuration

use std::io;

use thiserror::Error;

/// Failures of the physical link (socket, tty, bus device node)
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening or connecting the link failed
    #[error("connect to {target} failed: {source}")]
    Connect {
        /// Address or path that was dialled
        target: String,
        #[source]
        source: io::Error,
    },

    /// The link was lost while in use
    #[error("link lost: {0}")]
    LinkLost(#[source] io::Error),

    /// Operation needs a connected link
    #[error("not connected")]
    NotConnected,

    /// Frame could not be encoded for sending
    #[error("protocol error: {0}")]
    Protocol(#[from] pihw_protocol::ProtocolError),

    /// Transport kind is not available on this platform
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// Other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A chip transaction that failed after its retry budget
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Selecting the chip address failed
    #[error("cannot address chip 0x{address:02X}: {source}")]
    Address {
        address: u8,
        #[source]
        source: io::Error,
    },

    /// Write failed or was short
    #[error("write to chip 0x{address:02X} failed after {attempts} attempts")]
    Write { address: u8, attempts: usize },

    /// Read failed or was short
    #[error("read from chip 0x{address:02X} failed after {attempts} attempts")]
    Read { address: u8, attempts: usize },

    /// The board reported the relayed transaction as failed
    #[error("board reported failure for chip 0x{0:02X}")]
    Remote(u8),

    /// Response did not carry the expected number of bytes
    #[error("chip 0x{address:02X} returned {got} bytes, expected {expected}")]
    Length {
        address: u8,
        expected: usize,
        got: usize,
    },

    /// The link to the board is down
    #[error("transport unavailable: {0}")]
    Transport(#[from] TransportError),
}

/// Invalid installation description
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field lies outside its hardware range
    #[error("{device}: {field} {value} out of range (max {max})")]
    OutOfRange {
        device: String,
        field: &'static str,
        value: u32,
        max: u32,
    },

    /// Two devices share a name
    #[error("duplicate device name: {0}")]
    DuplicateName(String),

    /// A device names a transport that is not configured
    #[error("{device}: unknown transport {transport}")]
    UnknownTransport { device: String, transport: String },

    /// Polling frequency must be positive
    #[error("{0}: polling frequency must be greater than zero")]
    ZeroFrequency(String),

    /// The low-energy peripheral only exposes a fixed set of lines
    #[error("low-energy line group {group} pin {pin} is not available")]
    UnsupportedLine { group: u8, pin: u8 },

    /// Settings file could not be read or parsed
    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// Whether an I/O error means the link is gone and must be re-established
pub fn is_link_loss(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}
