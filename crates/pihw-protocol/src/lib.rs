//! pihw Board Protocol Library
//!
//! This crate provides parsing and encoding for the framed binary protocol
//! spoken between the controller and an external I/O board over a
//! short-range radio link (or a serial cable carrying the same bytes).
//!
//! # Frame Format
//! ```text
//! [type:3 | len:5] [seq] [ack] [payload...]
//! ```
//!
//! - `type`: packet type (1 = I2C relay, 2 = GPIO status)
//! - `len`: total frame length including the three header bytes
//! - `seq`: sequence number assigned by the sender
//! - `ack`: sequence number this frame answers, or `0xFF` for none
//!
//! # Architecture
//!
//! - [`frame`]: the header and typed [`Packet`] payloads
//! - [`i2c`]: addressed chip transactions relayed by the board
//! - [`gpio`]: port-group status snapshots, solicited or unsolicited
//! - [`codec`]: a streaming decoder that splits a byte stream into frames
//! - [`sequence`]: sequence assignment and the outstanding-request table
//!
//! # Example
//!
//! ```rust
//! use pihw_protocol::{Frame, FrameCodec, I2cPacket, Packet};
//!
//! let request = Frame::new(7, None, Packet::I2c(I2cPacket::write(0x20, vec![0xFF, 0x00])));
//! let bytes = request.encode().unwrap();
//!
//! let mut codec = FrameCodec::new();
//! codec.push_bytes(&bytes);
//! let decoded = codec.next_frame().unwrap().unwrap();
//! assert_eq!(decoded, request);
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod gpio;
pub mod i2c;
pub mod sequence;

pub use codec::FrameCodec;
pub use error::{ParseError, ProtocolError};
pub use frame::{Frame, Packet, PacketType, HEADER_LEN, MAX_FRAME_LEN, NO_ACK};
pub use gpio::GpioStatus;
pub use i2c::I2cPacket;
pub use sequence::{Outstanding, SequenceCounter};
