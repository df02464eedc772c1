//! Streaming frame decoder
//!
//! Frames are self-describing through their length field, so the codec only
//! needs to buffer until a whole frame is available. A length smaller than
//! the header cannot be resynchronised from and discards the buffer.

use tracing::warn;

use crate::error::ParseError;
use crate::frame::{declared_length, Frame, HEADER_LEN};

/// Largest amount of undecoded data kept before the buffer is dropped
const MAX_BUFFERED: usize = 1024;

/// Streaming board protocol codec
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    /// Push raw bytes into the codec buffer
    pub fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        if self.buffer.len() > MAX_BUFFERED {
            warn!(
                target: "pihw::protocol",
                "Dropping {} undecoded bytes",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Extract the next frame
    ///
    /// Returns `None` when more data is needed. A malformed frame is consumed
    /// and reported as `Some(Err(_))`; decoding can continue afterwards.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ParseError>> {
        let length = declared_length(&self.buffer)?;

        if length < HEADER_LEN {
            let available = self.buffer.len();
            self.buffer.clear();
            return Some(Err(ParseError::InvalidLength { length, available }));
        }

        if self.buffer.len() < length {
            return None;
        }

        let bytes: Vec<u8> = self.buffer.drain(..length).collect();
        Some(Frame::parse(&bytes))
    }

    /// Decode every complete frame currently buffered
    pub fn drain_frames(&mut self) -> Vec<Result<Frame, ParseError>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Close out a datagram: a packet link never splits frames across
    /// datagrams, so anything left over is an overlong length field
    pub fn finish_datagram(&mut self) -> Result<(), ParseError> {
        let leftover = self.buffer.len();
        self.buffer.clear();
        if leftover == 0 {
            Ok(())
        } else {
            Err(ParseError::Truncated(leftover))
        }
    }

    /// Number of bytes waiting for the rest of their frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the internal buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Packet;
    use crate::gpio::GpioStatus;
    use crate::i2c::I2cPacket;

    fn gpio_report(seq: u8, group: u8, state: u8) -> Vec<u8> {
        Frame::new(seq, None, Packet::Gpio(GpioStatus::report(group, state)))
            .encode()
            .unwrap()
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut data = gpio_report(1, 2, 0x0F);
        data.extend(
            Frame::new(2, Some(5), Packet::I2c(I2cPacket::write(0x20, vec![1, 2])))
                .encode()
                .unwrap(),
        );

        let mut codec = FrameCodec::new();
        codec.push_bytes(&data);
        let frames = codec.drain_frames();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap().seq, 1);
        assert_eq!(frames[1].as_ref().unwrap().ack, Some(5));
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_partial_frame_waits() {
        let data = gpio_report(1, 2, 0x0F);
        let mut codec = FrameCodec::new();

        codec.push_bytes(&data[..3]);
        assert!(codec.next_frame().is_none());
        assert_eq!(codec.pending(), 3);

        codec.push_bytes(&data[3..]);
        assert!(codec.next_frame().unwrap().is_ok());
    }

    #[test]
    fn test_undersized_length_discards_buffer() {
        let mut codec = FrameCodec::new();
        codec.push_bytes(&[0x22, 0x00, 0xFF, 0x01]);

        assert!(matches!(
            codec.next_frame(),
            Some(Err(ParseError::InvalidLength { length: 2, .. }))
        ));
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_overlong_datagram_reported() {
        let mut codec = FrameCodec::new();
        // Length field says 9, datagram holds 5
        codec.push_bytes(&[0x40 | 9, 0x00, 0xFF, 0x02, 0x01]);

        assert!(codec.drain_frames().is_empty());
        assert_eq!(codec.finish_datagram(), Err(ParseError::Truncated(5)));
        assert_eq!(codec.pending(), 0);
    }

    #[test]
    fn test_malformed_payload_does_not_stop_stream() {
        let mut data = vec![0x20 | 4, 0x00, 0xFF, 0x80]; // I2C payload of one byte
        data.extend(gpio_report(3, 1, 0x01));

        let mut codec = FrameCodec::new();
        codec.push_bytes(&data);
        let frames = codec.drain_frames();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1].as_ref().unwrap().seq, 3);
    }
}
