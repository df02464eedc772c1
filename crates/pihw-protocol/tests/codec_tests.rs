//! Stream-level tests for the board protocol codec

use pihw_protocol::{Frame, FrameCodec, GpioStatus, I2cPacket, Packet, ParseError};

// ============================================================================
// Stream Reassembly
// ============================================================================

#[test]
fn test_frames_split_across_reads() {
    let frames = vec![
        Frame::new(1, None, Packet::Gpio(GpioStatus::report(2, 0b1010))),
        Frame::new(2, Some(1), Packet::I2c(I2cPacket::write(0x20, vec![0xFE, 0xFF]))),
        Frame::new(3, None, Packet::I2c(I2cPacket::read(0x21, vec![], 2))),
    ];
    let stream: Vec<u8> = frames.iter().flat_map(|f| f.encode().unwrap()).collect();

    let mut codec = FrameCodec::new();
    let mut decoded = Vec::new();
    for chunk in stream.chunks(2) {
        codec.push_bytes(chunk);
        while let Some(result) = codec.next_frame() {
            decoded.push(result.unwrap());
        }
    }

    assert_eq!(decoded, frames);
}

#[test]
fn test_read_response_roundtrip() {
    let response = I2cPacket::read(0x20, vec![], 2).into_response(vec![0x0F, 0xF0], false);
    let frame = Frame::new(5, Some(7), Packet::I2c(response));

    let mut codec = FrameCodec::new();
    codec.push_bytes(&frame.encode().unwrap());
    let decoded = codec.next_frame().unwrap().unwrap();

    match decoded.packet {
        Packet::I2c(p) => {
            assert_eq!(p.data, vec![0x0F, 0xF0]);
            assert!(!p.request);
        }
        other => panic!("unexpected packet {:?}", other),
    }
    assert_eq!(decoded.ack, Some(7));
}

#[test]
fn test_datagram_with_trailing_garbage() {
    let mut datagram = Frame::new(1, None, Packet::Gpio(GpioStatus::report(1, 0)))
        .encode()
        .unwrap();
    datagram.extend_from_slice(&[0x48, 0x00]);

    let mut codec = FrameCodec::new();
    codec.push_bytes(&datagram);
    let frames = codec.drain_frames();

    assert_eq!(frames.len(), 1);
    assert_eq!(codec.finish_datagram(), Err(ParseError::Truncated(2)));
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn i2c_packet() -> impl Strategy<Value = I2cPacket> {
        prop_oneof![
            (0u8..0x80, prop::collection::vec(any::<u8>(), 0..20))
                .prop_map(|(addr, cmd)| I2cPacket::write(addr, cmd)),
            (0u8..0x80, prop::collection::vec(any::<u8>(), 0..4), 0u8..8)
                .prop_map(|(addr, cmd, len)| I2cPacket::read(addr, cmd, len)),
            (0u8..0x80, prop::collection::vec(any::<u8>(), 0..8), any::<bool>()).prop_map(
                |(addr, data, error)| {
                    let len = data.len() as u8;
                    I2cPacket::read(addr, vec![], len).into_response(data, error)
                }
            ),
        ]
    }

    fn packet() -> impl Strategy<Value = Packet> {
        prop_oneof![
            i2c_packet().prop_map(Packet::I2c),
            (0u8..32, any::<u8>()).prop_map(|(g, s)| Packet::Gpio(GpioStatus::report(g, s))),
            (0u8..32).prop_map(|g| Packet::Gpio(GpioStatus::update_request(g))),
        ]
    }

    fn ack() -> impl Strategy<Value = Option<u8>> {
        prop_oneof![Just(None), (0u8..0xFF).prop_map(Some)]
    }

    proptest! {
        #[test]
        fn encoded_frames_decode_unchanged(
            seq in any::<u8>(),
            ack in ack(),
            packet in packet()
        ) {
            let frame = Frame::new(seq, ack, packet);
            let bytes = frame.encode().unwrap();
            prop_assert_eq!((bytes[0] & 0x1F) as usize, bytes.len());

            let mut codec = FrameCodec::new();
            codec.push_bytes(&bytes);
            prop_assert_eq!(codec.next_frame().unwrap().unwrap(), frame);
            prop_assert_eq!(codec.pending(), 0);
        }

        #[test]
        fn arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..128)) {
            let mut codec = FrameCodec::new();
            codec.push_bytes(&data);
            let _ = codec.drain_frames();
            let _ = codec.finish_datagram();
            prop_assert_eq!(codec.pending(), 0);
        }
    }
}
