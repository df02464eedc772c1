//! Simulated radio board firmware
//!
//! [`SimBoard`] implements [`Link`] and answers frames the way the board
//! firmware does: I2C relay requests run against the board's own
//! [`SimBus`] and are acknowledged with the request's sequence number,
//! GPIO update requests are answered with the group's current state. Tests
//! keep a clone to drive the board from outside: press lines, hold
//! responses, or cut the link.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pihw_io::{Link, Readiness, WakeHook};
use pihw_protocol::{Frame, GpioStatus, I2cPacket, Packet, SequenceCounter};
use tracing::debug;

use crate::bus::SimBus;

#[derive(Default)]
struct BoardState {
    connected: bool,
    connects: usize,
    refuse_connects: usize,
    eof_pending: bool,
    woken: bool,
    hold_responses: bool,
    outbox: VecDeque<Vec<u8>>,
    held: VecDeque<Vec<u8>>,
    groups: [u8; 32],
    received: Vec<Frame>,
    sequence: SequenceCounter,
}

struct Shared {
    state: Mutex<BoardState>,
    readable: Condvar,
}

/// Simulated I/O board; clones share the same firmware state
#[derive(Clone)]
pub struct SimBoard {
    shared: Arc<Shared>,
    bus: SimBus,
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBoard {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BoardState::default()),
                readable: Condvar::new(),
            }),
            bus: SimBus::new(),
        }
    }

    /// Chips wired to the board's own bus
    pub fn bus(&self) -> &SimBus {
        &self.bus
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    pub fn connects(&self) -> usize {
        self.shared.state.lock().connects
    }

    /// Fail the next `n` connection attempts
    pub fn refuse_connects(&self, n: usize) {
        self.shared.state.lock().refuse_connects = n;
    }

    /// Set the level of a GPIO line; connected hosts get an unsolicited report
    pub fn set_line(&self, group: u8, pin: u8, high: bool) {
        let mut state = self.shared.state.lock();
        let slot = &mut state.groups[group as usize & 0x1F];
        if high {
            *slot |= 1 << pin;
        } else {
            *slot &= !(1 << pin);
        }
        let report = GpioStatus::report(group, *slot);
        if state.connected {
            Self::push(&mut state, None, Packet::Gpio(report), false);
            self.shared.readable.notify_all();
        }
    }

    /// Send a raw GPIO status frame, e.g. one with the error flag set
    pub fn push_status(&self, status: GpioStatus) {
        let mut state = self.shared.state.lock();
        if state.connected {
            Self::push(&mut state, None, Packet::Gpio(status), false);
            self.shared.readable.notify_all();
        }
    }

    /// Queue responses instead of sending them
    pub fn hold_responses(&self, hold: bool) {
        self.shared.state.lock().hold_responses = hold;
    }

    /// Send every held response
    pub fn release_held(&self) {
        let mut state = self.shared.state.lock();
        let held: Vec<Vec<u8>> = state.held.drain(..).collect();
        state.outbox.extend(held);
        self.shared.readable.notify_all();
    }

    pub fn held(&self) -> usize {
        self.shared.state.lock().held.len()
    }

    /// Make the host's next read see end of stream
    pub fn inject_eof(&self) {
        self.shared.state.lock().eof_pending = true;
        self.shared.readable.notify_all();
    }

    /// Every frame the host sent, oldest first
    pub fn received(&self) -> Vec<Frame> {
        self.shared.state.lock().received.clone()
    }

    /// I2C relay requests received so far
    pub fn i2c_requests(&self) -> Vec<I2cPacket> {
        self.received()
            .into_iter()
            .filter_map(|f| match f.packet {
                Packet::I2c(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn clear_received(&self) {
        self.shared.state.lock().received.clear();
    }

    fn push(state: &mut BoardState, ack: Option<u8>, packet: Packet, response: bool) {
        let seq = state.sequence.next(|_| false);
        match Frame::new(seq, ack, packet).encode() {
            Ok(bytes) if response && state.hold_responses => state.held.push_back(bytes),
            Ok(bytes) => state.outbox.push_back(bytes),
            Err(e) => debug!(target: "pihw::board", "sim board cannot encode reply: {}", e),
        }
    }

    fn execute(&self, request: &I2cPacket) -> I2cPacket {
        let read_len = if request.read {
            request.read_len as usize
        } else {
            0
        };
        let outcome = self.bus.transact(request.address, &request.command, read_len);
        let error = outcome.is_none();
        request
            .clone()
            .into_response(outcome.unwrap_or_else(|| vec![0; read_len]), error)
    }
}

impl Link for SimBoard {
    fn connect(&mut self) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        state.connected = true;
        state.connects += 1;
        state.eof_pending = false;
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.shared.state.lock();
        state.connected = false;
        state.outbox.clear();
        state.held.clear();
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let frame = Frame::parse(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut state = self.shared.state.lock();
        if !state.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        state.received.push(frame.clone());

        match &frame.packet {
            Packet::I2c(request) if request.request => {
                // Run the transaction without holding the firmware lock
                drop(state);
                let response = self.execute(request);
                let mut state = self.shared.state.lock();
                if state.connected {
                    Self::push(&mut state, Some(frame.seq), Packet::I2c(response), true);
                }
            }
            Packet::Gpio(status) if status.request => {
                let report = GpioStatus::report(status.port_group, state.groups[status.port_group as usize & 0x1F]);
                Self::push(&mut state, None, Packet::Gpio(report), true);
            }
            other => debug!(target: "pihw::board", "sim board ignores {:?}", other),
        }
        self.shared.readable.notify_all();
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.eof_pending {
            state.eof_pending = false;
            state.connected = false;
            state.outbox.clear();
            state.held.clear();
            return Ok(0);
        }
        if !state.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        match state.outbox.pop_front() {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<Readiness> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if state.eof_pending || !state.outbox.is_empty() {
                return Ok(Readiness::Readable);
            }
            if state.woken {
                state.woken = false;
                return Ok(Readiness::Woken);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .readable
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Ok(Readiness::TimedOut);
                    }
                }
                None => self.shared.readable.wait(&mut state),
            }
        }
    }

    fn wake_hook(&self) -> WakeHook {
        let shared = Arc::clone(&self.shared);
        Arc::new(move || {
            shared.state.lock().woken = true;
            shared.readable.notify_all();
        })
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "simulated board".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pihw_protocol::FrameCodec;

    fn replies(board: &mut SimBoard) -> Vec<Frame> {
        let mut codec = FrameCodec::new();
        let mut buf = [0u8; 64];
        while let Ok(n) = board.recv(&mut buf) {
            codec.push_bytes(&buf[..n]);
        }
        codec.drain_frames().into_iter().filter_map(Result::ok).collect()
    }

    #[test]
    fn test_relay_acks_with_request_seq() {
        let mut board = SimBoard::new();
        board.bus().add_pcf8575(0x20);
        board.connect().unwrap();

        let request = Frame::new(9, None, Packet::I2c(I2cPacket::read(0x20, vec![], 2)));
        board.send(&request.encode().unwrap()).unwrap();

        let frames = replies(&mut board);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ack, Some(9));
        match &frames[0].packet {
            Packet::I2c(p) => {
                assert!(!p.request);
                assert!(!p.error);
                assert_eq!(p.data, vec![0xFF, 0xFF]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_chip_reports_error() {
        let mut board = SimBoard::new();
        board.connect().unwrap();
        let request = Frame::new(1, None, Packet::I2c(I2cPacket::write(0x27, vec![0, 0])));
        board.send(&request.encode().unwrap()).unwrap();

        let frames = replies(&mut board);
        assert!(matches!(&frames[0].packet, Packet::I2c(p) if p.error));
    }

    #[test]
    fn test_status_request_answered() {
        let mut board = SimBoard::new();
        board.connect().unwrap();
        board.set_line(3, 1, true);
        replies(&mut board);

        let request = Frame::new(0, None, Packet::Gpio(GpioStatus::update_request(3)));
        board.send(&request.encode().unwrap()).unwrap();
        let frames = replies(&mut board);
        assert_eq!(
            frames[0].packet,
            Packet::Gpio(GpioStatus::report(3, 0b10))
        );
    }

    #[test]
    fn test_firmware_framed_status_request_answered() {
        let mut board = SimBoard::new();
        board.connect().unwrap();
        board.set_line(5, 0, true);
        replies(&mut board);

        // Update requests arrive under the I2C packet type
        board.send(&[0x25, 0x11, 0xFF, 0x85, 0xFF]).unwrap();
        let frames = replies(&mut board);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet, Packet::Gpio(GpioStatus::report(5, 0b1)));
        assert!(board.i2c_requests().is_empty());
    }

    #[test]
    fn test_eof_then_reconnect() {
        let mut board = SimBoard::new();
        board.connect().unwrap();
        board.inject_eof();
        assert_eq!(
            board.wait_readable(Some(Duration::ZERO)).unwrap(),
            Readiness::Readable
        );
        let mut buf = [0u8; 8];
        assert_eq!(board.recv(&mut buf).unwrap(), 0);
        assert!(!board.is_connected());
        board.connect().unwrap();
        assert_eq!(board.connects(), 2);
    }

    #[test]
    fn test_wake_hook_interrupts_wait() {
        let mut board = SimBoard::new();
        board.connect().unwrap();
        let hook = board.wake_hook();
        hook();
        assert_eq!(board.wait_readable(None).unwrap(), Readiness::Woken);
    }
}
