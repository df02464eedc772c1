//! Classic-radio board transport
//!
//! The external I/O board relays I2C transactions and reports GPIO port
//! groups. [`BoardSession`] runs a scheduler whose [`BoardContext`] owns the
//! [`Link`], the frame codec and the table of outstanding requests.
//!
//! # Connection lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^                            |
//!      +------ EOF / link error ----+
//! ```
//!
//! Connecting is retried forever with a fixed delay. A fresh connection
//! drops every outstanding request without invoking its handler, then
//! queues a status refresh for each port group with registered lines, a
//! register write for each port-expander chip and the setup of each LED
//! driver chip.
//!
//! # Flow control
//!
//! At most [`MAX_OUTSTANDING`] unanswered I2C requests may be in flight;
//! sending another first reads (blocking) until the board has caught up.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pihw_protocol::{
    Frame, FrameCodec, GpioStatus, I2cPacket, Outstanding, Packet, SequenceCounter,
};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, ConnectionTracker, SessionOptions};
use crate::device::{Device, DeviceId, Value};
use crate::error::{is_link_loss, ConfigError, TransactionError, TransportError};
use crate::expander::{self, ExpanderArena, ExpanderHost};
use crate::link::{Link, Readiness};
use crate::scheduler::{Pollable, PollToken, Scheduler, SchedulerHandle, WorkerContext};
use crate::tlc59116::{self, ChannelMode, LedDriverBank};

/// Unanswered requests allowed before sends block
pub const MAX_OUTSTANDING: usize = 5;
/// Highest GPIO port group id
pub const MAX_PORT_GROUP: u8 = 0x1F;

const RECV_BUFFER: usize = 256;
const BLOCKING_READ_SLICE: Duration = Duration::from_millis(100);

/// Completion for a relayed I2C request, run on the worker with the response
pub type ResponseHandler = Box<dyn FnOnce(&mut BoardContext, &I2cPacket) + Send>;

/// Check a read response: the board must not flag an error and must return
/// exactly `expected` bytes
pub fn check_read(packet: &I2cPacket, expected: usize) -> Result<&[u8], TransactionError> {
    if packet.error {
        return Err(TransactionError::Remote(packet.address));
    }
    if packet.data.len() != expected {
        return Err(TransactionError::Length {
            address: packet.address,
            expected,
            got: packet.data.len(),
        });
    }
    Ok(&packet.data)
}

struct GpioLine {
    group: u8,
    pin: u8,
    device: Arc<Device>,
}

/// Worker-side state of a board transport
pub struct BoardContext {
    link: Box<dyn Link>,
    codec: FrameCodec,
    sequence: SequenceCounter,
    outstanding: Outstanding<Option<ResponseHandler>>,
    gpio_lines: Vec<GpioLine>,
    expanders: ExpanderArena,
    led_drivers: LedDriverBank,
    connection: ConnectionTracker,
    reconnect_delay: Duration,
    handle: Option<SchedulerHandle<BoardContext>>,
}

impl BoardContext {
    pub fn new(name: &str, link: Box<dyn Link>, options: SessionOptions) -> Self {
        Self {
            link,
            codec: FrameCodec::new(),
            sequence: SequenceCounter::new(),
            outstanding: Outstanding::new(),
            gpio_lines: Vec::new(),
            expanders: ExpanderArena::new(),
            led_drivers: LedDriverBank::new(),
            reconnect_delay: options.reconnect_delay(),
            connection: ConnectionTracker::new(name, options.observer),
            handle: None,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Number of requests awaiting an answer
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, seq: u8) -> bool {
        self.outstanding.contains(seq)
    }

    pub fn led_drivers(&self) -> &LedDriverBank {
        &self.led_drivers
    }

    pub(crate) fn led_drivers_mut(&mut self) -> &mut LedDriverBank {
        &mut self.led_drivers
    }

    fn is_stopping(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.is_stopping())
    }

    fn pause(&self, delay: Duration) -> bool {
        match &self.handle {
            Some(handle) => handle.sleep(delay),
            None => {
                std::thread::sleep(delay);
                true
            }
        }
    }

    /// Connect, retrying with the fixed delay until connected or stopped
    fn connect_loop(&mut self) {
        while !self.connection.is_connected() {
            if self.is_stopping() {
                return;
            }
            if self.connection.set(ConnectionState::Connecting) {
                info!(target: "pihw::board", "{}: connecting to {}", self.connection.transport(), self.link.describe());
            }

            match self.link.connect() {
                Ok(()) => self.on_connected(),
                Err(e) => {
                    debug!(target: "pihw::board", "{}: connect failed: {}", self.connection.transport(), e);
                    self.link.disconnect();
                    if !self.pause(self.reconnect_delay) {
                        return;
                    }
                }
            }
        }
    }

    fn on_connected(&mut self) {
        let dropped = self.outstanding.clear();
        self.codec.clear();
        if dropped > 0 {
            debug!(target: "pihw::board", "{}: dropped {} outstanding requests", self.connection.transport(), dropped);
        }
        self.connection.set(ConnectionState::Connected);
        info!(target: "pihw::board", "{}: connected to {}", self.connection.transport(), self.link.describe());

        let Some(handle) = self.handle.clone() else {
            return;
        };
        let groups: BTreeSet<u8> = self.gpio_lines.iter().map(|l| l.group).collect();
        for group in groups {
            handle.enqueue(move |ctx: &mut BoardContext| ctx.request_status(group));
        }
        for address in self.expanders.addresses() {
            handle.enqueue(move |ctx: &mut BoardContext| {
                if let Some(chip) = ctx.expanders.get(address) {
                    let mask = chip.mask();
                    ctx.write_register(address, mask);
                }
            });
        }
        for address in self.led_drivers.addresses() {
            handle.enqueue(move |ctx: &mut BoardContext| tlc59116::configure(ctx, address));
        }
    }

    fn link_lost(&mut self, reason: &std::io::Error) {
        if !self.connection.is_connected() {
            return;
        }
        warn!(target: "pihw::board", "{}: link lost: {}", self.connection.transport(), reason);
        self.link.disconnect();
        self.codec.clear();
        self.connection.set(ConnectionState::Disconnected);
    }

    /// Read whatever is available and dispatch complete frames
    ///
    /// Returns `false` if nothing was read.
    fn read_once(&mut self) -> bool {
        let mut buf = [0u8; RECV_BUFFER];
        match self.link.recv(&mut buf) {
            Ok(0) => {
                self.link_lost(&std::io::ErrorKind::UnexpectedEof.into());
                true
            }
            Ok(n) => {
                self.codec.push_bytes(&buf[..n]);
                self.dispatch_pending();
                if self.link.is_datagram() {
                    if let Err(e) = self.codec.finish_datagram() {
                        warn!(target: "pihw::board", "{}: {}", self.connection.transport(), e);
                    }
                }
                true
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                        | std::io::ErrorKind::TimedOut
                ) =>
            {
                false
            }
            Err(e) => {
                if !is_link_loss(&e) {
                    debug!(target: "pihw::board", "{}: treating {} as link loss", self.connection.transport(), e);
                }
                self.link_lost(&e);
                true
            }
        }
    }

    /// Block until one read completes, the link drops, or the worker stops
    fn read_blocking(&mut self) -> Result<(), TransportError> {
        loop {
            if !self.connection.is_connected() || self.is_stopping() {
                return Err(TransportError::NotConnected);
            }
            match self.link.wait_readable(Some(BLOCKING_READ_SLICE)) {
                Ok(Readiness::Readable) => {
                    if self.read_once() {
                        return if self.connection.is_connected() {
                            Ok(())
                        } else {
                            Err(TransportError::NotConnected)
                        };
                    }
                }
                Ok(Readiness::Woken) | Ok(Readiness::TimedOut) => {}
                Err(e) => {
                    self.link_lost(&e);
                    return Err(TransportError::LinkLost(e));
                }
            }
        }
    }

    fn dispatch_pending(&mut self) {
        while let Some(result) = self.codec.next_frame() {
            match result {
                Ok(frame) => self.dispatch(frame),
                Err(e) => warn!(target: "pihw::board", "{}: dropping frame: {}", self.connection.transport(), e),
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame.packet {
            Packet::I2c(packet) => {
                if packet.request {
                    debug!(target: "pihw::board", "ignoring I2C request from board");
                    return;
                }
                let Some(ack) = frame.ack else {
                    debug!(target: "pihw::board", "I2C response without ack");
                    return;
                };
                match self.outstanding.resolve(ack) {
                    Some(Some(handler)) => handler(self, &packet),
                    Some(None) => {
                        if packet.error {
                            warn!(target: "pihw::board", "board reported failure for chip 0x{:02X}", packet.address);
                        }
                    }
                    None => debug!(target: "pihw::board", "unmatched ack {}", ack),
                }
            }
            Packet::Gpio(status) => self.apply_status(&status),
            Packet::Other { packet_type, .. } => {
                debug!(target: "pihw::board", "skipping packet type {}", packet_type)
            }
        }
    }

    fn apply_status(&mut self, status: &GpioStatus) {
        if status.error {
            debug!(target: "pihw::board", "group {} reported an error, ignoring", status.port_group);
            return;
        }
        if status.request || status.state.is_none() {
            return;
        }
        for line in self.gpio_lines.iter().filter(|l| l.group == status.port_group) {
            if let Some(on) = status.line(line.pin) {
                line.device.set_value(Value::Digital(on));
                line.device.handle_error(false, false);
            }
        }
    }

    fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        if let Err(e) = self.link.send(&bytes) {
            self.link_lost(&e);
            return Err(TransportError::LinkLost(e));
        }
        Ok(())
    }

    /// Relay an I2C transaction; `handler` runs when the board answers
    ///
    /// Returns the sequence number used. Requests are remembered for flow
    /// control even without a handler.
    pub fn send_i2c(
        &mut self,
        packet: I2cPacket,
        handler: Option<ResponseHandler>,
    ) -> Result<u8, TransportError> {
        if !self.connection.is_connected() {
            return Err(TransportError::NotConnected);
        }
        while self.outstanding.len() > MAX_OUTSTANDING {
            self.read_blocking()?;
        }

        let outstanding = &self.outstanding;
        let seq = self.sequence.next(|s| outstanding.contains(s));
        let frame = Frame::new(seq, None, Packet::I2c(packet));
        // Encode before recording so a bad packet leaves no entry behind
        let bytes = frame.encode()?;

        self.outstanding.insert(seq, handler);
        if let Err(e) = self.link.send(&bytes) {
            self.link_lost(&e);
            return Err(TransportError::LinkLost(e));
        }
        Ok(seq)
    }

    /// Ask the board for a snapshot of `group`
    pub fn request_status(&mut self, group: u8) {
        if !self.connection.is_connected() {
            return;
        }
        let outstanding = &self.outstanding;
        let seq = self.sequence.next(|s| outstanding.contains(s));
        let frame = Frame::new(seq, None, Packet::Gpio(GpioStatus::update_request(group)));
        if let Err(e) = self.send_frame(&frame) {
            debug!(target: "pihw::board", "status request for group {} failed: {}", group, e);
        }
    }

    fn add_gpio_line(&mut self, group: u8, pin: u8, device: Arc<Device>) {
        self.gpio_lines.push(GpioLine { group, pin, device });
        self.request_status(group);
    }

    fn remove_gpio_line(&mut self, id: DeviceId) {
        self.gpio_lines.retain(|l| l.device.id() != id);
    }
}

impl WorkerContext for BoardContext {
    fn start(&mut self, handle: &SchedulerHandle<Self>) {
        handle.set_wake_hook(Some(self.link.wake_hook()));
        self.handle = Some(handle.clone());
    }

    fn service_incoming(&mut self, _handle: &SchedulerHandle<Self>) -> bool {
        if !self.connection.is_connected() {
            self.connect_loop();
            return true;
        }
        match self.link.wait_readable(Some(Duration::ZERO)) {
            Ok(Readiness::Readable) => self.read_once(),
            Ok(_) => false,
            Err(e) => {
                self.link_lost(&e);
                true
            }
        }
    }

    fn idle(&mut self, handle: &SchedulerHandle<Self>, deadline: Option<Instant>) {
        if !self.connection.is_connected() || handle.has_work() {
            return;
        }
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if let Err(e) = self.link.wait_readable(timeout) {
            self.link_lost(&e);
        }
    }

    fn finish(&mut self) {
        self.link.disconnect();
        self.connection.set(ConnectionState::Disconnected);
        if let Some(handle) = &self.handle {
            handle.set_wake_hook(None);
        }
    }
}

impl ExpanderHost for BoardContext {
    fn expanders(&mut self) -> &mut ExpanderArena {
        &mut self.expanders
    }

    fn write_register(&mut self, address: u8, mask: u16) {
        let packet = I2cPacket::write(address, mask.to_le_bytes().to_vec());
        let handler: ResponseHandler = Box::new(move |ctx: &mut BoardContext, response: &I2cPacket| {
            if response.error {
                warn!(target: "pihw::expander", "0x{:02X}: board reported write failure", address);
            }
            if let Some(chip) = ctx.expanders.get(address) {
                chip.output_outcome(!response.error);
            }
        });

        if let Err(e) = self.send_i2c(packet, Some(handler)) {
            debug!(target: "pihw::expander", "0x{:02X}: write not sent: {}", address, e);
            if let Some(chip) = self.expanders.get(address) {
                chip.output_outcome(false);
            }
        }
    }

    fn read_register(&mut self, address: u8) {
        let packet = I2cPacket::read(address, Vec::new(), 2);
        let handler: ResponseHandler = Box::new(move |ctx: &mut BoardContext, response: &I2cPacket| {
            let Some(chip) = ctx.expanders.get(address) else {
                return;
            };
            match check_read(response, 2) {
                Ok(data) => chip.apply_read(u16::from_le_bytes([data[0], data[1]])),
                Err(e @ TransactionError::Length { .. }) => {
                    warn!(target: "pihw::expander", "discarding response: {}", e)
                }
                Err(e) => {
                    warn!(target: "pihw::expander", "{}", e);
                    chip.input_failed();
                }
            }
        });

        if let Err(e) = self.send_i2c(packet, Some(handler)) {
            debug!(target: "pihw::expander", "0x{:02X}: read not sent: {}", address, e);
            if let Some(chip) = self.expanders.get(address) {
                chip.input_failed();
            }
        }
    }
}

/// A running board transport
pub struct BoardSession {
    scheduler: Scheduler<BoardContext>,
    state: Arc<Mutex<ConnectionState>>,
}

impl BoardSession {
    /// Start the worker; it connects in the background
    pub fn start(
        name: &str,
        link: Box<dyn Link>,
        options: SessionOptions,
    ) -> Result<Self, TransportError> {
        let ctx = BoardContext::new(name, link, options);
        let state = ctx.connection.shared();
        let scheduler = Scheduler::spawn(name, ctx)?;
        Ok(Self { scheduler, state })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn handle(&self) -> SchedulerHandle<BoardContext> {
        self.scheduler.handle()
    }

    pub fn register_poll(
        &self,
        pollable: Arc<dyn Pollable<BoardContext>>,
        frequency_hz: u32,
    ) -> Result<PollToken, ConfigError> {
        self.scheduler.register_poll(pollable, frequency_hz)
    }

    pub fn unregister_poll(&self, token: PollToken) -> bool {
        self.scheduler.unregister_poll(token)
    }

    pub fn enqueue<F>(&self, command: F)
    where
        F: FnOnce(&mut BoardContext) + Send + 'static,
    {
        self.scheduler.enqueue(command);
    }

    pub fn sync(&self) -> bool {
        self.scheduler.sync()
    }

    /// Relay an I2C transaction from any thread
    pub fn relay(&self, packet: I2cPacket, handler: Option<ResponseHandler>) {
        self.enqueue(move |ctx| {
            let address = packet.address;
            if let Err(e) = ctx.send_i2c(packet, handler) {
                debug!(target: "pihw::board", "relay to 0x{:02X} not sent: {}", address, e);
            }
        });
    }

    /// Feed pin `pin` of port group `group` into `device`
    pub fn add_gpio_input(&self, group: u8, pin: u8, device: Arc<Device>) -> Result<(), ConfigError> {
        if group > MAX_PORT_GROUP {
            return Err(ConfigError::OutOfRange {
                device: device.name().to_string(),
                field: "port group",
                value: group.into(),
                max: MAX_PORT_GROUP.into(),
            });
        }
        if pin > 7 {
            return Err(ConfigError::OutOfRange {
                device: device.name().to_string(),
                field: "pin",
                value: pin.into(),
                max: 7,
            });
        }
        self.enqueue(move |ctx| ctx.add_gpio_line(group, pin, device));
        Ok(())
    }

    pub fn remove_gpio_input(&self, id: DeviceId) {
        self.enqueue(move |ctx| ctx.remove_gpio_line(id));
    }

    pub fn add_expander_input(&self, address: u8, port: u8, device: Arc<Device>) -> Result<(), ConfigError> {
        expander::add_input(&self.handle(), address, port, device)
    }

    pub fn add_expander_output(&self, address: u8, port: u8, device: Arc<Device>) -> Result<(), ConfigError> {
        expander::add_output(&self.handle(), address, port, device)
    }

    pub fn remove_expander_line(&self, address: u8, id: DeviceId) {
        expander::remove_line(&self.handle(), address, id);
    }

    /// Switch `channel` of the TLC59116 at `address` fully on or off from
    /// `device`'s digital value
    pub fn add_relay(&self, address: u8, channel: u8, device: Arc<Device>) -> Result<(), ConfigError> {
        tlc59116::add_channel(&self.handle(), address, channel, ChannelMode::Relay, device)
    }

    /// Dim `channel` of the TLC59116 at `address` from `device`'s percent value
    pub fn add_led(&self, address: u8, channel: u8, device: Arc<Device>) -> Result<(), ConfigError> {
        tlc59116::add_channel(&self.handle(), address, channel, ChannelMode::Led, device)
    }

    pub fn remove_driver_channel(&self, address: u8, id: DeviceId) {
        tlc59116::remove_channel(&self.handle(), address, id);
    }

    /// Stop the worker and close the link
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;
    use crate::events::ConnectionObserver;
    use std::collections::VecDeque;
    use std::io;

    /// Link fed from a queue of datagrams
    #[derive(Default)]
    struct FakeLink {
        incoming: VecDeque<io::Result<Vec<u8>>>,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        connects: usize,
    }

    impl Link for FakeLink {
        fn connect(&mut self) -> io::Result<()> {
            self.connects += 1;
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn send(&mut self, data: &[u8]) -> io::Result<()> {
            self.sent.lock().push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.incoming.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn wait_readable(&mut self, _timeout: Option<Duration>) -> io::Result<Readiness> {
            Ok(if self.incoming.is_empty() {
                Readiness::TimedOut
            } else {
                Readiness::Readable
            })
        }

        fn wake_hook(&self) -> crate::scheduler::WakeHook {
            Arc::new(|| {})
        }

        fn is_datagram(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    #[derive(Default)]
    struct States(Mutex<Vec<ConnectionState>>);

    impl ConnectionObserver for States {
        fn on_connection_changed(&self, _transport: &str, state: ConnectionState) {
            self.0.lock().push(state);
        }
    }

    fn connected(link: FakeLink) -> (BoardContext, Arc<States>) {
        let states = Arc::new(States::default());
        let options = SessionOptions {
            reconnect_delay: Some(Duration::from_millis(1)),
            observer: Some(states.clone()),
        };
        let mut ctx = BoardContext::new("board", Box::new(link), options);
        ctx.connect_loop();
        (ctx, states)
    }

    fn response(ack: u8, packet: I2cPacket) -> Vec<u8> {
        Frame::new(0, Some(ack), Packet::I2c(packet)).encode().unwrap()
    }

    fn status(group: u8, state: u8) -> Vec<u8> {
        Frame::new(0, None, Packet::Gpio(GpioStatus::report(group, state)))
            .encode()
            .unwrap()
    }

    #[test]
    fn test_response_runs_handler_once() {
        let (mut ctx, _) = connected(FakeLink::default());
        ctx.sequence = SequenceCounter::starting_at(7);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let request = I2cPacket::read(0x48, vec![0x8C], 1);
        let handler: ResponseHandler = Box::new(move |_: &mut BoardContext, p: &I2cPacket| {
            seen.lock().push(p.data.clone())
        });
        let seq = ctx.send_i2c(request.clone(), Some(handler)).unwrap();
        assert_eq!(seq, 7);
        assert!(ctx.is_outstanding(7));

        let answer = response(7, request.into_response(vec![0x42], false));
        ctx.codec.push_bytes(&answer);
        ctx.codec.push_bytes(&answer);
        ctx.dispatch_pending();

        assert_eq!(*calls.lock(), vec![vec![0x42]]);
        assert!(!ctx.is_outstanding(7));
    }

    #[test]
    fn test_status_updates_only_its_group() {
        let (mut ctx, _) = connected(FakeLink::default());
        let a = Device::new(DeviceId(1), "a", DeviceKind::Button);
        let b = Device::new(DeviceId(2), "b", DeviceKind::Button);
        let c = Device::new(DeviceId(3), "c", DeviceKind::Button);
        ctx.add_gpio_line(2, 0, a.clone());
        ctx.add_gpio_line(2, 3, b.clone());
        ctx.add_gpio_line(1, 0, c.clone());

        ctx.codec.push_bytes(&status(2, 0b0000_1001));
        ctx.dispatch_pending();

        assert_eq!(a.value(), Value::Digital(true));
        assert_eq!(b.value(), Value::Digital(true));
        assert_eq!(c.value(), Value::Digital(false));
    }

    #[test]
    fn test_status_with_error_flag_ignored() {
        let (mut ctx, _) = connected(FakeLink::default());
        let a = Device::new(DeviceId(1), "a", DeviceKind::Button);
        ctx.add_gpio_line(4, 0, a.clone());

        let mut flagged = GpioStatus::report(4, 0xFF);
        flagged.error = true;
        ctx.codec
            .push_bytes(&Frame::new(0, None, Packet::Gpio(flagged)).encode().unwrap());
        ctx.dispatch_pending();

        assert_eq!(a.value(), Value::Digital(false));
    }

    #[test]
    fn test_adding_line_requests_status() {
        let link = FakeLink::default();
        let sent = link.sent.clone();
        let (mut ctx, _) = connected(link);
        ctx.add_gpio_line(3, 1, Device::new(DeviceId(1), "a", DeviceKind::Button));

        let frames = sent.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], 0x25);
        assert_eq!(&frames[0][3..], &[0x83, 0xFF]);
    }

    #[test]
    fn test_flow_control_reads_before_sending() {
        let mut link = FakeLink::default();
        link.incoming
            .push_back(Ok(response(0, I2cPacket::write(0x20, vec![]).into_response(vec![], false))));
        let sent = link.sent.clone();
        let (mut ctx, _) = connected(link);

        for _ in 0..=MAX_OUTSTANDING {
            ctx.send_i2c(I2cPacket::write(0x20, vec![1]), None).unwrap();
        }
        assert_eq!(ctx.outstanding(), MAX_OUTSTANDING + 1);

        // Over the ceiling: the queued ack for seq 0 is read first
        ctx.send_i2c(I2cPacket::write(0x20, vec![2]), None).unwrap();
        assert_eq!(ctx.outstanding(), MAX_OUTSTANDING + 1);
        assert!(!ctx.is_outstanding(0));
        assert_eq!(sent.lock().len(), MAX_OUTSTANDING + 2);
    }

    #[test]
    fn test_eof_reconnects_and_drops_handlers() {
        let mut link = FakeLink::default();
        link.incoming.push_back(Ok(Vec::new()));
        let (mut ctx, states) = connected(link);

        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();
        let handler: ResponseHandler =
            Box::new(move |_: &mut BoardContext, _: &I2cPacket| *flag.lock() = true);
        let seq = ctx
            .send_i2c(I2cPacket::read(0x20, vec![], 2), Some(handler))
            .unwrap();

        assert!(ctx.read_once());
        assert_eq!(ctx.connection_state(), ConnectionState::Disconnected);

        ctx.connect_loop();
        assert_eq!(ctx.outstanding(), 0);

        // A late answer for the old request finds nothing
        let late = response(seq, I2cPacket::read(0x20, vec![], 2).into_response(vec![1, 2], false));
        ctx.codec.push_bytes(&late);
        ctx.dispatch_pending();

        assert!(!*fired.lock());
        assert_eq!(
            *states.0.lock(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
    }

    #[test]
    fn test_check_read() {
        let ok = I2cPacket::read(0x20, vec![], 2).into_response(vec![1, 2], false);
        assert_eq!(check_read(&ok, 2).unwrap(), &[1, 2]);
        assert!(matches!(
            check_read(&ok, 1),
            Err(TransactionError::Length { expected: 1, got: 2, .. })
        ));
        let failed = I2cPacket::read(0x20, vec![], 2).into_response(vec![0, 0], true);
        assert!(matches!(check_read(&failed, 2), Err(TransactionError::Remote(0x20))));
    }
}
