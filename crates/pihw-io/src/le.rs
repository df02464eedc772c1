//! Low-energy radio transport
//!
//! The low-energy variant of the board exposes its key state as a one-byte
//! GATT characteristic. On connect the session reads it once, after which
//! the peripheral pushes every change as a notification (or indication).
//! Only the four keys on port group 2 are wired to it.
//!
//! The session shares the scheduler and reconnect behavior of the classic
//! board: link loss drops back to `Connecting` and retries with a fixed
//! delay until stopped.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, ConnectionTracker, SessionOptions};
use crate::device::{Device, DeviceId, Value};
use crate::error::{is_link_loss, ConfigError, TransportError};
use crate::scheduler::{Scheduler, SchedulerHandle, WakeHook, WorkerContext};

/// Characteristic holding the key state
pub const KEY_STATE_HANDLE: u16 = 0x0025;
/// The only port group the peripheral reports
pub const LE_PORT_GROUP: u8 = 2;
/// Highest pin the peripheral reports
pub const LE_MAX_PIN: u8 = 3;

/// Peer address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

/// Link security requested on connect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Everything needed to reach the peripheral
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeConnectParams {
    pub address: String,
    #[serde(default)]
    pub address_type: AddressType,
    #[serde(default)]
    pub security: SecurityLevel,
}

/// Why [`LeLink::wait_notification`] returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeWait {
    Notification { handle: u16, value: Vec<u8> },
    Woken,
    TimedOut,
}

/// GATT client connection to the peripheral
pub trait LeLink: Send {
    fn connect(&mut self, params: &LeConnectParams) -> io::Result<()>;

    fn disconnect(&mut self);

    /// Read a characteristic value by handle
    fn read_characteristic(&mut self, handle: u16) -> io::Result<Vec<u8>>;

    /// Block until a notification arrives, the wake hook fires, or `timeout`
    /// elapses
    fn wait_notification(&mut self, timeout: Option<Duration>) -> io::Result<LeWait>;

    fn wake_hook(&self) -> WakeHook;

    fn describe(&self) -> String;
}

struct LeLine {
    pin: u8,
    device: Arc<Device>,
}

/// Worker-side state of a low-energy transport
pub struct LeContext {
    link: Box<dyn LeLink>,
    params: LeConnectParams,
    lines: Vec<LeLine>,
    connection: ConnectionTracker,
    reconnect_delay: Duration,
    handle: Option<SchedulerHandle<LeContext>>,
}

impl LeContext {
    pub fn new(
        name: &str,
        link: Box<dyn LeLink>,
        params: LeConnectParams,
        options: SessionOptions,
    ) -> Self {
        Self {
            link,
            params,
            lines: Vec::new(),
            reconnect_delay: options.reconnect_delay(),
            connection: ConnectionTracker::new(name, options.observer),
            handle: None,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn connect_loop(&mut self) {
        while !self.connection.is_connected() {
            if self.handle.as_ref().is_some_and(|h| h.is_stopping()) {
                return;
            }
            if self.connection.set(ConnectionState::Connecting) {
                info!(target: "pihw::le", "{}: connecting to {}", self.connection.transport(), self.link.describe());
            }

            match self.link.connect(&self.params) {
                Ok(()) => {
                    self.connection.set(ConnectionState::Connected);
                    info!(target: "pihw::le", "{}: connected", self.connection.transport());
                    self.refresh();
                }
                Err(e) => {
                    debug!(target: "pihw::le", "{}: connect failed: {}", self.connection.transport(), e);
                    self.link.disconnect();
                    let keep_going = match &self.handle {
                        Some(handle) => handle.sleep(self.reconnect_delay),
                        None => {
                            std::thread::sleep(self.reconnect_delay);
                            true
                        }
                    };
                    if !keep_going {
                        return;
                    }
                }
            }
        }
    }

    fn link_lost(&mut self, reason: &io::Error) {
        if !self.connection.is_connected() {
            return;
        }
        warn!(target: "pihw::le", "{}: link lost: {}", self.connection.transport(), reason);
        self.link.disconnect();
        self.connection.set(ConnectionState::Disconnected);
    }

    /// Read the key-state characteristic and apply it
    fn refresh(&mut self) {
        if !self.connection.is_connected() {
            return;
        }
        match self.link.read_characteristic(KEY_STATE_HANDLE) {
            Ok(value) if value.len() == 1 => self.apply_state(value[0]),
            Ok(value) => {
                warn!(target: "pihw::le", "key state read returned {} bytes", value.len())
            }
            Err(e) if is_link_loss(&e) => self.link_lost(&e),
            Err(e) => warn!(target: "pihw::le", "key state read failed: {}", e),
        }
    }

    fn apply_state(&self, state: u8) {
        debug!(target: "pihw::le", "key state {:08b}", state);
        for line in &self.lines {
            line.device
                .set_value(Value::Digital(state & (1 << line.pin) != 0));
            line.device.handle_error(false, false);
        }
    }

    fn handle_wait(&mut self, result: io::Result<LeWait>) -> bool {
        match result {
            Ok(LeWait::Notification { handle, value }) => {
                match value.first() {
                    Some(state) => self.apply_state(*state),
                    None => debug!(target: "pihw::le", "empty notification on 0x{:04X}", handle),
                }
                true
            }
            Ok(LeWait::Woken) | Ok(LeWait::TimedOut) => false,
            Err(e) => {
                self.link_lost(&e);
                true
            }
        }
    }

    fn add_line(&mut self, pin: u8, device: Arc<Device>) {
        self.lines.push(LeLine { pin, device });
        self.refresh();
    }

    fn remove_line(&mut self, id: DeviceId) {
        self.lines.retain(|line| line.device.id() != id);
    }
}

impl WorkerContext for LeContext {
    fn start(&mut self, handle: &SchedulerHandle<Self>) {
        handle.set_wake_hook(Some(self.link.wake_hook()));
        self.handle = Some(handle.clone());
    }

    fn service_incoming(&mut self, _handle: &SchedulerHandle<Self>) -> bool {
        if !self.connection.is_connected() {
            self.connect_loop();
            return true;
        }
        let result = self.link.wait_notification(Some(Duration::ZERO));
        self.handle_wait(result)
    }

    fn idle(&mut self, handle: &SchedulerHandle<Self>, deadline: Option<Instant>) {
        if !self.connection.is_connected() || handle.has_work() {
            return;
        }
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let result = self.link.wait_notification(timeout);
        self.handle_wait(result);
    }

    fn finish(&mut self) {
        self.link.disconnect();
        self.connection.set(ConnectionState::Disconnected);
        if let Some(handle) = &self.handle {
            handle.set_wake_hook(None);
        }
    }
}

/// A running low-energy transport
pub struct LeSession {
    scheduler: Scheduler<LeContext>,
    state: Arc<Mutex<ConnectionState>>,
}

impl LeSession {
    /// Start the worker; it connects in the background
    pub fn start(
        name: &str,
        link: Box<dyn LeLink>,
        params: LeConnectParams,
        options: SessionOptions,
    ) -> Result<Self, TransportError> {
        let ctx = LeContext::new(name, link, params, options);
        let state = ctx.connection.shared();
        let scheduler = Scheduler::spawn(name, ctx)?;
        Ok(Self { scheduler, state })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn handle(&self) -> SchedulerHandle<LeContext> {
        self.scheduler.handle()
    }

    pub fn sync(&self) -> bool {
        self.scheduler.sync()
    }

    /// Feed key `pin` of port group `group` into `device`
    ///
    /// Only group 2, pins 0 to 3, exist on the peripheral.
    pub fn add_gpio_input(&self, group: u8, pin: u8, device: Arc<Device>) -> Result<(), ConfigError> {
        check_line(group, pin)?;
        self.scheduler.enqueue(move |ctx| ctx.add_line(pin, device));
        Ok(())
    }

    pub fn remove_gpio_input(&self, id: DeviceId) {
        self.scheduler.enqueue(move |ctx| ctx.remove_line(id));
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

/// Reject lines the peripheral cannot report
pub fn check_line(group: u8, pin: u8) -> Result<(), ConfigError> {
    if group != LE_PORT_GROUP || pin > LE_MAX_PIN {
        return Err(ConfigError::UnsupportedLine { group, pin });
    }
    Ok(())
}

#[cfg(target_os = "linux")]
pub use att::AttLink;

#[cfg(target_os = "linux")]
mod att {
    use std::collections::VecDeque;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tracing::{debug, info};

    use super::{AddressType, LeConnectParams, LeLink, LeWait, SecurityLevel};
    use crate::link::fd::{hook, FdWaker};
    use crate::link::l2cap::{self, Endpoint};
    use crate::link::Readiness;
    use crate::scheduler::WakeHook;

    const ATT_CID: u16 = 4;
    const BDADDR_LE_PUBLIC: u8 = 1;
    const BDADDR_LE_RANDOM: u8 = 2;

    const OP_ERROR: u8 = 0x01;
    const OP_READ_REQ: u8 = 0x0A;
    const OP_READ_RSP: u8 = 0x0B;
    const OP_NOTIFY: u8 = 0x1B;
    const OP_INDICATE: u8 = 0x1D;
    const OP_CONFIRM: u8 = 0x1E;

    const READ_TIMEOUT: Duration = Duration::from_secs(5);
    const MTU: usize = 23;

    /// GATT client over the kernel's LE attribute channel
    pub struct AttLink {
        socket: Option<OwnedFd>,
        peer: String,
        pending: VecDeque<(u16, Vec<u8>)>,
        waker: Arc<FdWaker>,
    }

    impl AttLink {
        pub fn new() -> io::Result<Self> {
            Ok(Self {
                socket: None,
                peer: String::new(),
                pending: VecDeque::new(),
                waker: Arc::new(FdWaker::new()?),
            })
        }

        fn socket(&self) -> io::Result<&OwnedFd> {
            self.socket
                .as_ref()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        }

        /// Receive one PDU, queueing notifications; returns other PDUs
        fn receive(&mut self) -> io::Result<Option<Vec<u8>>> {
            let mut buf = [0u8; MTU];
            let n = l2cap::recv(self.socket()?, &mut buf)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let pdu = &buf[..n];
            match pdu[0] {
                OP_NOTIFY | OP_INDICATE if n >= 3 => {
                    let handle = u16::from_le_bytes([pdu[1], pdu[2]]);
                    self.pending.push_back((handle, pdu[3..].to_vec()));
                    if pdu[0] == OP_INDICATE {
                        l2cap::send(self.socket()?, &[OP_CONFIRM])?;
                    }
                    Ok(None)
                }
                _ => Ok(Some(pdu.to_vec())),
            }
        }
    }

    impl LeLink for AttLink {
        fn connect(&mut self, params: &LeConnectParams) -> io::Result<()> {
            self.disconnect();
            let socket = l2cap::open(&Endpoint {
                address: &params.address,
                psm: 0,
                cid: ATT_CID,
                bdaddr_type: match params.address_type {
                    AddressType::Public => BDADDR_LE_PUBLIC,
                    AddressType::Random => BDADDR_LE_RANDOM,
                },
                security: Some(match params.security {
                    SecurityLevel::Low => 1,
                    SecurityLevel::Medium => 2,
                    SecurityLevel::High => 3,
                }),
            })?;
            info!(target: "pihw::le", "attribute channel open to {}", params.address);
            self.peer = params.address.clone();
            self.socket = Some(socket);
            Ok(())
        }

        fn disconnect(&mut self) {
            self.pending.clear();
            if self.socket.take().is_some() {
                debug!(target: "pihw::le", "closed {}", self.peer);
            }
        }

        fn read_characteristic(&mut self, handle: u16) -> io::Result<Vec<u8>> {
            let [lo, hi] = handle.to_le_bytes();
            l2cap::send(self.socket()?, &[OP_READ_REQ, lo, hi])?;

            let deadline = Instant::now() + READ_TIMEOUT;
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                let fd = self.socket()?.as_raw_fd();
                if self.waker.wait(fd, Some(left))? != Readiness::Readable {
                    continue;
                }
                let pdu = match self.receive() {
                    Ok(Some(pdu)) => pdu,
                    Ok(None) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                };
                match pdu[0] {
                    OP_READ_RSP => return Ok(pdu[1..].to_vec()),
                    OP_ERROR if pdu.len() >= 5 && pdu[1] == OP_READ_REQ => {
                        return Err(io::Error::other(format!(
                            "read of 0x{:04X} refused (code 0x{:02X})",
                            handle, pdu[4]
                        )));
                    }
                    op => debug!(target: "pihw::le", "ignoring opcode 0x{:02X}", op),
                }
            }
        }

        fn wait_notification(&mut self, timeout: Option<Duration>) -> io::Result<LeWait> {
            if let Some((handle, value)) = self.pending.pop_front() {
                return Ok(LeWait::Notification { handle, value });
            }
            let fd = self.socket()?.as_raw_fd();
            match self.waker.wait(fd, timeout)? {
                Readiness::Readable => {}
                Readiness::Woken => return Ok(LeWait::Woken),
                Readiness::TimedOut => return Ok(LeWait::TimedOut),
            }
            match self.receive() {
                Ok(Some(pdu)) => {
                    debug!(target: "pihw::le", "ignoring opcode 0x{:02X}", pdu[0]);
                }
                Ok(None) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            Ok(match self.pending.pop_front() {
                Some((handle, value)) => LeWait::Notification { handle, value },
                None => LeWait::TimedOut,
            })
        }

        fn wake_hook(&self) -> WakeHook {
            hook(&self.waker)
        }

        fn describe(&self) -> String {
            if self.peer.is_empty() {
                "attribute channel".to_string()
            } else {
                self.peer.clone()
            }
        }
    }
}
