//! Physical links to the I/O board
//!
//! A [`Link`] is a byte pipe that can block until it is readable while still
//! being wakeable from other threads. The board session idles in
//! [`Link::wait_readable`] and the scheduler calls the link's wake hook
//! whenever new work arrives, so the worker never sleeps through a command.
//!
//! Implementations:
//!
//! - [`L2capLink`]: Bluetooth L2CAP sequenced-packet socket (Linux). Each
//!   `recv` returns one datagram.
//! - [`SerialLink`]: a tty (e.g. an RFCOMM device) opened with `serialport`.
//!   Bytes arrive as a stream and frames may be split across reads.

use std::io;
use std::time::Duration;

use crate::scheduler::WakeHook;

/// Why [`Link::wait_readable`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data (or end of stream) is waiting
    Readable,
    /// The wake hook fired
    Woken,
    TimedOut,
}

/// Connection to the board
pub trait Link: Send {
    /// Establish the connection
    fn connect(&mut self) -> io::Result<()>;

    /// Tear the connection down; harmless when not connected
    fn disconnect(&mut self);

    /// Send one frame
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receive available bytes; `Ok(0)` is end of stream
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Block until readable, woken, or `timeout` elapses (`None` waits forever)
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<Readiness>;

    /// Hook that interrupts a pending or upcoming `wait_readable`
    fn wake_hook(&self) -> WakeHook;

    /// Whether every `recv` returns exactly one whole datagram
    fn is_datagram(&self) -> bool;

    /// Human-readable peer description for logs
    fn describe(&self) -> String;
}

/// Parse `AA:BB:CC:DD:EE:FF`
pub fn parse_bdaddr(address: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = address.split(':');
    for byte in out.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

#[cfg(target_os = "linux")]
pub use fd::{FdWaker, SerialLink};

#[cfg(target_os = "linux")]
pub use l2cap::L2capLink;

#[cfg(target_os = "linux")]
pub(crate) mod fd {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::sync::Arc;
    use std::time::Duration;

    use tracing::{debug, info};

    use super::{Link, Readiness};
    use crate::scheduler::WakeHook;

    /// Self-pipe used to interrupt `poll(2)`
    #[derive(Debug)]
    pub struct FdWaker {
        read: OwnedFd,
        write: OwnedFd,
    }

    impl FdWaker {
        pub fn new() -> io::Result<Self> {
            let mut fds = [0 as libc::c_int; 2];
            // SAFETY: `fds` has room for the two descriptors pipe2 writes.
            let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: pipe2 succeeded, both descriptors are open and owned by us.
            let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
            Ok(Self { read, write })
        }

        pub fn wake(&self) {
            let byte = 1u8;
            // SAFETY: writes one byte from a valid buffer to our own pipe. A
            // full pipe (EAGAIN) already guarantees a pending wake.
            unsafe {
                libc::write(
                    self.write.as_raw_fd(),
                    &byte as *const u8 as *const libc::c_void,
                    1,
                );
            }
        }

        fn drain(&self) {
            let mut buf = [0u8; 64];
            loop {
                // SAFETY: reads into a valid local buffer from our own
                // non-blocking pipe.
                let n = unsafe {
                    libc::read(
                        self.read.as_raw_fd(),
                        buf.as_mut_ptr() as *mut libc::c_void,
                        buf.len(),
                    )
                };
                if n <= 0 {
                    break;
                }
            }
        }

        /// Wait on `fd` and the wake pipe
        pub fn wait(&self, fd: RawFd, timeout: Option<Duration>) -> io::Result<Readiness> {
            let mut fds = [
                libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.read.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: `fds` is a valid array of two pollfd entries.
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 2, poll_timeout(timeout)) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    return Ok(Readiness::TimedOut);
                }
                return Err(err);
            }

            if fds[1].revents & libc::POLLIN != 0 {
                self.drain();
                return Ok(Readiness::Woken);
            }
            if fds[0].revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                return Ok(Readiness::Readable);
            }
            Ok(Readiness::TimedOut)
        }

        /// Wait with no link attached, only for a wake or timeout
        pub fn wait_alone(&self, timeout: Option<Duration>) -> io::Result<Readiness> {
            self.wait(-1, timeout)
        }
    }

    /// `poll(2)` timeout in whole milliseconds, rounded up so a wait
    /// shorter than a millisecond still sleeps
    pub(crate) fn poll_timeout(timeout: Option<Duration>) -> libc::c_int {
        match timeout {
            Some(t) => t.as_micros().div_ceil(1000).min(i32::MAX as u128) as libc::c_int,
            None => -1,
        }
    }

    pub(crate) fn hook(waker: &Arc<FdWaker>) -> WakeHook {
        let waker = Arc::clone(waker);
        Arc::new(move || waker.wake())
    }

    /// Board reached through a serial tty
    pub struct SerialLink {
        path: String,
        baud_rate: u32,
        port: Option<serialport::TTYPort>,
        waker: Arc<FdWaker>,
    }

    impl SerialLink {
        pub fn new(path: impl Into<String>, baud_rate: u32) -> io::Result<Self> {
            Ok(Self {
                path: path.into(),
                baud_rate,
                port: None,
                waker: Arc::new(FdWaker::new()?),
            })
        }
    }

    impl Link for SerialLink {
        fn connect(&mut self) -> io::Result<()> {
            let port = serialport::new(&self.path, self.baud_rate)
                .timeout(Duration::from_millis(100))
                .open_native()
                .map_err(io::Error::from)?;
            info!(target: "pihw::board", "opened {} at {} baud", self.path, self.baud_rate);
            self.port = Some(port);
            Ok(())
        }

        fn disconnect(&mut self) {
            if self.port.take().is_some() {
                debug!(target: "pihw::board", "closed {}", self.path);
            }
        }

        fn send(&mut self, data: &[u8]) -> io::Result<()> {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            io::Write::write_all(port, data)
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let port = self
                .port
                .as_mut()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
            match io::Read::read(port, buf) {
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(io::ErrorKind::WouldBlock.into()),
                other => other,
            }
        }

        fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<Readiness> {
            match &self.port {
                Some(port) => self.waker.wait(port.as_raw_fd(), timeout),
                None => self.waker.wait_alone(timeout),
            }
        }

        fn wake_hook(&self) -> WakeHook {
            hook(&self.waker)
        }

        fn is_datagram(&self) -> bool {
            false
        }

        fn describe(&self) -> String {
            self.path.clone()
        }
    }
}

#[cfg(target_os = "linux")]
pub(crate) mod l2cap {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::Arc;
    use std::time::Duration;

    use tracing::{debug, info};

    use super::fd::{hook, FdWaker};
    use super::{parse_bdaddr, Link, Readiness};
    use crate::scheduler::WakeHook;

    const AF_BLUETOOTH: libc::c_int = 31;
    const BTPROTO_L2CAP: libc::c_int = 0;
    const SOL_BLUETOOTH: libc::c_int = 274;
    const BT_SECURITY: libc::c_int = 4;

    /// `struct sockaddr_l2` from bluetooth/l2cap.h
    #[repr(C)]
    struct SockaddrL2 {
        l2_family: libc::sa_family_t,
        l2_psm: u16,
        l2_bdaddr: [u8; 6],
        l2_cid: u16,
        l2_bdaddr_type: u8,
    }

    /// `struct bt_security` from bluetooth/bluetooth.h
    #[repr(C)]
    struct BtSecurity {
        level: u8,
        key_size: u8,
    }

    /// Channel an L2CAP socket connects to
    pub(crate) struct Endpoint<'a> {
        pub address: &'a str,
        pub psm: u16,
        pub cid: u16,
        pub bdaddr_type: u8,
        pub security: Option<u8>,
    }

    /// Open and connect a sequenced-packet L2CAP socket
    pub(crate) fn open(endpoint: &Endpoint<'_>) -> io::Result<OwnedFd> {
        let mut bdaddr = parse_bdaddr(endpoint.address).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid address {}", endpoint.address),
            )
        })?;
        // bdaddr_t is little-endian
        bdaddr.reverse();

        // SAFETY: plain socket(2) call; the result is checked below.
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                BTPROTO_L2CAP,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by socket(2) and is owned here.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        if let Some(level) = endpoint.security {
            let security = BtSecurity { level, key_size: 0 };
            // SAFETY: passes a properly sized bt_security to setsockopt on an
            // open socket.
            let rc = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    SOL_BLUETOOTH,
                    BT_SECURITY,
                    &security as *const BtSecurity as *const libc::c_void,
                    std::mem::size_of::<BtSecurity>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let addr = SockaddrL2 {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: endpoint.psm.to_le(),
            l2_bdaddr: bdaddr,
            l2_cid: endpoint.cid.to_le(),
            l2_bdaddr_type: endpoint.bdaddr_type,
        };
        // SAFETY: `addr` is a properly initialised sockaddr_l2 and the
        // length passed matches its size.
        let rc = unsafe {
            libc::connect(
                socket.as_raw_fd(),
                &addr as *const SockaddrL2 as *const libc::sockaddr,
                std::mem::size_of::<SockaddrL2>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket)
    }

    /// Send one whole packet
    pub(crate) fn send(socket: &OwnedFd, data: &[u8]) -> io::Result<()> {
        // SAFETY: sends from a valid slice on an open socket.
        let n = unsafe {
            libc::send(
                socket.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != data.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short send"));
        }
        Ok(())
    }

    /// Receive one packet without blocking
    pub(crate) fn recv(socket: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: receives into a valid mutable slice on an open socket.
        let n = unsafe {
            libc::recv(
                socket.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Board reached over an L2CAP sequenced-packet channel
    pub struct L2capLink {
        address: String,
        psm: u16,
        socket: Option<OwnedFd>,
        waker: Arc<FdWaker>,
    }

    impl L2capLink {
        pub fn new(address: impl Into<String>, psm: u16) -> io::Result<Self> {
            Ok(Self {
                address: address.into(),
                psm,
                socket: None,
                waker: Arc::new(FdWaker::new()?),
            })
        }

        fn socket(&self) -> io::Result<&OwnedFd> {
            self.socket
                .as_ref()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        }
    }

    impl Link for L2capLink {
        fn connect(&mut self) -> io::Result<()> {
            self.disconnect();
            let socket = open(&Endpoint {
                address: &self.address,
                psm: self.psm,
                cid: 0,
                bdaddr_type: 0,
                security: None,
            })?;
            info!(target: "pihw::board", "connected to {} psm 0x{:04X}", self.address, self.psm);
            self.socket = Some(socket);
            Ok(())
        }

        fn disconnect(&mut self) {
            if self.socket.take().is_some() {
                debug!(target: "pihw::board", "closed {}", self.address);
            }
        }

        fn send(&mut self, data: &[u8]) -> io::Result<()> {
            send(self.socket()?, data)
        }

        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            recv(self.socket()?, buf)
        }

        fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<Readiness> {
            match &self.socket {
                Some(socket) => self.waker.wait(socket.as_raw_fd(), timeout),
                None => self.waker.wait_alone(timeout),
            }
        }

        fn wake_hook(&self) -> WakeHook {
            hook(&self.waker)
        }

        fn is_datagram(&self) -> bool {
            true
        }

        fn describe(&self) -> String {
            format!("{} psm 0x{:04X}", self.address, self.psm)
        }
    }
}
