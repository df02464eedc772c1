//! Onboard I2C bus transport
//!
//! [`BusSession`] owns one scheduler whose worker holds the bus handle.
//! Chip drivers and the port-expander multiplexer run their transactions
//! through [`BusContext`], which applies the retry budget: a write is tried
//! up to three times, a read up to twice, and a short transfer counts as a
//! failed attempt.

use std::io;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::device::{Device, DeviceId};
use crate::drivers::{DcMotorDriver, FaderPoll};
use crate::error::{ConfigError, TransactionError, TransportError};
use crate::events::DeviceListener;
use crate::expander::{self, ExpanderArena, ExpanderHost};
use crate::scheduler::{Pollable, PollToken, Scheduler, SchedulerHandle, WorkerContext};

/// Extra write attempts after the first
pub const WRITE_RETRIES: usize = 2;
/// Extra read attempts after the first
pub const READ_RETRIES: usize = 1;

/// Raw bus access
///
/// Implementations return the number of bytes transferred; the caller
/// decides whether a short transfer is acceptable.
pub trait Bus: Send {
    /// Select the chip subsequent transfers talk to
    fn set_target(&mut self, address: u8) -> io::Result<()>;

    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// `/dev/i2c-N` character device
#[cfg(target_os = "linux")]
pub struct LinuxI2cBus {
    file: std::fs::File,
}

#[cfg(target_os = "linux")]
impl LinuxI2cBus {
    /// `I2C_SLAVE` from linux/i2c-dev.h
    const I2C_SLAVE: libc::c_ulong = 0x0703;

    /// Open bus `bus_id`, or `path` when given
    pub fn open(bus_id: u32, path: Option<&str>) -> Result<Self, TransportError> {
        let path = path
            .map(str::to_string)
            .unwrap_or_else(|| format!("/dev/i2c-{}", bus_id));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| TransportError::Connect {
                target: path.clone(),
                source,
            })?;
        info!(target: "pihw::bus", "opened {}", path);
        Ok(Self { file })
    }
}

#[cfg(target_os = "linux")]
impl Bus for LinuxI2cBus {
    fn set_target(&mut self, address: u8) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        // SAFETY: the descriptor is owned by `self.file` and stays open for the
        // call; I2C_SLAVE takes the address by value.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                Self::I2C_SLAVE,
                libc::c_ulong::from(address),
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.file, data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.file, buf)
    }
}

/// Worker-side state of a bus transport
pub struct BusContext {
    bus: Box<dyn Bus>,
    expanders: ExpanderArena,
}

impl BusContext {
    pub fn new(bus: Box<dyn Bus>) -> Self {
        Self {
            bus,
            expanders: ExpanderArena::new(),
        }
    }

    fn select(&mut self, address: u8) -> Result<(), TransactionError> {
        self.bus
            .set_target(address)
            .map_err(|source| TransactionError::Address { address, source })
    }

    /// Write `data` to the chip at `address`
    pub fn write_to(&mut self, address: u8, data: &[u8]) -> Result<(), TransactionError> {
        self.select(address)?;

        let attempts = 1 + WRITE_RETRIES;
        for attempt in 1..=attempts {
            match self.bus.write(data) {
                Ok(n) if n == data.len() => return Ok(()),
                Ok(n) => debug!(
                    target: "pihw::bus",
                    "0x{:02X}: short write {}/{} (attempt {})",
                    address, n, data.len(), attempt
                ),
                Err(e) => debug!(
                    target: "pihw::bus",
                    "0x{:02X}: write error {} (attempt {})",
                    address, e, attempt
                ),
            }
        }
        Err(TransactionError::Write { address, attempts })
    }

    /// Fill `buf` from the chip at `address`
    pub fn read_from(&mut self, address: u8, buf: &mut [u8]) -> Result<(), TransactionError> {
        self.select(address)?;

        let attempts = 1 + READ_RETRIES;
        for attempt in 1..=attempts {
            match self.bus.read(buf) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => debug!(
                    target: "pihw::bus",
                    "0x{:02X}: short read {}/{} (attempt {})",
                    address, n, buf.len(), attempt
                ),
                Err(e) => debug!(
                    target: "pihw::bus",
                    "0x{:02X}: read error {} (attempt {})",
                    address, e, attempt
                ),
            }
        }
        Err(TransactionError::Read { address, attempts })
    }
}

impl WorkerContext for BusContext {}

impl ExpanderHost for BusContext {
    fn expanders(&mut self) -> &mut ExpanderArena {
        &mut self.expanders
    }

    fn write_register(&mut self, address: u8, mask: u16) {
        let result = self.write_to(address, &mask.to_le_bytes());
        if let Err(e) = &result {
            warn!(target: "pihw::expander", "{}", e);
        }
        if let Some(chip) = self.expanders.get(address) {
            chip.output_outcome(result.is_ok());
        }
    }

    fn read_register(&mut self, address: u8) {
        let mut buf = [0u8; 2];
        let result = self.read_from(address, &mut buf);
        let Some(chip) = self.expanders.get(address) else {
            return;
        };
        match result {
            Ok(()) => chip.apply_read(u16::from_le_bytes(buf)),
            Err(e) => {
                warn!(target: "pihw::expander", "{}", e);
                chip.input_failed();
            }
        }
    }
}

/// A running bus transport
pub struct BusSession {
    scheduler: Scheduler<BusContext>,
}

impl BusSession {
    /// Start the worker for `bus`
    pub fn start(name: &str, bus: Box<dyn Bus>) -> Result<Self, TransportError> {
        let scheduler = Scheduler::spawn(name, BusContext::new(bus))?;
        Ok(Self { scheduler })
    }

    /// Open the Linux bus device and start the worker
    #[cfg(target_os = "linux")]
    pub fn open(name: &str, bus_id: u32, path: Option<&str>) -> Result<Self, TransportError> {
        let bus = LinuxI2cBus::open(bus_id, path)?;
        Self::start(name, Box::new(bus))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_name: &str, _bus_id: u32, _path: Option<&str>) -> Result<Self, TransportError> {
        Err(TransportError::Unsupported("I2C bus"))
    }

    pub fn handle(&self) -> SchedulerHandle<BusContext> {
        self.scheduler.handle()
    }

    pub fn register_poll(
        &self,
        pollable: Arc<dyn Pollable<BusContext>>,
        frequency_hz: u32,
    ) -> Result<PollToken, ConfigError> {
        self.scheduler.register_poll(pollable, frequency_hz)
    }

    pub fn unregister_poll(&self, token: PollToken) -> bool {
        self.scheduler.unregister_poll(token)
    }

    pub fn enqueue<F>(&self, command: F)
    where
        F: FnOnce(&mut BusContext) + Send + 'static,
    {
        self.scheduler.enqueue(command);
    }

    /// Wait for every command queued so far
    pub fn sync(&self) -> bool {
        self.scheduler.sync()
    }

    pub fn add_expander_input(
        &self,
        address: u8,
        port: u8,
        device: Arc<Device>,
    ) -> Result<(), ConfigError> {
        expander::add_input(&self.handle(), address, port, device)
    }

    pub fn add_expander_output(
        &self,
        address: u8,
        port: u8,
        device: Arc<Device>,
    ) -> Result<(), ConfigError> {
        expander::add_output(&self.handle(), address, port, device)
    }

    pub fn remove_expander_line(&self, address: u8, id: DeviceId) {
        expander::remove_line(&self.handle(), address, id);
    }

    /// Poll an ADS7830 channel into `device`
    pub fn add_fader(
        &self,
        address: u8,
        channel: u8,
        frequency_hz: u32,
        device: Arc<Device>,
    ) -> Result<PollToken, ConfigError> {
        let poll = FaderPoll::new(address, channel, device)?;
        self.scheduler.register_poll(Arc::new(poll), frequency_hz)
    }

    /// Drive a DRV8830 from `device`'s speed value
    pub fn add_dc_motor(&self, address: u8, device: Arc<Device>) -> Result<(), ConfigError> {
        let driver = DcMotorDriver::new(address, self.scheduler.handle(), &device)?;
        device.add_listener(Arc::new(driver) as Arc<dyn DeviceListener>);
        Ok(())
    }

    /// Stop the worker; no bus access happens after this returns
    pub fn stop(&self) {
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted bus: each transfer pops the next result length
    struct Scripted {
        writes: VecDeque<io::Result<usize>>,
        reads: VecDeque<io::Result<usize>>,
        attempts: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    impl Bus for Scripted {
        fn set_target(&mut self, _address: u8) -> io::Result<()> {
            Ok(())
        }

        fn write(&mut self, _data: &[u8]) -> io::Result<usize> {
            self.attempts.lock().push("w");
            self.writes.pop_front().unwrap_or(Ok(0))
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.attempts.lock().push("r");
            buf.fill(0xAB);
            self.reads.pop_front().unwrap_or(Ok(0))
        }
    }

    fn context(
        writes: Vec<io::Result<usize>>,
        reads: Vec<io::Result<usize>>,
    ) -> (BusContext, Arc<parking_lot::Mutex<Vec<&'static str>>>) {
        let attempts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let bus = Scripted {
            writes: writes.into(),
            reads: reads.into(),
            attempts: attempts.clone(),
        };
        (BusContext::new(Box::new(bus)), attempts)
    }

    #[test]
    fn test_write_retried_twice() {
        let (mut ctx, attempts) = context(
            vec![Err(io::Error::other("nak")), Ok(1), Ok(2)],
            vec![],
        );
        assert!(ctx.write_to(0x20, &[1, 2]).is_ok());
        assert_eq!(attempts.lock().len(), 3);
    }

    #[test]
    fn test_write_gives_up_after_budget() {
        let (mut ctx, attempts) = context(vec![Ok(0), Ok(0), Ok(0), Ok(2)], vec![]);
        assert!(matches!(
            ctx.write_to(0x20, &[1, 2]),
            Err(TransactionError::Write { attempts: 3, .. })
        ));
        assert_eq!(attempts.lock().len(), 3);
    }

    #[test]
    fn test_read_retried_once() {
        let (mut ctx, attempts) = context(vec![], vec![Ok(1), Ok(2)]);
        let mut buf = [0u8; 2];
        assert!(ctx.read_from(0x20, &mut buf).is_ok());
        assert_eq!(buf, [0xAB, 0xAB]);

        let (mut ctx, _) = context(vec![], vec![Ok(1), Ok(1), Ok(2)]);
        assert!(ctx.read_from(0x20, &mut buf).is_err());
        assert_eq!(attempts.lock().as_slice(), ["r", "r"]);
    }
}
