//! pihw Device I/O Core
//!
//! This crate connects logical devices (buttons, faders, outputs, motors)
//! to the hardware that backs them: chips on the onboard I2C bus, an
//! external I/O board reached over a classic radio link, and a low-energy
//! key peripheral.
//!
//! # Architecture
//!
//! Each transport runs exactly one worker thread, owned by a
//! [`Scheduler`]. Other threads never touch hardware; they only enqueue
//! work:
//!
//! - **Polls** run periodically at a registered frequency
//! - **Commands** run once, in FIFO order, ahead of any due poll
//!
//! On top of the scheduler sit the transport sessions:
//!
//! - [`BusSession`]: onboard bus with per-transaction retries
//! - [`BoardSession`]: framed protocol over a [`Link`], with flow control
//!   and reconnection
//! - [`LeSession`]: low-energy key state via reads and notifications
//!
//! Port-expander chips on the bus or behind the board are shared by many
//! logical lines through the [`expander`] multiplexer; [`tlc59116`] LED
//! drivers behind the board share their output registers the same way. Every device
//! carries an [`ErrorLevel`] that moves one step per transaction outcome.
//!
//! # Example
//!
//! ```rust,no_run
//! use pihw_io::{BusSession, Device, DeviceId, DeviceKind};
//!
//! let bus = BusSession::open("i2c", 1, None).unwrap();
//! let button = Device::new(DeviceId(1), "go", DeviceKind::Button);
//! bus.add_expander_input(0x20, 0, button.clone()).unwrap();
//!
//! // later, from any thread
//! println!("{} is {}", button.name(), button.value());
//! bus.stop();
//! ```

pub mod board;
pub mod bus;
pub mod config;
pub mod connection;
pub mod device;
pub mod drivers;
pub mod error;
pub mod error_level;
pub mod events;
pub mod expander;
pub mod le;
pub mod link;
pub mod scheduler;
pub mod tlc59116;

// Re-export scheduler types
pub use scheduler::{Pollable, PollToken, Scheduler, SchedulerHandle, WakeHook, WorkerContext};

// Re-export device types
pub use device::{Device, DeviceId, DeviceKind, ListenerId, Value};
pub use error_level::{ErrorLevel, ErrorTracker};
pub use events::{ConnectionObserver, DeviceEvent, DeviceListener, EventForwarder};
pub use tlc59116::ChannelMode;

// Re-export transports
pub use board::{BoardContext, BoardSession, ResponseHandler, MAX_OUTSTANDING};
pub use bus::{Bus, BusContext, BusSession};
pub use connection::{ConnectionState, SessionOptions, DEFAULT_RECONNECT_DELAY};
pub use le::{AddressType, LeConnectParams, LeContext, LeLink, LeSession, LeWait, SecurityLevel};
pub use link::{Link, Readiness};

#[cfg(target_os = "linux")]
pub use bus::LinuxI2cBus;
#[cfg(target_os = "linux")]
pub use le::AttLink;
#[cfg(target_os = "linux")]
pub use link::{L2capLink, SerialLink};

pub use config::{
    BoardConfig, BusConfig, DeviceConfig, InstallationConfig, LeConfig, LinkKind, TransportKind,
};
pub use error::{ConfigError, TransactionError, TransportError};
