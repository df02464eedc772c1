//! pihw Hardware Simulation Library
//!
//! This crate stands in for the physical hardware so sessions can be
//! exercised without a bus, a board or a radio:
//!
//! - **SimBus**: PCF8575, ADS7830, DRV8830 and TLC59116 chips with
//!   per-chip fault injection, implementing `pihw_io::Bus`
//! - **SimBoard**: the radio board firmware, implementing `pihw_io::Link`
//!   and relaying I2C requests to its own `SimBus`
//! - **SimLe**: the low-energy key peripheral, implementing
//!   `pihw_io::LeLink`
//!
//! # Example
//!
//! ```rust
//! use pihw_io::{BusSession, Device, DeviceId, DeviceKind, Value};
//! use pihw_sim::SimBus;
//!
//! let bus = SimBus::new();
//! bus.add_pcf8575(0x20);
//! bus.press(0x20, 4, true);
//!
//! let session = BusSession::start("i2c", Box::new(bus.clone())).unwrap();
//! let button = Device::new(DeviceId(1), "go", DeviceKind::Button);
//! session.add_expander_input(0x20, 4, button.clone()).unwrap();
//!
//! // The first poll runs right after registration
//! std::thread::sleep(std::time::Duration::from_millis(100));
//! session.stop();
//! assert_eq!(button.value(), Value::Digital(true));
//! ```

pub mod board;
pub mod bus;
pub mod le;

pub use board::SimBoard;
pub use bus::{BusOp, FaultMode, SimBus, SimChip, TLC59116_REGISTERS};
pub use le::SimLe;
