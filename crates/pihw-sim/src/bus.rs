//! Simulated I2C bus
//!
//! Holds a set of chips keyed by address and answers transfers the way the
//! real parts do. Faults are injected per chip and apply to a whole
//! transaction: the decision is made when the target is selected, so the
//! retries of one transaction see the same outcome.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use pihw_io::Bus;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a chip treats the transactions addressed to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    #[default]
    Healthy,
    /// Every transaction fails
    Failing,
    /// Transactions succeed and fail in turn, starting with a success
    Alternating,
    /// The next `n` transactions fail, then the chip recovers
    FailNext(u32),
}

/// Simulated chip models
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimChip {
    /// 16-line port expander
    Pcf8575 {
        /// Last register value written
        register: u16,
        /// Lines pulled low externally (pressed buttons)
        pulled_low: u16,
    },
    /// 8-channel ADC
    Ads7830 { channels: [u8; 8], selected: u8 },
    /// Motor driver
    Drv8830 { control: u8 },
    /// 16-channel LED driver
    Tlc59116 {
        registers: [u8; TLC59116_REGISTERS],
        pointer: u8,
    },
}

/// Registers 0x00 (MODE1) through 0x1D (ALLCALLADR)
pub const TLC59116_REGISTERS: usize = 0x1E;
const TLC59116_PWM0: usize = 0x02;
const TLC59116_LEDOUT0: usize = 0x14;
const TLC59116_OSC_OFF: u8 = 0x10;

/// One recorded transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    Write { address: u8, data: Vec<u8>, ok: bool },
    Read { address: u8, len: usize, ok: bool },
}

struct Slot {
    chip: SimChip,
    fault: FaultMode,
    fail_next_alternate: bool,
}

#[derive(Default)]
struct BusState {
    chips: BTreeMap<u8, Slot>,
    target: Option<u8>,
    failing: bool,
    log: Vec<BusOp>,
}

impl BusState {
    /// Decide the outcome of the transaction that starts now
    fn begin(&mut self, address: u8) {
        self.target = Some(address);
        self.failing = match self.chips.get_mut(&address) {
            None => true,
            Some(slot) => match slot.fault {
                FaultMode::Healthy => false,
                FaultMode::Failing => true,
                FaultMode::Alternating => {
                    let fail = slot.fail_next_alternate;
                    slot.fail_next_alternate = !fail;
                    fail
                }
                FaultMode::FailNext(0) => {
                    slot.fault = FaultMode::Healthy;
                    false
                }
                FaultMode::FailNext(n) => {
                    slot.fault = FaultMode::FailNext(n - 1);
                    true
                }
            },
        };
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let address = self.target.ok_or_else(|| io::Error::other("no target selected"))?;
        let ok = !self.failing;
        self.log.push(BusOp::Write {
            address,
            data: data.to_vec(),
            ok,
        });
        if !ok {
            return Err(io::Error::other(format!("0x{:02X}: no acknowledge", address)));
        }

        let Some(slot) = self.chips.get_mut(&address) else {
            return Err(io::Error::other("no chip"));
        };
        match &mut slot.chip {
            SimChip::Pcf8575 { register, .. } => {
                if data.len() < 2 {
                    return Ok(data.len().min(1));
                }
                *register = u16::from_le_bytes([data[0], data[1]]);
                Ok(2)
            }
            SimChip::Ads7830 { selected, .. } => {
                if let Some(command) = data.first() {
                    let select = (command >> 4) & 0b111;
                    *selected = ((select & 0b011) << 1) | (select >> 2);
                }
                Ok(data.len())
            }
            SimChip::Drv8830 { control } => {
                if let [0x00, value, ..] = data {
                    *control = *value;
                }
                Ok(data.len())
            }
            SimChip::Tlc59116 { registers, pointer } => {
                let Some((&control, values)) = data.split_first() else {
                    return Ok(0);
                };
                let auto_increment = control & 0x80 != 0;
                *pointer = (control & 0x1F) % TLC59116_REGISTERS as u8;
                for value in values {
                    registers[*pointer as usize] = *value;
                    if auto_increment {
                        *pointer = (*pointer + 1) % TLC59116_REGISTERS as u8;
                    }
                }
                Ok(data.len())
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let address = self.target.ok_or_else(|| io::Error::other("no target selected"))?;
        let ok = !self.failing;
        self.log.push(BusOp::Read {
            address,
            len: buf.len(),
            ok,
        });
        if !ok {
            return Err(io::Error::other(format!("0x{:02X}: no acknowledge", address)));
        }

        let Some(slot) = self.chips.get(&address) else {
            return Err(io::Error::other("no chip"));
        };
        let bytes: Vec<u8> = match &slot.chip {
            SimChip::Pcf8575 {
                register,
                pulled_low,
            } => (register & !pulled_low).to_le_bytes().to_vec(),
            SimChip::Ads7830 { channels, selected } => vec![channels[*selected as usize & 7]],
            SimChip::Drv8830 { .. } => vec![0],
            SimChip::Tlc59116 { registers, pointer } => {
                vec![registers[*pointer as usize]; buf.len()]
            }
        };
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }
}

/// Shared handle to a simulated bus; clones see the same chips
#[derive(Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, address: u8, chip: SimChip) {
        self.state.lock().chips.insert(
            address,
            Slot {
                chip,
                fault: FaultMode::Healthy,
                fail_next_alternate: false,
            },
        );
    }

    /// Add a port expander; lines power up high
    pub fn add_pcf8575(&self, address: u8) {
        self.insert(
            address,
            SimChip::Pcf8575 {
                register: 0xFFFF,
                pulled_low: 0,
            },
        );
    }

    pub fn add_ads7830(&self, address: u8) {
        self.insert(
            address,
            SimChip::Ads7830 {
                channels: [0; 8],
                selected: 0,
            },
        );
    }

    pub fn add_drv8830(&self, address: u8) {
        self.insert(address, SimChip::Drv8830 { control: 0 });
    }

    /// Add an LED driver in its power-up state: oscillator off, every
    /// channel off
    pub fn add_tlc59116(&self, address: u8) {
        let mut registers = [0u8; TLC59116_REGISTERS];
        registers[0x00] = 0x11;
        registers[0x12] = 0xFF;
        self.insert(
            address,
            SimChip::Tlc59116 {
                registers,
                pointer: 0,
            },
        );
    }

    pub fn remove_chip(&self, address: u8) {
        self.state.lock().chips.remove(&address);
    }

    /// Press or release a button wired to `port` of an expander
    pub fn press(&self, address: u8, port: u8, pressed: bool) {
        if let Some(Slot {
            chip: SimChip::Pcf8575 { pulled_low, .. },
            ..
        }) = self.state.lock().chips.get_mut(&address)
        {
            if pressed {
                *pulled_low |= 1 << port;
            } else {
                *pulled_low &= !(1 << port);
            }
        }
    }

    /// Set the raw conversion result of an ADC channel
    pub fn set_channel(&self, address: u8, channel: u8, raw: u8) {
        if let Some(Slot {
            chip: SimChip::Ads7830 { channels, .. },
            ..
        }) = self.state.lock().chips.get_mut(&address)
        {
            channels[channel as usize & 7] = raw;
        }
    }

    pub fn set_fault(&self, address: u8, fault: FaultMode) {
        if let Some(slot) = self.state.lock().chips.get_mut(&address) {
            debug!(target: "pihw::bus", "sim 0x{:02X}: fault {:?}", address, fault);
            slot.fault = fault;
            slot.fail_next_alternate = false;
        }
    }

    pub fn chip(&self, address: u8) -> Option<SimChip> {
        self.state.lock().chips.get(&address).map(|s| s.chip.clone())
    }

    /// Last register value written to an expander
    pub fn register(&self, address: u8) -> Option<u16> {
        match self.chip(address)? {
            SimChip::Pcf8575 { register, .. } => Some(register),
            _ => None,
        }
    }

    /// Control register of a motor driver
    pub fn motor_control(&self, address: u8) -> Option<u8> {
        match self.chip(address)? {
            SimChip::Drv8830 { control } => Some(control),
            _ => None,
        }
    }

    /// Registers of an LED driver
    pub fn driver_registers(&self, address: u8) -> Option<[u8; TLC59116_REGISTERS]> {
        match self.chip(address)? {
            SimChip::Tlc59116 { registers, .. } => Some(registers),
            _ => None,
        }
    }

    /// Effective output of an LED driver channel: 0 when off, 0xFF when
    /// fully on, otherwise its PWM duty
    pub fn driver_output(&self, address: u8, channel: u8) -> Option<u8> {
        let registers = self.driver_registers(address)?;
        let channel = channel as usize & 0x0F;
        let bits = registers[TLC59116_LEDOUT0 + channel / 4] >> ((channel % 4) * 2) & 0b11;
        Some(match bits {
            0b00 => 0,
            0b01 => 0xFF,
            // PWM needs the oscillator
            _ if registers[0x00] & TLC59116_OSC_OFF != 0 => 0,
            _ => registers[TLC59116_PWM0 + channel],
        })
    }

    pub fn log(&self) -> Vec<BusOp> {
        self.state.lock().log.clone()
    }

    /// Successful writes to `address`, oldest first
    pub fn writes_to(&self, address: u8) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|op| match op {
                BusOp::Write {
                    address: a,
                    data,
                    ok: true,
                } if *a == address => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Run a whole relayed transaction, as the board firmware does
    ///
    /// Returns the bytes read, or `None` if the chip did not answer.
    pub fn transact(&self, address: u8, command: &[u8], read_len: usize) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        state.begin(address);
        if !command.is_empty() || read_len == 0 {
            state.write(command).ok()?;
        }
        let mut buf = vec![0u8; read_len];
        if read_len > 0 && state.read(&mut buf).ok()? != read_len {
            return None;
        }
        Some(buf)
    }
}

impl Bus for SimBus {
    fn set_target(&mut self, address: u8) -> io::Result<()> {
        self.state.lock().begin(address);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.state.lock().write(data)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.state.lock().read(buf)
    }
}
