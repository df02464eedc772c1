//! TLC59116 LED driver behind the board
//!
//! One chip drives 16 constant-current channels. A channel is either a
//! relay, switched fully on or off through its `LEDOUT` bits, or an LED
//! whose brightness goes to its `PWM` register. Channels of one chip share
//! the four `LEDOUT` registers, so the chip state lives on the worker in a
//! [`LedDriverBank`] and every register is recomputed from the current
//! device values when written.
//!
//! Writes go through [`BoardContext::send_i2c`]:
//!
//! ```text
//! setup:  [0x80 | MODE1, mode1, mode2]          oscillator on
//!         [0x80 | LEDOUT0, out0, out1, out2, out3]
//! relay:  [LEDOUT0 + ch / 4, out]
//! led:    [PWM0 + ch, duty]
//! ```
//!
//! The setup is repeated for every chip after a reconnect.

use std::collections::BTreeMap;
use std::sync::Arc;

use pihw_protocol::I2cPacket;
use tracing::{debug, warn};

use crate::board::{BoardContext, ResponseHandler};
use crate::device::{Device, DeviceId, ListenerId, Value};
use crate::error::ConfigError;
use crate::events::DeviceListener;
use crate::scheduler::SchedulerHandle;

/// Channels per chip
pub const TLC59116_CHANNELS: u8 = 16;

/// Control-byte flag: auto-increment over all registers
pub const AUTO_INCREMENT: u8 = 0x80;
pub const REG_MODE1: u8 = 0x00;
pub const REG_PWM0: u8 = 0x02;
pub const REG_LEDOUT0: u8 = 0x14;

/// Normal mode: oscillator running, no sub-addresses
const MODE1_NORMAL: u8 = 0x00;
const MODE2_DEFAULT: u8 = 0x00;

const LEDOUT_OFF: u8 = 0b00;
const LEDOUT_ON: u8 = 0b01;
const LEDOUT_PWM: u8 = 0b10;

/// How a channel is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Relay,
    Led,
}

/// PWM duty for a brightness in percent
pub fn pwm_duty(percent: u8) -> u8 {
    (u16::from(percent.min(100)) * 255 / 100) as u8
}

struct Channel {
    channel: u8,
    mode: ChannelMode,
    device: Arc<Device>,
    listener: Option<ListenerId>,
}

impl Channel {
    fn ledout_bits(&self) -> u8 {
        match (self.mode, self.device.value()) {
            (ChannelMode::Led, _) => LEDOUT_PWM,
            (ChannelMode::Relay, Value::Digital(true)) => LEDOUT_ON,
            (ChannelMode::Relay, _) => LEDOUT_OFF,
        }
    }

    fn duty(&self) -> u8 {
        match self.device.value() {
            Value::Percent(p) => pwm_duty(p),
            _ => 0,
        }
    }
}

/// Register state of one chip
pub struct Tlc59116 {
    address: u8,
    channels: Vec<Channel>,
}

impl Tlc59116 {
    fn new(address: u8) -> Self {
        Self {
            address,
            channels: Vec::new(),
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// The four `LEDOUT` registers; unused channels are off
    pub fn ledout(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        for ch in &self.channels {
            let index = (ch.channel / 4) as usize;
            let shift = (ch.channel % 4) * 2;
            out[index] = (out[index] & !(0b11 << shift)) | ch.ledout_bits() << shift;
        }
        out
    }

    /// Writes that bring a freshly powered chip to the current state
    pub fn setup_writes(&self) -> Vec<Vec<u8>> {
        let mut writes = vec![vec![AUTO_INCREMENT | REG_MODE1, MODE1_NORMAL, MODE2_DEFAULT]];
        let mut ledout = vec![AUTO_INCREMENT | REG_LEDOUT0];
        ledout.extend_from_slice(&self.ledout());
        writes.push(ledout);
        for ch in self.channels.iter().filter(|c| c.mode == ChannelMode::Led) {
            writes.push(vec![REG_PWM0 + ch.channel, ch.duty()]);
        }
        writes
    }

    /// Write carrying `channel`'s current value
    pub fn channel_write(&self, channel: u8) -> Option<Vec<u8>> {
        let ch = self.channels.iter().find(|c| c.channel == channel)?;
        Some(match ch.mode {
            ChannelMode::Relay => {
                let index = channel / 4;
                vec![REG_LEDOUT0 + index, self.ledout()[index as usize]]
            }
            ChannelMode::Led => vec![REG_PWM0 + channel, ch.duty()],
        })
    }

    /// Report a write outcome to one channel, or to all of them
    fn outcome(&self, channel: Option<u8>, ok: bool) {
        for ch in &self.channels {
            if channel.is_some_and(|c| c != ch.channel) {
                continue;
            }
            ch.device.handle_error(!ok, false);
        }
    }

    fn remove(&mut self, id: DeviceId) -> bool {
        let before = self.channels.len();
        self.channels.retain(|ch| {
            if ch.device.id() != id {
                return true;
            }
            if let Some(listener) = ch.listener {
                ch.device.remove_listener(listener);
            }
            false
        });
        before != self.channels.len()
    }
}

/// All driver chips behind one board, keyed by address
#[derive(Default)]
pub struct LedDriverBank {
    chips: BTreeMap<u8, Tlc59116>,
}

impl LedDriverBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: u8) -> Option<&Tlc59116> {
        self.chips.get(&address)
    }

    pub fn addresses(&self) -> Vec<u8> {
        self.chips.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }
}

fn send_write(ctx: &mut BoardContext, address: u8, command: Vec<u8>, channel: Option<u8>) {
    let handler: ResponseHandler = Box::new(move |ctx: &mut BoardContext, response: &I2cPacket| {
        if response.error {
            warn!(target: "pihw::board", "0x{:02X}: board reported driver write failure", address);
        }
        if let Some(chip) = ctx.led_drivers().get(address) {
            chip.outcome(channel, !response.error);
        }
    });

    if let Err(e) = ctx.send_i2c(I2cPacket::write(address, command), Some(handler)) {
        debug!(target: "pihw::board", "0x{:02X}: driver write not sent: {}", address, e);
        if let Some(chip) = ctx.led_drivers().get(address) {
            chip.outcome(channel, false);
        }
    }
}

/// Send the full setup of the chip at `address`
pub fn configure(ctx: &mut BoardContext, address: u8) {
    let Some(writes) = ctx.led_drivers().get(address).map(Tlc59116::setup_writes) else {
        return;
    };
    debug!(target: "pihw::board", "0x{:02X}: driver setup", address);
    for command in writes {
        send_write(ctx, address, command, None);
    }
}

fn write_channel(ctx: &mut BoardContext, address: u8, channel: u8) {
    let Some(command) = ctx
        .led_drivers()
        .get(address)
        .and_then(|chip| chip.channel_write(channel))
    else {
        return;
    };
    send_write(ctx, address, command, Some(channel));
}

/// Queues a channel write whenever its device changes value
struct ChannelWatch {
    address: u8,
    channel: u8,
    handle: SchedulerHandle<BoardContext>,
}

impl DeviceListener for ChannelWatch {
    fn on_value_changed(&self, _device: &Device) {
        let (address, channel) = (self.address, self.channel);
        self.handle
            .enqueue(move |ctx: &mut BoardContext| write_channel(ctx, address, channel));
    }
}

fn validate(address: u8, channel: u8, device: &Device) -> Result<(), ConfigError> {
    if address > 0x7F {
        return Err(ConfigError::OutOfRange {
            device: device.name().to_string(),
            field: "chip address",
            value: address.into(),
            max: 0x7F,
        });
    }
    if channel >= TLC59116_CHANNELS {
        return Err(ConfigError::OutOfRange {
            device: device.name().to_string(),
            field: "channel",
            value: channel.into(),
            max: u32::from(TLC59116_CHANNELS - 1),
        });
    }
    Ok(())
}

/// Drive `channel` of the chip at `address` from `device`
///
/// Adding a channel reconfigures the chip so the shared `LEDOUT`
/// registers pick up its mode.
pub fn add_channel(
    handle: &SchedulerHandle<BoardContext>,
    address: u8,
    channel: u8,
    mode: ChannelMode,
    device: Arc<Device>,
) -> Result<(), ConfigError> {
    validate(address, channel, &device)?;

    let worker = handle.clone();
    handle.enqueue(move |ctx: &mut BoardContext| {
        let chip = ctx.led_drivers_mut().chips.entry(address).or_insert_with(|| {
            debug!(target: "pihw::board", "0x{:02X}: driver created", address);
            Tlc59116::new(address)
        });
        if let Some(old) = chip.channels.iter().position(|c| c.channel == channel) {
            warn!(target: "pihw::board", "0x{:02X}: channel {} reassigned to {}", address, channel, device.name());
            let old = chip.channels.remove(old);
            if let Some(listener) = old.listener {
                old.device.remove_listener(listener);
            }
        }
        chip.channels.push(Channel {
            channel,
            mode,
            device: Arc::clone(&device),
            listener: None,
        });
        configure(ctx, address);

        // Registration delivers the current value, which queues one more
        // channel write carrying the same state
        let listener = device.add_listener(Arc::new(ChannelWatch {
            address,
            channel,
            handle: worker,
        }));
        if let Some(ch) = ctx
            .led_drivers_mut()
            .chips
            .get_mut(&address)
            .and_then(|chip| chip.channels.iter_mut().find(|c| c.channel == channel))
        {
            ch.listener = Some(listener);
        }
    });
    Ok(())
}

/// Detach a device from the chip at `address`; the chip is forgotten once
/// no channels remain
pub fn remove_channel(handle: &SchedulerHandle<BoardContext>, address: u8, id: DeviceId) {
    handle.enqueue(move |ctx: &mut BoardContext| {
        let bank = ctx.led_drivers_mut();
        let Some(chip) = bank.chips.get_mut(&address) else {
            return;
        };
        if !chip.remove(id) {
            return;
        }
        if chip.channels.is_empty() {
            bank.chips.remove(&address);
            debug!(target: "pihw::board", "0x{:02X}: driver dropped", address);
        } else {
            // The removed channel's LEDOUT bits fall back to off
            configure(ctx, address);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    fn chip_with(channels: &[(u8, ChannelMode, Value)]) -> Tlc59116 {
        let mut chip = Tlc59116::new(0x60);
        for (i, (channel, mode, value)) in channels.iter().enumerate() {
            let kind = match mode {
                ChannelMode::Relay => DeviceKind::Relay,
                ChannelMode::Led => DeviceKind::Led,
            };
            let device = Device::new(DeviceId(i as u32 + 1), format!("ch{}", channel), kind);
            device.set_value(*value);
            chip.channels.push(Channel {
                channel: *channel,
                mode: *mode,
                device,
                listener: None,
            });
        }
        chip
    }

    #[test]
    fn test_pwm_duty() {
        assert_eq!(pwm_duty(0), 0);
        assert_eq!(pwm_duty(50), 127);
        assert_eq!(pwm_duty(100), 255);
        assert_eq!(pwm_duty(200), 255);
    }

    #[test]
    fn test_ledout_packs_two_bits_per_channel() {
        let chip = chip_with(&[
            (0, ChannelMode::Relay, Value::Digital(true)),
            (1, ChannelMode::Relay, Value::Digital(false)),
            (3, ChannelMode::Led, Value::Percent(0)),
            (13, ChannelMode::Relay, Value::Digital(true)),
        ]);
        assert_eq!(chip.ledout(), [0b10_00_00_01, 0, 0, 0b00_00_01_00]);
    }

    #[test]
    fn test_setup_writes() {
        let chip = chip_with(&[
            (2, ChannelMode::Relay, Value::Digital(true)),
            (5, ChannelMode::Led, Value::Percent(100)),
        ]);
        assert_eq!(
            chip.setup_writes(),
            vec![
                vec![0x80, 0x00, 0x00],
                vec![0x94, 0b01_00_00, 0b10_00, 0, 0],
                vec![0x07, 0xFF],
            ]
        );
    }

    #[test]
    fn test_channel_write() {
        let chip = chip_with(&[
            (6, ChannelMode::Relay, Value::Digital(true)),
            (7, ChannelMode::Relay, Value::Digital(true)),
            (9, ChannelMode::Led, Value::Percent(50)),
        ]);
        // Both relays share LEDOUT1
        assert_eq!(chip.channel_write(6), Some(vec![0x15, 0b01_01_00_00]));
        assert_eq!(chip.channel_write(9), Some(vec![0x0B, 127]));
        assert_eq!(chip.channel_write(10), None);
    }

    #[test]
    fn test_remove_channel_turns_bits_off() {
        let mut chip = chip_with(&[
            (0, ChannelMode::Relay, Value::Digital(true)),
            (1, ChannelMode::Relay, Value::Digital(true)),
        ]);
        assert!(chip.remove(DeviceId(1)));
        assert!(!chip.remove(DeviceId(1)));
        assert_eq!(chip.ledout(), [0b01_00, 0, 0, 0]);
    }
}
