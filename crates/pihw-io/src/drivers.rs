//! Chip drivers on the onboard bus

use std::sync::{Arc, Weak};

use tracing::warn;

use crate::bus::BusContext;
use crate::device::{Device, Value};
use crate::error::ConfigError;
use crate::events::DeviceListener;
use crate::scheduler::{Pollable, SchedulerHandle};

/// ADS7830 channels
pub const FADER_CHANNELS: u8 = 8;

/// Lowest and highest DRV8830 output voltage codes
const VSET_MIN: u8 = 0x06;
const VSET_MAX: u8 = 0x3F;

fn check_address(address: u8, device: &Device) -> Result<(), ConfigError> {
    if address > 0x7F {
        return Err(ConfigError::OutOfRange {
            device: device.name().to_string(),
            field: "chip address",
            value: address.into(),
            max: 0x7F,
        });
    }
    Ok(())
}

/// ADS7830 command byte selecting single-ended `channel`, internal
/// reference on, converter on
pub fn ads7830_command(channel: u8) -> u8 {
    let select = ((channel & 0b110) >> 1) | ((channel & 0b001) << 2);
    select << 4 | 0x80 | 0x08 | 0x04
}

/// Scale an 8-bit conversion to percent
pub fn raw_to_percent(raw: u8) -> u8 {
    (u16::from(raw) * 100 / 255) as u8
}

/// Polls one ADS7830 channel into a fader device
pub struct FaderPoll {
    address: u8,
    channel: u8,
    device: Arc<Device>,
}

impl FaderPoll {
    pub fn new(address: u8, channel: u8, device: Arc<Device>) -> Result<Self, ConfigError> {
        check_address(address, &device)?;
        if channel >= FADER_CHANNELS {
            return Err(ConfigError::OutOfRange {
                device: device.name().to_string(),
                field: "channel",
                value: channel.into(),
                max: u32::from(FADER_CHANNELS - 1),
            });
        }
        Ok(Self {
            address,
            channel,
            device,
        })
    }
}

impl Pollable<BusContext> for FaderPoll {
    fn poll(&self, ctx: &mut BusContext) {
        // An overridden fader would discard the reading anyway
        if self.device.is_overridden() {
            return;
        }

        let mut buf = [0u8; 1];
        let result = ctx
            .write_to(self.address, &[ads7830_command(self.channel)])
            .and_then(|()| ctx.read_from(self.address, &mut buf));

        match result {
            Ok(()) => {
                self.device.handle_error(false, false);
                self.device.set_value(Value::Percent(raw_to_percent(buf[0])));
            }
            Err(e) => {
                warn!(target: "pihw::bus", "{}: {}", self.device.name(), e);
                self.device.handle_error(true, false);
            }
        }
    }
}

/// DRV8830 control register value for a speed in -100..=100
pub fn drv8830_control(speed: i8) -> u8 {
    let magnitude = speed.unsigned_abs().min(100);
    if magnitude == 0 {
        return 0;
    }
    let span = u16::from(VSET_MAX - VSET_MIN);
    let vset = VSET_MIN + ((u16::from(magnitude) - 1) * span / 99) as u8;
    let direction = if speed > 0 { 0b10 } else { 0b01 };
    vset << 2 | direction
}

/// Writes a motor device's speed to its DRV8830
pub struct DcMotorDriver {
    address: u8,
    handle: SchedulerHandle<BusContext>,
    device: Weak<Device>,
}

impl DcMotorDriver {
    pub fn new(
        address: u8,
        handle: SchedulerHandle<BusContext>,
        device: &Arc<Device>,
    ) -> Result<Self, ConfigError> {
        check_address(address, device)?;
        Ok(Self {
            address,
            handle,
            device: Arc::downgrade(device),
        })
    }
}

impl DeviceListener for DcMotorDriver {
    fn on_value_changed(&self, device: &Device) {
        let Value::Speed(speed) = device.value() else {
            return;
        };
        let address = self.address;
        let control = drv8830_control(speed);
        let target = Weak::clone(&self.device);

        self.handle.enqueue(move |ctx: &mut BusContext| {
            let result = ctx.write_to(address, &[0x00, control]);
            let Some(device) = target.upgrade() else {
                return;
            };
            if let Err(e) = &result {
                warn!(target: "pihw::bus", "{}: {}", device.name(), e);
            }
            device.handle_error(result.is_err(), false);
        });
    }
}
