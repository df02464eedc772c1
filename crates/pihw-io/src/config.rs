//! Installation description
//!
//! Transports are named; every device names the transport it hangs off.
//! [`InstallationConfig::validate`] checks hardware ranges and references
//! before anything is started.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::board::MAX_PORT_GROUP;
use crate::drivers::FADER_CHANNELS;
use crate::error::ConfigError;
use crate::expander::EXPANDER_PORTS;
use crate::le::{self, AddressType, LeConnectParams, SecurityLevel};
use crate::tlc59116::TLC59116_CHANNELS;

/// Default L2CAP channel of the board firmware
pub const DEFAULT_PSM: u16 = 0x1001;
/// Default fader polling rate
pub const DEFAULT_POLL_HZ: u32 = 50;

fn default_bus_id() -> u32 {
    1
}

fn default_psm() -> u16 {
    DEFAULT_PSM
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_poll_hz() -> u32 {
    DEFAULT_POLL_HZ
}

fn default_le_group() -> u8 {
    le::LE_PORT_GROUP
}

/// Onboard I2C bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    /// Transport name devices refer to
    pub name: String,
    /// Bus number, i.e. `/dev/i2c-<bus_id>`
    #[serde(default = "default_bus_id")]
    pub bus_id: u32,
    /// Overrides the device node derived from `bus_id`
    #[serde(default)]
    pub device_path: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "i2c".to_string(),
            bus_id: default_bus_id(),
            device_path: None,
        }
    }
}

/// How the classic-radio board is reached
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkKind {
    /// Sequenced-packet L2CAP channel to `address`
    #[default]
    L2cap,
    /// Serial tty carrying the same frames
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

/// External I/O board over the classic radio
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoardConfig {
    pub name: String,
    /// Radio address, `AA:BB:CC:DD:EE:FF`
    pub address: String,
    #[serde(default = "default_psm")]
    pub psm: u16,
    #[serde(default)]
    pub link: LinkKind,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl BoardConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Low-energy key peripheral
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeConfig {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub address_type: AddressType,
    #[serde(default)]
    pub security: SecurityLevel,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl LeConfig {
    pub fn connect_params(&self) -> LeConnectParams {
        LeConnectParams {
            address: self.address.clone(),
            address_type: self.address_type,
            security: self.security,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// A logical device and where it is wired
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    /// Button on a port-expander line (bus or board)
    ExpanderButton {
        name: String,
        transport: String,
        address: u8,
        port: u8,
    },
    /// Button on a board GPIO line
    GpioButton {
        name: String,
        transport: String,
        group: u8,
        pin: u8,
    },
    /// Key on the low-energy peripheral
    LeButton {
        name: String,
        transport: String,
        #[serde(default = "default_le_group")]
        group: u8,
        pin: u8,
    },
    /// ADS7830 channel on the bus
    Fader {
        name: String,
        transport: String,
        address: u8,
        channel: u8,
        #[serde(default = "default_poll_hz")]
        frequency_hz: u32,
    },
    /// Output on a port-expander line (bus or board)
    ExpanderOutput {
        name: String,
        transport: String,
        address: u8,
        port: u8,
    },
    /// DRV8830 motor driver on the bus
    DcMotor {
        name: String,
        transport: String,
        address: u8,
    },
    /// TLC59116 channel behind the board, switched fully on or off
    Relay {
        name: String,
        transport: String,
        address: u8,
        channel: u8,
    },
    /// TLC59116 channel behind the board, dimmed
    Led {
        name: String,
        transport: String,
        address: u8,
        channel: u8,
    },
}

impl DeviceConfig {
    pub fn name(&self) -> &str {
        match self {
            DeviceConfig::ExpanderButton { name, .. }
            | DeviceConfig::GpioButton { name, .. }
            | DeviceConfig::LeButton { name, .. }
            | DeviceConfig::Fader { name, .. }
            | DeviceConfig::ExpanderOutput { name, .. }
            | DeviceConfig::DcMotor { name, .. }
            | DeviceConfig::Relay { name, .. }
            | DeviceConfig::Led { name, .. } => name,
        }
    }

    pub fn transport(&self) -> &str {
        match self {
            DeviceConfig::ExpanderButton { transport, .. }
            | DeviceConfig::GpioButton { transport, .. }
            | DeviceConfig::LeButton { transport, .. }
            | DeviceConfig::Fader { transport, .. }
            | DeviceConfig::ExpanderOutput { transport, .. }
            | DeviceConfig::DcMotor { transport, .. }
            | DeviceConfig::Relay { transport, .. }
            | DeviceConfig::Led { transport, .. } => transport,
        }
    }

    /// Transport kinds this device can hang off
    fn accepts(&self, kind: TransportKind) -> bool {
        match self {
            DeviceConfig::ExpanderButton { .. } | DeviceConfig::ExpanderOutput { .. } => {
                matches!(kind, TransportKind::Bus | TransportKind::Board)
            }
            DeviceConfig::GpioButton { .. }
            | DeviceConfig::Relay { .. }
            | DeviceConfig::Led { .. } => kind == TransportKind::Board,
            DeviceConfig::LeButton { .. } => kind == TransportKind::Le,
            DeviceConfig::Fader { .. } | DeviceConfig::DcMotor { .. } => {
                kind == TransportKind::Bus
            }
        }
    }

    fn check_ranges(&self) -> Result<(), ConfigError> {
        let name = self.name();
        match self {
            DeviceConfig::ExpanderButton { address, port, .. }
            | DeviceConfig::ExpanderOutput { address, port, .. } => {
                in_range(name, "chip address", *address, 0x7F)?;
                in_range(name, "port", *port, EXPANDER_PORTS - 1)
            }
            DeviceConfig::GpioButton { group, pin, .. } => {
                in_range(name, "port group", *group, MAX_PORT_GROUP)?;
                in_range(name, "pin", *pin, 7)
            }
            DeviceConfig::LeButton { group, pin, .. } => le::check_line(*group, *pin),
            DeviceConfig::Fader {
                address,
                channel,
                frequency_hz,
                ..
            } => {
                in_range(name, "chip address", *address, 0x7F)?;
                in_range(name, "channel", *channel, FADER_CHANNELS - 1)?;
                if *frequency_hz == 0 {
                    return Err(ConfigError::ZeroFrequency(name.to_string()));
                }
                Ok(())
            }
            DeviceConfig::DcMotor { address, .. } => in_range(name, "chip address", *address, 0x7F),
            DeviceConfig::Relay {
                address, channel, ..
            }
            | DeviceConfig::Led {
                address, channel, ..
            } => {
                in_range(name, "chip address", *address, 0x7F)?;
                in_range(name, "channel", *channel, TLC59116_CHANNELS - 1)
            }
        }
    }
}

fn in_range(device: &str, field: &'static str, value: u8, max: u8) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange {
            device: device.to_string(),
            field,
            value: value.into(),
            max: max.into(),
        });
    }
    Ok(())
}

/// Kind of a named transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Bus,
    Board,
    Le,
}

/// Every transport and device of one installation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InstallationConfig {
    #[serde(default)]
    pub buses: Vec<BusConfig>,
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
    #[serde(default)]
    pub le: Vec<LeConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl InstallationConfig {
    /// Kind of the transport called `name`
    pub fn transport_kind(&self, name: &str) -> Option<TransportKind> {
        if self.buses.iter().any(|b| b.name == name) {
            Some(TransportKind::Bus)
        } else if self.boards.iter().any(|b| b.name == name) {
            Some(TransportKind::Board)
        } else if self.le.iter().any(|l| l.name == name) {
            Some(TransportKind::Le)
        } else {
            None
        }
    }

    /// Check names, references and hardware ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut transports = HashSet::new();
        let names = self
            .buses
            .iter()
            .map(|b| &b.name)
            .chain(self.boards.iter().map(|b| &b.name))
            .chain(self.le.iter().map(|l| &l.name));
        for name in names {
            if !transports.insert(name.as_str()) {
                return Err(ConfigError::DuplicateName(name.clone()));
            }
        }

        let mut devices = HashSet::new();
        for device in &self.devices {
            if !devices.insert(device.name()) {
                return Err(ConfigError::DuplicateName(device.name().to_string()));
            }

            let accepted = self
                .transport_kind(device.transport())
                .is_some_and(|kind| device.accepts(kind));
            if !accepted {
                return Err(ConfigError::UnknownTransport {
                    device: device.name().to_string(),
                    transport: device.transport().to_string(),
                });
            }

            device.check_ranges()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> InstallationConfig {
        InstallationConfig {
            buses: vec![BusConfig::default()],
            boards: vec![BoardConfig {
                name: "board".into(),
                address: "00:1A:7D:DA:71:13".into(),
                psm: DEFAULT_PSM,
                link: LinkKind::L2cap,
                reconnect_delay_ms: 1000,
            }],
            le: Vec::new(),
            devices: vec![
                DeviceConfig::ExpanderButton {
                    name: "go".into(),
                    transport: "i2c".into(),
                    address: 0x20,
                    port: 0,
                },
                DeviceConfig::GpioButton {
                    name: "stop".into(),
                    transport: "board".into(),
                    group: 2,
                    pin: 3,
                },
            ],
        }
    }

    #[test]
    fn test_sample_is_valid() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn test_defaults_from_json() {
        let json = r#"{
            "boards": [{ "name": "board", "address": "00:1A:7D:DA:71:13" }],
            "devices": [
                { "type": "fader", "name": "f", "transport": "i2c", "address": 72, "channel": 1 }
            ]
        }"#;
        let config: InstallationConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.boards[0].psm, 0x1001);
        assert_eq!(config.boards[0].reconnect_delay(), Duration::from_secs(1));
        assert_eq!(config.boards[0].link, LinkKind::L2cap);
        assert!(matches!(
            config.devices[0],
            DeviceConfig::Fader { frequency_hz: 50, .. }
        ));
        assert_eq!(BusConfig::default().bus_id, 1);
    }

    #[test]
    fn test_serial_link_from_json() {
        let json = r#"{ "name": "b", "address": "00:00:00:00:00:01",
                        "link": { "kind": "serial", "path": "/dev/rfcomm0" } }"#;
        let board: BoardConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            board.link,
            LinkKind::Serial {
                path: "/dev/rfcomm0".into(),
                baud_rate: 115_200
            }
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = sample();
        config.devices.push(DeviceConfig::DcMotor {
            name: "go".into(),
            transport: "i2c".into(),
            address: 0x60,
        });
        assert_eq!(config.validate(), Err(ConfigError::DuplicateName("go".into())));
    }

    #[test]
    fn test_unknown_or_wrong_transport_rejected() {
        let mut config = sample();
        config.devices.push(DeviceConfig::Fader {
            name: "f".into(),
            transport: "board".into(),
            address: 0x48,
            channel: 0,
            frequency_hz: 50,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownTransport { .. })
        ));

        let mut config = sample();
        config.devices.push(DeviceConfig::DcMotor {
            name: "m".into(),
            transport: "nowhere".into(),
            address: 0x60,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownTransport { .. })
        ));
    }

    #[test]
    fn test_ranges_rejected() {
        let cases = [
            DeviceConfig::ExpanderButton {
                name: "x".into(),
                transport: "i2c".into(),
                address: 0x80,
                port: 0,
            },
            DeviceConfig::ExpanderOutput {
                name: "x".into(),
                transport: "i2c".into(),
                address: 0x20,
                port: 16,
            },
            DeviceConfig::GpioButton {
                name: "x".into(),
                transport: "board".into(),
                group: 32,
                pin: 0,
            },
            DeviceConfig::GpioButton {
                name: "x".into(),
                transport: "board".into(),
                group: 0,
                pin: 8,
            },
            DeviceConfig::Fader {
                name: "x".into(),
                transport: "i2c".into(),
                address: 0x48,
                channel: 8,
                frequency_hz: 50,
            },
            DeviceConfig::Relay {
                name: "x".into(),
                transport: "board".into(),
                address: 0x60,
                channel: 16,
            },
            DeviceConfig::Led {
                name: "x".into(),
                transport: "board".into(),
                address: 0x80,
                channel: 0,
            },
        ];
        for device in cases {
            let mut config = sample();
            config.devices.push(device);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn test_driver_channels_only_behind_board() {
        let json = r#"[
            { "type": "relay", "name": "pump", "transport": "board", "address": 96, "channel": 3 },
            { "type": "led", "name": "glow", "transport": "board", "address": 96, "channel": 4 }
        ]"#;
        let mut config = sample();
        config.devices = serde_json::from_str(json).unwrap();
        assert_eq!(config.validate(), Ok(()));

        config.devices.push(DeviceConfig::Relay {
            name: "siren".into(),
            transport: "i2c".into(),
            address: 0x60,
            channel: 5,
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownTransport { .. })
        ));
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let mut config = sample();
        config.devices.push(DeviceConfig::Fader {
            name: "f".into(),
            transport: "i2c".into(),
            address: 0x48,
            channel: 0,
            frequency_hz: 0,
        });
        assert_eq!(config.validate(), Err(ConfigError::ZeroFrequency("f".into())));
    }

    #[test]
    fn test_le_lines_limited() {
        let mut config = sample();
        config.le.push(LeConfig {
            name: "keys".into(),
            address: "C0:00:00:00:00:01".into(),
            address_type: AddressType::Random,
            security: SecurityLevel::Low,
            reconnect_delay_ms: 1000,
        });
        config.devices.push(DeviceConfig::LeButton {
            name: "k".into(),
            transport: "keys".into(),
            group: 2,
            pin: 4,
        });
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedLine { group: 2, pin: 4 })
        );
    }
}
