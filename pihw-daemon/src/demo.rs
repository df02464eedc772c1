//! Demo mode
//!
//! Runs an installation against the simulated hardware from `pihw-sim` and
//! animates it: buttons are pressed and released, faders sweep, outputs,
//! driver channels and motors follow along.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use pihw_io::{
    BoardConfig, BusConfig, Device, DeviceConfig, DeviceKind, InstallationConfig, LeConfig,
    LinkKind, TransportKind, Value,
};
use pihw_sim::{SimBoard, SimBus, SimLe};
use tracing::{debug, info};

/// Interval between demo steps
const STEP: Duration = Duration::from_millis(1500);

/// Simulated hardware for every transport of an installation
#[derive(Clone, Default)]
pub struct SimRig {
    buses: BTreeMap<String, SimBus>,
    boards: BTreeMap<String, SimBoard>,
    le: BTreeMap<String, SimLe>,
}

impl SimRig {
    /// Build a rig with one simulated chip behind every configured device
    pub fn for_config(config: &InstallationConfig) -> Self {
        let mut rig = Self::default();
        for bus in &config.buses {
            rig.buses.insert(bus.name.clone(), SimBus::new());
        }
        for board in &config.boards {
            rig.boards.insert(board.name.clone(), SimBoard::new());
        }
        for le in &config.le {
            rig.le.insert(le.name.clone(), SimLe::new());
        }

        for device in &config.devices {
            let Some(bus) = rig.chip_bus(device.transport()) else {
                continue;
            };
            match device {
                DeviceConfig::ExpanderButton { address, .. }
                | DeviceConfig::ExpanderOutput { address, .. } => {
                    if bus.register(*address).is_none() {
                        bus.add_pcf8575(*address);
                    }
                }
                DeviceConfig::Fader { address, .. } => {
                    if bus.chip(*address).is_none() {
                        bus.add_ads7830(*address);
                    }
                }
                DeviceConfig::DcMotor { address, .. } => bus.add_drv8830(*address),
                DeviceConfig::Relay { address, .. } | DeviceConfig::Led { address, .. } => {
                    if bus.driver_registers(*address).is_none() {
                        bus.add_tlc59116(*address);
                    }
                }
                DeviceConfig::GpioButton { .. } | DeviceConfig::LeButton { .. } => {}
            }
        }
        rig
    }

    /// Bus holding the chips of `transport`: the bus itself, or a board's
    /// own bus
    fn chip_bus(&self, transport: &str) -> Option<&SimBus> {
        self.buses
            .get(transport)
            .or_else(|| self.boards.get(transport).map(|b| b.bus()))
    }

    pub fn bus(&self, name: &str) -> anyhow::Result<SimBus> {
        self.buses
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no simulated bus '{}'", name))
    }

    pub fn board(&self, name: &str) -> anyhow::Result<SimBoard> {
        self.boards
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no simulated board '{}'", name))
    }

    pub fn le(&self, name: &str) -> anyhow::Result<SimLe> {
        self.le
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no simulated key peripheral '{}'", name))
    }

    /// Apply one demo step to the simulated inputs
    fn step(&self, config: &InstallationConfig, n: u32) {
        let pressed = n % 2 == 0;
        for device in &config.devices {
            match device {
                DeviceConfig::ExpanderButton {
                    transport,
                    address,
                    port,
                    ..
                } => {
                    if let Some(bus) = self.chip_bus(transport) {
                        bus.press(*address, *port, pressed);
                    }
                }
                DeviceConfig::GpioButton {
                    transport,
                    group,
                    pin,
                    ..
                } => {
                    if let Some(board) = self.boards.get(transport) {
                        board.set_line(*group, *pin, pressed);
                    }
                }
                DeviceConfig::LeButton { transport, pin, .. } => {
                    if let Some(le) = self.le.get(transport) {
                        le.press(*pin, pressed);
                    }
                }
                DeviceConfig::Fader {
                    transport,
                    address,
                    channel,
                    ..
                } => {
                    if let Some(bus) = self.chip_bus(transport) {
                        bus.set_channel(*address, *channel, (n.wrapping_mul(37) % 256) as u8);
                    }
                }
                DeviceConfig::ExpanderOutput { .. }
                | DeviceConfig::DcMotor { .. }
                | DeviceConfig::Relay { .. }
                | DeviceConfig::Led { .. } => {}
            }
        }
    }
}

/// Installation used by `--demo` when the settings define none
pub fn demo_installation() -> InstallationConfig {
    InstallationConfig {
        buses: vec![BusConfig::default()],
        boards: vec![BoardConfig {
            name: "stage".into(),
            address: "00:00:00:00:00:01".into(),
            psm: pihw_io::config::DEFAULT_PSM,
            link: LinkKind::L2cap,
            reconnect_delay_ms: 250,
        }],
        le: vec![LeConfig {
            name: "keys".into(),
            address: "C0:00:00:00:00:01".into(),
            address_type: pihw_io::AddressType::Random,
            security: pihw_io::SecurityLevel::Medium,
            reconnect_delay_ms: 250,
        }],
        devices: vec![
            DeviceConfig::ExpanderButton {
                name: "start".into(),
                transport: "i2c".into(),
                address: 0x20,
                port: 0,
            },
            DeviceConfig::ExpanderOutput {
                name: "start-lamp".into(),
                transport: "i2c".into(),
                address: 0x20,
                port: 8,
            },
            DeviceConfig::Fader {
                name: "volume".into(),
                transport: "i2c".into(),
                address: 0x48,
                channel: 0,
                frequency_hz: 20,
            },
            DeviceConfig::DcMotor {
                name: "turntable".into(),
                transport: "i2c".into(),
                address: 0x60,
            },
            DeviceConfig::GpioButton {
                name: "stage-red".into(),
                transport: "stage".into(),
                group: 2,
                pin: 1,
            },
            DeviceConfig::ExpanderButton {
                name: "stage-green".into(),
                transport: "stage".into(),
                address: 0x21,
                port: 3,
            },
            DeviceConfig::Relay {
                name: "stage-smoke".into(),
                transport: "stage".into(),
                address: 0x60,
                channel: 0,
            },
            DeviceConfig::Led {
                name: "stage-glow".into(),
                transport: "stage".into(),
                address: 0x60,
                channel: 1,
            },
            DeviceConfig::LeButton {
                name: "key-1".into(),
                transport: "keys".into(),
                group: 2,
                pin: 0,
            },
        ],
    }
}

/// Drive the simulated inputs and the installation's outputs forever
pub async fn run_demo(rig: SimRig, config: InstallationConfig, devices: Vec<Arc<Device>>) {
    info!(
        "demo running: {} buses, {} boards, {} key peripherals",
        count(&config, TransportKind::Bus),
        count(&config, TransportKind::Board),
        count(&config, TransportKind::Le)
    );

    let mut interval = tokio::time::interval(STEP);
    let mut n: u32 = 0;
    loop {
        interval.tick().await;
        debug!("demo step {}", n);
        rig.step(&config, n);

        let on = n % 4 < 2;
        for device in &devices {
            match device.kind() {
                DeviceKind::Gpo | DeviceKind::Relay => device.set_value(Value::Digital(on)),
                DeviceKind::Led => device.set_value(Value::Percent((n % 5 * 25) as u8)),
                DeviceKind::DcMotor => {
                    let speed = [0i8, 60, 100, -60][(n % 4) as usize];
                    device.set_value(Value::Speed(speed));
                }
                DeviceKind::Button | DeviceKind::Fader => {}
            }
        }
        n = n.wrapping_add(1);
    }
}

fn count(config: &InstallationConfig, kind: TransportKind) -> usize {
    match kind {
        TransportKind::Bus => config.buses.len(),
        TransportKind::Board => config.boards.len(),
        TransportKind::Le => config.le.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_installation_is_valid() {
        demo_installation().validate().unwrap();
    }

    #[test]
    fn test_rig_places_chips() {
        let config = demo_installation();
        let rig = SimRig::for_config(&config);

        let bus = rig.bus("i2c").unwrap();
        assert_eq!(bus.register(0x20), Some(0xFFFF));
        assert!(bus.chip(0x48).is_some());
        assert_eq!(bus.motor_control(0x60), Some(0));

        // Chips of expander lines behind the board live on the board's bus
        let board = rig.board("stage").unwrap();
        assert!(board.bus().register(0x21).is_some());
        assert!(board.bus().driver_registers(0x60).is_some());
        assert!(bus.chip(0x21).is_none());
        assert!(rig.le("keys").is_ok());
        assert!(rig.le("stage").is_err());
    }

    #[test]
    fn test_step_presses_and_releases() {
        let config = demo_installation();
        let rig = SimRig::for_config(&config);
        let bus = rig.bus("i2c").unwrap();

        rig.step(&config, 0);
        assert_eq!(
            bus.transact(0x20, &[], 2),
            Some(vec![0xFE, 0xFF])
        );
        rig.step(&config, 1);
        assert_eq!(
            bus.transact(0x20, &[], 2),
            Some(vec![0xFF, 0xFF])
        );
    }
}
