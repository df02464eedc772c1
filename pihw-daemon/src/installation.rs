//! Running installation
//!
//! Turns an [`InstallationConfig`] into live transport sessions and the
//! devices wired to them. Hardware comes either from the host (bus device
//! nodes, radio sockets, serial ports) or from the simulated rig used in
//! demo mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use pihw_io::{
    BoardConfig, BoardSession, BusConfig, BusSession, ConnectionObserver, Device, DeviceConfig,
    DeviceId, DeviceKind, DeviceListener, EventForwarder, InstallationConfig, LeConfig, LeLink,
    LeSession, Link, SessionOptions,
};
use tracing::info;

use crate::demo::SimRig;

/// Where the transports get their hardware
pub enum Backend {
    Hardware,
    Simulated(SimRig),
}

impl Backend {
    fn bus(&self, config: &BusConfig) -> anyhow::Result<BusSession> {
        let session = match self {
            Backend::Hardware => {
                BusSession::open(&config.name, config.bus_id, config.device_path.as_deref())
            }
            Backend::Simulated(rig) => {
                BusSession::start(&config.name, Box::new(rig.bus(&config.name)?))
            }
        };
        session.with_context(|| format!("starting bus '{}'", config.name))
    }

    fn board_link(&self, config: &BoardConfig) -> anyhow::Result<Box<dyn Link>> {
        match self {
            Backend::Hardware => hardware::board_link(config),
            Backend::Simulated(rig) => Ok(Box::new(rig.board(&config.name)?)),
        }
    }

    fn le_link(&self, config: &LeConfig) -> anyhow::Result<Box<dyn LeLink>> {
        match self {
            Backend::Hardware => hardware::le_link(),
            Backend::Simulated(rig) => Ok(Box::new(rig.le(&config.name)?)),
        }
    }
}

#[cfg(target_os = "linux")]
mod hardware {
    use super::*;
    use pihw_io::{AttLink, L2capLink, LinkKind, SerialLink};

    pub fn board_link(config: &BoardConfig) -> anyhow::Result<Box<dyn Link>> {
        Ok(match &config.link {
            LinkKind::L2cap => Box::new(L2capLink::new(config.address.clone(), config.psm)?),
            LinkKind::Serial { path, baud_rate } => {
                Box::new(SerialLink::new(path.clone(), *baud_rate)?)
            }
        })
    }

    pub fn le_link() -> anyhow::Result<Box<dyn LeLink>> {
        Ok(Box::new(AttLink::new()?))
    }
}

#[cfg(not(target_os = "linux"))]
mod hardware {
    use super::*;

    pub fn board_link(config: &BoardConfig) -> anyhow::Result<Box<dyn Link>> {
        bail!("board '{}': radio links need Linux; try --demo", config.name)
    }

    pub fn le_link() -> anyhow::Result<Box<dyn LeLink>> {
        bail!("low-energy links need Linux; try --demo")
    }
}

enum Transport {
    Bus(BusSession),
    Board(BoardSession),
    Le(LeSession),
}

impl Transport {
    fn stop(&self) {
        match self {
            Transport::Bus(session) => session.stop(),
            Transport::Board(session) => session.stop(),
            Transport::Le(session) => session.stop(),
        }
    }
}

/// Sessions and devices of one installation
pub struct Installation {
    transports: BTreeMap<String, Transport>,
    devices: Vec<Arc<Device>>,
}

impl Installation {
    /// Start every transport, then wire every device to its transport
    ///
    /// Each device and transport reports to `events`.
    pub fn start(
        config: &InstallationConfig,
        backend: &Backend,
        events: &EventForwarder,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let observer: Arc<dyn ConnectionObserver> = Arc::new(events.clone());
        let options = |delay| SessionOptions {
            reconnect_delay: Some(delay),
            observer: Some(Arc::clone(&observer)),
        };

        let mut installation = Self {
            transports: BTreeMap::new(),
            devices: Vec::new(),
        };
        for bus in &config.buses {
            let session = backend.bus(bus)?;
            installation
                .transports
                .insert(bus.name.clone(), Transport::Bus(session));
        }
        for board in &config.boards {
            let link = backend.board_link(board)?;
            let session = BoardSession::start(&board.name, link, options(board.reconnect_delay()))
                .with_context(|| format!("starting board '{}'", board.name))?;
            installation
                .transports
                .insert(board.name.clone(), Transport::Board(session));
        }
        for le in &config.le {
            let link = backend.le_link(le)?;
            let session = LeSession::start(
                &le.name,
                link,
                le.connect_params(),
                options(le.reconnect_delay()),
            )
            .with_context(|| format!("starting low-energy link '{}'", le.name))?;
            installation
                .transports
                .insert(le.name.clone(), Transport::Le(session));
        }

        for (index, device_config) in config.devices.iter().enumerate() {
            let id = DeviceId(index as u32 + 1);
            let device = Device::new(id, device_config.name(), kind_of(device_config));
            device.add_listener(Arc::new(events.clone()) as Arc<dyn DeviceListener>);
            installation.wire(device_config, Arc::clone(&device))?;
            installation.devices.push(device);
        }

        info!(
            "installation running: {} transports, {} devices",
            installation.transports.len(),
            installation.devices.len()
        );
        Ok(installation)
    }

    fn wire(&self, config: &DeviceConfig, device: Arc<Device>) -> anyhow::Result<()> {
        let transport = self
            .transports
            .get(config.transport())
            .ok_or_else(|| anyhow!("no transport '{}'", config.transport()))?;

        match (config, transport) {
            (DeviceConfig::ExpanderButton { address, port, .. }, Transport::Bus(bus)) => {
                bus.add_expander_input(*address, *port, device)?
            }
            (DeviceConfig::ExpanderButton { address, port, .. }, Transport::Board(board)) => {
                board.add_expander_input(*address, *port, device)?
            }
            (DeviceConfig::ExpanderOutput { address, port, .. }, Transport::Bus(bus)) => {
                bus.add_expander_output(*address, *port, device)?
            }
            (DeviceConfig::ExpanderOutput { address, port, .. }, Transport::Board(board)) => {
                board.add_expander_output(*address, *port, device)?
            }
            (DeviceConfig::GpioButton { group, pin, .. }, Transport::Board(board)) => {
                board.add_gpio_input(*group, *pin, device)?
            }
            (DeviceConfig::LeButton { group, pin, .. }, Transport::Le(le)) => {
                le.add_gpio_input(*group, *pin, device)?
            }
            (
                DeviceConfig::Fader {
                    address,
                    channel,
                    frequency_hz,
                    ..
                },
                Transport::Bus(bus),
            ) => {
                bus.add_fader(*address, *channel, *frequency_hz, device)?;
            }
            (DeviceConfig::DcMotor { address, .. }, Transport::Bus(bus)) => {
                bus.add_dc_motor(*address, device)?
            }
            (DeviceConfig::Relay { address, channel, .. }, Transport::Board(board)) => {
                board.add_relay(*address, *channel, device)?
            }
            (DeviceConfig::Led { address, channel, .. }, Transport::Board(board)) => {
                board.add_led(*address, *channel, device)?
            }
            _ => bail!(
                "device '{}' cannot use transport '{}'",
                config.name(),
                config.transport()
            ),
        }
        Ok(())
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&Arc<Device>> {
        self.devices.iter().find(|d| d.name() == name)
    }

    /// Stop every transport; blocks until their workers have exited
    pub fn stop(&self) {
        for (name, transport) in &self.transports {
            transport.stop();
            info!("{} stopped", name);
        }
    }
}

fn kind_of(config: &DeviceConfig) -> DeviceKind {
    match config {
        DeviceConfig::ExpanderButton { .. }
        | DeviceConfig::GpioButton { .. }
        | DeviceConfig::LeButton { .. } => DeviceKind::Button,
        DeviceConfig::Fader { .. } => DeviceKind::Fader,
        DeviceConfig::ExpanderOutput { .. } => DeviceKind::Gpo,
        DeviceConfig::DcMotor { .. } => DeviceKind::DcMotor,
        DeviceConfig::Relay { .. } => DeviceKind::Relay,
        DeviceConfig::Led { .. } => DeviceKind::Led,
    }
}
