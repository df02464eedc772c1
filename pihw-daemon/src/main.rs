//! pihw Daemon
//!
//! Headless service that runs one installation: it loads the settings,
//! starts every transport session, wires the configured devices and logs
//! their events until interrupted.
//!
//! ```text
//! pihw [--demo] [SETTINGS.json]
//! ```

mod demo;
mod installation;
mod settings;

use std::path::PathBuf;

use anyhow::{bail, Context};
use pihw_io::{DeviceEvent, ErrorLevel, EventForwarder};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use demo::SimRig;
use installation::{Backend, Installation};
use settings::Settings;

/// Command line arguments
#[derive(Debug, Default, PartialEq)]
struct Args {
    /// Run against simulated hardware
    demo: bool,
    /// Settings file; the per-user default when absent
    settings: Option<PathBuf>,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Args::default();
        for arg in args {
            match arg.as_str() {
                "--demo" => parsed.demo = true,
                flag if flag.starts_with('-') => bail!("unknown option '{}'", flag),
                path => {
                    if parsed.settings.is_some() {
                        bail!("more than one settings file given");
                    }
                    parsed.settings = Some(PathBuf::from(path));
                }
            }
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse(std::env::args().skip(1))?;
    let settings = Settings::load(args.settings.as_deref())?;

    // RUST_LOG wins over the settings file
    let directives = settings.log.directives()?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pihw daemon");

    let config = if args.demo && settings.installation.devices.is_empty() {
        demo::demo_installation()
    } else {
        settings.installation.clone()
    };
    let backend = if args.demo {
        Backend::Simulated(SimRig::for_config(&config))
    } else {
        Backend::Hardware
    };

    let (forwarder, events) = EventForwarder::channel();
    let consumer = tokio::spawn(log_events(events));

    let installation =
        Installation::start(&config, &backend, &forwarder).context("starting installation")?;

    let animator = match &backend {
        Backend::Simulated(rig) => Some(tokio::spawn(demo::run_demo(
            rig.clone(),
            config.clone(),
            installation.devices().to_vec(),
        ))),
        Backend::Hardware => None,
    };

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("Interrupted, shutting down");

    if let Some(animator) = animator {
        animator.abort();
    }
    // Stopping joins the worker threads
    tokio::task::spawn_blocking(move || installation.stop()).await?;
    consumer.abort();

    info!("pihw daemon stopped");
    Ok(())
}

/// Log every device and connection event
async fn log_events(mut events: UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DeviceEvent::ValueChanged { name, value, .. } => info!("{}: {}", name, value),
            DeviceEvent::ErrorLevelChanged { name, level, .. } if level > ErrorLevel::Ok => {
                warn!("{}: error level {}", name, level)
            }
            DeviceEvent::ErrorLevelChanged { name, level, .. } => {
                info!("{}: error level {}", name, level)
            }
            DeviceEvent::ConnectionChanged { transport, state } => {
                info!("{}: {}", transport, state)
            }
        }
    }
}
