//! Port-expander multiplexer
//!
//! A PCF8575 chip exposes 16 quasi-bidirectional lines behind one 16-bit
//! register. Many logical buttons and outputs can share a chip, so the
//! register is owned here, per chip address, in an [`ExpanderArena`] that
//! lives inside the transport context. Logical devices never talk to the
//! chip themselves.
//!
//! - Inputs are read by one periodic register read; every input line gets
//!   its bit (active low) and an error-free outcome.
//! - Outputs are written by recomputing the full register from every output
//!   line's current value. Changes are coalesced: while a write for a chip
//!   is queued, further changes do not queue another.
//! - A chip disappears (its poll unregistered) as soon as its last line is
//!   removed.
//!
//! Transports provide the actual register access through [`ExpanderHost`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::{Device, DeviceId, ListenerId, Value};
use crate::error::ConfigError;
use crate::events::DeviceListener;
use crate::scheduler::{Pollable, PollToken, SchedulerHandle, WorkerContext};

/// Register read frequency
pub const EXPANDER_POLL_HZ: u32 = 50;
/// Lines per chip
pub const EXPANDER_PORTS: u8 = 16;

/// Transport side of the multiplexer
pub trait ExpanderHost: WorkerContext {
    fn expanders(&mut self) -> &mut ExpanderArena;

    /// Write `mask` to the chip and report the outcome to its outputs
    fn write_register(&mut self, address: u8, mask: u16);

    /// Read the chip register and report it (or the failure) to its inputs
    fn read_register(&mut self, address: u8);
}

struct Line {
    port: u8,
    device: Arc<Device>,
    listener: Option<ListenerId>,
}

/// Shared register state of one chip
pub struct PortExpander {
    address: u8,
    inputs: Vec<Line>,
    outputs: Vec<Line>,
    poll: Option<PollToken>,
}

impl PortExpander {
    fn new(address: u8) -> Self {
        Self {
            address,
            inputs: Vec::new(),
            outputs: Vec::new(),
            poll: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Register value: input lines high so they can be pulled low,
    /// output lines at their device's current value
    pub fn mask(&self) -> u16 {
        let inputs = self
            .inputs
            .iter()
            .fold(0u16, |mask, line| mask | 1 << line.port);
        self.outputs.iter().fold(inputs, |mask, line| {
            let on = line.device.value().as_digital().unwrap_or(false);
            (mask & !(1 << line.port)) | if on { 1 << line.port } else { 0 }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Fan a successful register read out to every input
    pub fn apply_read(&self, state: u16) {
        for line in &self.inputs {
            line.device
                .set_value(Value::Digital(state & (1 << line.port) == 0));
            line.device.handle_error(false, false);
        }
    }

    pub fn input_failed(&self) {
        for line in &self.inputs {
            line.device.handle_error(true, false);
        }
    }

    pub fn output_outcome(&self, ok: bool) {
        for line in &self.outputs {
            line.device.handle_error(!ok, false);
        }
    }

    fn remove(&mut self, id: DeviceId) -> bool {
        let before = self.inputs.len() + self.outputs.len();
        self.inputs.retain(|line| line.device.id() != id);
        self.outputs.retain(|line| {
            if line.device.id() != id {
                return true;
            }
            if let Some(listener) = line.listener {
                line.device.remove_listener(listener);
            }
            false
        });
        before != self.inputs.len() + self.outputs.len()
    }
}

/// All chips of one transport, keyed by address
#[derive(Default)]
pub struct ExpanderArena {
    chips: HashMap<u8, PortExpander>,
    pending_writes: Arc<Mutex<HashSet<u8>>>,
}

impl ExpanderArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: u8) -> Option<&PortExpander> {
        self.chips.get(&address)
    }

    pub fn addresses(&self) -> Vec<u8> {
        let mut addresses: Vec<u8> = self.chips.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    pub fn len(&self) -> usize {
        self.chips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chips.is_empty()
    }

    fn take_pending(&self, address: u8) {
        self.pending_writes.lock().remove(&address);
    }
}

/// Poll job reading one chip
struct ExpanderPoll {
    address: u8,
}

impl<C: ExpanderHost> Pollable<C> for ExpanderPoll {
    fn poll(&self, ctx: &mut C) {
        ctx.read_register(self.address);
    }
}

/// Watches an output device and queues a coalesced register write
struct OutputWatch<C: ExpanderHost> {
    address: u8,
    pending: Arc<Mutex<HashSet<u8>>>,
    handle: SchedulerHandle<C>,
}

impl<C: ExpanderHost> DeviceListener for OutputWatch<C> {
    fn on_value_changed(&self, _device: &Device) {
        request_write(&self.handle, &self.pending, self.address);
    }
}

fn request_write<C: ExpanderHost>(
    handle: &SchedulerHandle<C>,
    pending: &Mutex<HashSet<u8>>,
    address: u8,
) {
    if pending.lock().insert(address) {
        handle.enqueue(move |ctx: &mut C| flush(ctx, address));
    }
}

fn flush<C: ExpanderHost>(ctx: &mut C, address: u8) {
    let arena = ctx.expanders();
    // Cleared before reading values so a change racing this write queues another
    arena.take_pending(address);
    let Some(chip) = arena.get(address) else {
        return;
    };
    let mask = chip.mask();
    debug!(target: "pihw::expander", "0x{:02X}: write {:016b}", address, mask);
    ctx.write_register(address, mask);
}

fn validate(address: u8, port: u8, device: &Device) -> Result<(), ConfigError> {
    if address > 0x7F {
        return Err(ConfigError::OutOfRange {
            device: device.name().to_string(),
            field: "chip address",
            value: address.into(),
            max: 0x7F,
        });
    }
    if port >= EXPANDER_PORTS {
        return Err(ConfigError::OutOfRange {
            device: device.name().to_string(),
            field: "port",
            value: port.into(),
            max: u32::from(EXPANDER_PORTS - 1),
        });
    }
    Ok(())
}

fn chip_for<'a, C: ExpanderHost>(
    ctx: &'a mut C,
    handle: &SchedulerHandle<C>,
    address: u8,
) -> &'a mut PortExpander {
    let arena = ctx.expanders();
    arena.chips.entry(address).or_insert_with(|| {
        debug!(target: "pihw::expander", "0x{:02X}: created", address);
        let mut chip = PortExpander::new(address);
        match handle.register_poll(Arc::new(ExpanderPoll { address }), EXPANDER_POLL_HZ) {
            Ok(token) => chip.poll = Some(token),
            Err(e) => warn!(target: "pihw::expander", "0x{:02X}: {}", address, e),
        }
        chip
    })
}

/// Attach an input device to `port` of the chip at `address`
pub fn add_input<C: ExpanderHost>(
    handle: &SchedulerHandle<C>,
    address: u8,
    port: u8,
    device: Arc<Device>,
) -> Result<(), ConfigError> {
    validate(address, port, &device)?;

    let worker = handle.clone();
    handle.enqueue(move |ctx: &mut C| {
        let chip = chip_for(ctx, &worker, address);
        chip.inputs.push(Line {
            port,
            device,
            listener: None,
        });
        // The input's bit must be driven high before it can be read
        let pending = Arc::clone(&ctx.expanders().pending_writes);
        request_write(&worker, &pending, address);
    });
    Ok(())
}

/// Attach an output device to `port` of the chip at `address`
pub fn add_output<C: ExpanderHost>(
    handle: &SchedulerHandle<C>,
    address: u8,
    port: u8,
    device: Arc<Device>,
) -> Result<(), ConfigError> {
    validate(address, port, &device)?;

    let worker = handle.clone();
    handle.enqueue(move |ctx: &mut C| {
        let pending = Arc::clone(&ctx.expanders().pending_writes);
        let chip = chip_for(ctx, &worker, address);
        chip.outputs.push(Line {
            port,
            device: Arc::clone(&device),
            listener: None,
        });

        // Registration delivers the current value, which queues the first write
        let listener = device.add_listener(Arc::new(OutputWatch {
            address,
            pending,
            handle: worker.clone(),
        }));
        if let Some(line) = ctx
            .expanders()
            .chips
            .get_mut(&address)
            .and_then(|chip| chip.outputs.iter_mut().rev().find(|l| l.device.id() == device.id()))
        {
            line.listener = Some(listener);
        }
    });
    Ok(())
}

/// Detach a device from the chip at `address`; the chip is dropped once
/// no lines remain
pub fn remove_line<C: ExpanderHost>(handle: &SchedulerHandle<C>, address: u8, id: DeviceId) {
    let worker = handle.clone();
    handle.enqueue(move |ctx: &mut C| {
        let arena = ctx.expanders();
        let Some(chip) = arena.chips.get_mut(&address) else {
            return;
        };
        if !chip.remove(id) || !chip.is_empty() {
            return;
        }

        if let Some(token) = chip.poll.take() {
            worker.unregister_poll(token);
        }
        arena.chips.remove(&address);
        arena.take_pending(address);
        debug!(target: "pihw::expander", "0x{:02X}: destroyed", address);
    });
}
