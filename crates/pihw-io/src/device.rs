//! Logical devices
//!
//! A [`Device`] is the unit the rest of the installation talks about: a
//! button, a fader, a digital output or a motor. It carries the current
//! [`Value`], an [`ErrorLevel`] and a list of listeners. Devices are shared
//! as `Arc<Device>` between the configuration layer, transport workers and
//! observers; none of them owns the hardware behind it.
//!
//! # Override
//!
//! An overridden device is under manual control. [`Device::set_value`] is
//! ignored while the override is on, so neither the hardware (for inputs)
//! nor the application (for outputs) can move the value; only
//! [`Device::set_override_value`] does. Polled inputs skip the hardware
//! transaction entirely while overridden.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error_level::{ErrorLevel, ErrorTracker};
use crate::events::DeviceListener;

/// Opaque device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a device is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Digital input
    Button,
    /// Analog input, reported in percent
    Fader,
    /// Digital output
    Gpo,
    /// Bidirectional motor driver
    DcMotor,
    /// Driver channel switched fully on or off
    Relay,
    /// Driver channel with brightness in percent
    Led,
}

impl DeviceKind {
    pub fn is_input(&self) -> bool {
        matches!(self, DeviceKind::Button | DeviceKind::Fader)
    }

    /// Value a freshly created device starts with
    pub fn initial_value(&self) -> Value {
        match self {
            DeviceKind::Button | DeviceKind::Gpo | DeviceKind::Relay => Value::Digital(false),
            DeviceKind::Fader | DeviceKind::Led => Value::Percent(0),
            DeviceKind::DcMotor => Value::Speed(0),
        }
    }
}

/// Current value of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Digital(bool),
    /// 0..=100
    Percent(u8),
    /// -100..=100, negative is reverse
    Speed(i8),
}

impl Value {
    pub fn as_digital(&self) -> Option<bool> {
        match self {
            Value::Digital(on) => Some(*on),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Digital(on) => f.write_str(if *on { "on" } else { "off" }),
            Value::Percent(p) => write!(f, "{}%", p),
            Value::Speed(s) => write!(f, "speed {}", s),
        }
    }
}

/// Handle returned by [`Device::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

struct DeviceState {
    value: Value,
    errors: ErrorTracker,
    overridden: bool,
}

/// A logical input or output
pub struct Device {
    id: DeviceId,
    name: String,
    kind: DeviceKind,
    state: Mutex<DeviceState>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn DeviceListener>)>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &state.value)
            .field("error_level", &state.errors.level())
            .field("overridden", &state.overridden)
            .finish()
    }
}

impl Device {
    pub fn new(id: DeviceId, name: impl Into<String>, kind: DeviceKind) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            kind,
            state: Mutex::new(DeviceState {
                value: kind.initial_value(),
                errors: ErrorTracker::new(),
                overridden: false,
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn value(&self) -> Value {
        self.state.lock().value
    }

    pub fn error_level(&self) -> ErrorLevel {
        self.state.lock().errors.level()
    }

    pub fn is_overridden(&self) -> bool {
        self.state.lock().overridden
    }

    /// Set the value; listeners hear about it only if it changed
    ///
    /// Ignored while the device is overridden.
    pub fn set_value(&self, value: Value) {
        self.store(value, false);
    }

    /// Switch manual override on or off
    ///
    /// The value is left where it is; leaving the override lets the next
    /// regular update through.
    pub fn set_override(&self, on: bool) {
        let changed = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.overridden, on) != on
        };
        if changed {
            debug!(target: "pihw::device", "{} ({}) override {}", self.name, self.id, if on { "on" } else { "off" });
        }
    }

    /// Set the value under override
    ///
    /// Returns `false` and leaves the value alone if the override is off.
    pub fn set_override_value(&self, value: Value) -> bool {
        self.store(value, true)
    }

    fn store(&self, value: Value, overriding: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.overridden != overriding {
                return false;
            }
            if state.value == value {
                return true;
            }
            state.value = value;
        }

        debug!(target: "pihw::device", "{} ({}) -> {}", self.name, self.id, value);
        for listener in self.snapshot_listeners() {
            listener.on_value_changed(self);
        }
        true
    }

    /// Feed one transaction outcome through the hysteresis model
    pub fn handle_error(&self, occurred: bool, catastrophic: bool) {
        let level = {
            let mut state = self.state.lock();
            if !state.errors.handle_error(occurred, catastrophic) {
                return;
            }
            state.errors.level()
        };

        debug!(target: "pihw::device", "{} ({}) error level {}", self.name, self.id, level);
        for listener in self.snapshot_listeners() {
            listener.on_error_level_changed(self);
        }
    }

    /// Register a listener. It is immediately told the current value and
    /// error level so it never has to query them separately.
    pub fn add_listener(&self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::clone(&listener)));

        listener.on_value_changed(self);
        listener.on_error_level_changed(self);
        id
    }

    /// Remove a listener; unknown ids are ignored
    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn DeviceListener>> {
        self.listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        values: Mutex<Vec<Value>>,
        levels: Mutex<Vec<ErrorLevel>>,
    }

    impl DeviceListener for Recorder {
        fn on_value_changed(&self, device: &Device) {
            self.values.lock().push(device.value());
        }

        fn on_error_level_changed(&self, device: &Device) {
            self.levels.lock().push(device.error_level());
        }
    }

    #[test]
    fn test_listener_gets_current_state_on_registration() {
        let device = Device::new(DeviceId(1), "fader", DeviceKind::Fader);
        device.set_value(Value::Percent(40));

        let recorder = Arc::new(Recorder::default());
        device.add_listener(recorder.clone());

        assert_eq!(*recorder.values.lock(), vec![Value::Percent(40)]);
        assert_eq!(*recorder.levels.lock(), vec![ErrorLevel::Ok]);
    }

    #[test]
    fn test_unchanged_value_not_notified() {
        let device = Device::new(DeviceId(1), "button", DeviceKind::Button);
        let recorder = Arc::new(Recorder::default());
        device.add_listener(recorder.clone());

        device.set_value(Value::Digital(true));
        device.set_value(Value::Digital(true));
        device.set_value(Value::Digital(false));

        assert_eq!(
            *recorder.values.lock(),
            vec![
                Value::Digital(false),
                Value::Digital(true),
                Value::Digital(false)
            ]
        );
    }

    #[test]
    fn test_only_level_changes_notified() {
        let device = Device::new(DeviceId(2), "relay", DeviceKind::Gpo);
        let recorder = Arc::new(Recorder::default());
        device.add_listener(recorder.clone());

        device.handle_error(false, false); // already OK
        device.handle_error(true, false);
        device.handle_error(true, false);
        device.handle_error(true, false); // stays critical

        assert_eq!(
            *recorder.levels.lock(),
            vec![ErrorLevel::Ok, ErrorLevel::Warning, ErrorLevel::Critical]
        );
    }

    #[test]
    fn test_override_blocks_regular_updates() {
        let device = Device::new(DeviceId(4), "fader", DeviceKind::Fader);
        let recorder = Arc::new(Recorder::default());
        device.add_listener(recorder.clone());

        assert!(!device.set_override_value(Value::Percent(10)));
        device.set_override(true);
        assert!(device.is_overridden());

        device.set_value(Value::Percent(80));
        assert_eq!(device.value(), Value::Percent(0));
        assert!(device.set_override_value(Value::Percent(30)));
        assert_eq!(device.value(), Value::Percent(30));

        device.set_override(false);
        assert_eq!(device.value(), Value::Percent(30));
        device.set_value(Value::Percent(80));

        assert_eq!(
            *recorder.values.lock(),
            vec![Value::Percent(0), Value::Percent(30), Value::Percent(80)]
        );
    }

    #[test]
    fn test_removed_listener_silent() {
        let device = Device::new(DeviceId(3), "button", DeviceKind::Button);
        let recorder = Arc::new(Recorder::default());
        let id = device.add_listener(recorder.clone());
        device.remove_listener(id);

        device.set_value(Value::Digital(true));
        assert_eq!(recorder.values.lock().len(), 1);
    }
}
