//! Device and connection events
//!
//! Listeners are invoked synchronously on whichever thread changed the
//! device, usually a transport worker. [`EventForwarder`] turns those calls
//! into owned [`DeviceEvent`]s on a tokio channel so consumers can process
//! them on their own runtime.

use tokio::sync::mpsc;

use crate::connection::ConnectionState;
use crate::device::{Device, DeviceId, Value};
use crate::error_level::ErrorLevel;

/// Observer of a single device
pub trait DeviceListener: Send + Sync {
    /// The device's value changed
    fn on_value_changed(&self, device: &Device);

    /// The device's error level changed
    fn on_error_level_changed(&self, _device: &Device) {}
}

/// Observer of a transport's connection state
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_changed(&self, transport: &str, state: ConnectionState);
}

/// Owned event describing a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A device reported a new value
    ValueChanged {
        id: DeviceId,
        name: String,
        value: Value,
    },

    /// A device's error level moved
    ErrorLevelChanged {
        id: DeviceId,
        name: String,
        level: ErrorLevel,
    },

    /// A transport connected, disconnected or started reconnecting
    ConnectionChanged {
        transport: String,
        state: ConnectionState,
    },
}

impl DeviceEvent {
    /// Device the event is about, if any
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            DeviceEvent::ValueChanged { id, .. } | DeviceEvent::ErrorLevelChanged { id, .. } => {
                Some(*id)
            }
            DeviceEvent::ConnectionChanged { .. } => None,
        }
    }

    /// Check if this is an error-related event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            DeviceEvent::ErrorLevelChanged { level, .. } if *level > ErrorLevel::Ok
        )
    }
}

/// Forwards listener callbacks into an unbounded channel
#[derive(Debug, Clone)]
pub struct EventForwarder {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl EventForwarder {
    pub fn new(tx: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self { tx }
    }

    /// Create a forwarder and the receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: DeviceEvent) {
        // A closed receiver only means nobody is watching any more
        let _ = self.tx.send(event);
    }
}

impl DeviceListener for EventForwarder {
    fn on_value_changed(&self, device: &Device) {
        self.send(DeviceEvent::ValueChanged {
            id: device.id(),
            name: device.name().to_string(),
            value: device.value(),
        });
    }

    fn on_error_level_changed(&self, device: &Device) {
        self.send(DeviceEvent::ErrorLevelChanged {
            id: device.id(),
            name: device.name().to_string(),
            level: device.error_level(),
        });
    }
}

impl ConnectionObserver for EventForwarder {
    fn on_connection_changed(&self, transport: &str, state: ConnectionState) {
        self.send(DeviceEvent::ConnectionChanged {
            transport: transport.to_string(),
            state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    #[test]
    fn test_forwarder_emits_owned_events() {
        let (forwarder, mut rx) = EventForwarder::channel();
        let device = Device::new(DeviceId(9), "door", DeviceKind::Button);
        device.add_listener(std::sync::Arc::new(forwarder));

        device.set_value(Value::Digital(true));
        device.handle_error(true, true);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[2],
            DeviceEvent::ValueChanged {
                id: DeviceId(9),
                name: "door".into(),
                value: Value::Digital(true)
            }
        );
        assert!(events[3].is_error());
        assert_eq!(events[3].device(), Some(DeviceId(9)));
    }
}
