//! Connection state shared by the radio transports

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::events::ConnectionObserver;

/// Delay between connection attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Link state of a radio transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        })
    }
}

/// Tunables shared by the radio sessions
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Delay between connection attempts; defaults to one second
    pub reconnect_delay: Option<Duration>,
    /// Told about every connection state change
    pub observer: Option<Arc<dyn ConnectionObserver>>,
}

impl SessionOptions {
    pub(crate) fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay.unwrap_or(DEFAULT_RECONNECT_DELAY)
    }
}

/// Tracks one transport's state and reports transitions
pub(crate) struct ConnectionTracker {
    transport: String,
    state: ConnectionState,
    shared: Arc<Mutex<ConnectionState>>,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl ConnectionTracker {
    pub(crate) fn new(
        transport: impl Into<String>,
        observer: Option<Arc<dyn ConnectionObserver>>,
    ) -> Self {
        Self {
            transport: transport.into(),
            state: ConnectionState::Disconnected,
            shared: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            observer,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    /// State readable from outside the worker
    pub(crate) fn shared(&self) -> Arc<Mutex<ConnectionState>> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub(crate) fn transport(&self) -> &str {
        &self.transport
    }

    /// Move to `state`, returning `true` if that was a transition
    pub(crate) fn set(&mut self, state: ConnectionState) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        *self.shared.lock() = state;

        if let Some(observer) = &self.observer {
            observer.on_connection_changed(&self.transport, state);
        }
        true
    }
}
