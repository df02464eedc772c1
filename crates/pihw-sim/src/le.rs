//! Simulated low-energy key peripheral

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pihw_io::le::KEY_STATE_HANDLE;
use pihw_io::{LeConnectParams, LeLink, LeWait, WakeHook};

#[derive(Default)]
struct LeState {
    connected: bool,
    connects: usize,
    last_params: Option<LeConnectParams>,
    key_state: u8,
    notifications: VecDeque<u8>,
    drop_pending: bool,
    woken: bool,
}

struct Shared {
    state: Mutex<LeState>,
    changed: Condvar,
}

/// Four-key peripheral; clones share state
#[derive(Clone)]
pub struct SimLe {
    shared: Arc<Shared>,
}

impl Default for SimLe {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLe {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LeState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Press or release key `pin`; connected hosts are notified
    pub fn press(&self, pin: u8, pressed: bool) {
        let mut state = self.shared.state.lock();
        if pressed {
            state.key_state |= 1 << pin;
        } else {
            state.key_state &= !(1 << pin);
        }
        if state.connected {
            let key_state = state.key_state;
            state.notifications.push_back(key_state);
            self.shared.changed.notify_all();
        }
    }

    /// Make the host's next wait fail as if the peripheral went away
    pub fn drop_link(&self) {
        self.shared.state.lock().drop_pending = true;
        self.shared.changed.notify_all();
    }

    pub fn connects(&self) -> usize {
        self.shared.state.lock().connects
    }

    pub fn last_params(&self) -> Option<LeConnectParams> {
        self.shared.state.lock().last_params.clone()
    }
}

impl LeLink for SimLe {
    fn connect(&mut self, params: &LeConnectParams) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        state.connected = true;
        state.connects += 1;
        state.drop_pending = false;
        state.last_params = Some(params.clone());
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = self.shared.state.lock();
        state.connected = false;
        state.notifications.clear();
    }

    fn read_characteristic(&mut self, handle: u16) -> io::Result<Vec<u8>> {
        let state = self.shared.state.lock();
        if !state.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if handle != KEY_STATE_HANDLE {
            return Err(io::Error::other(format!("no characteristic 0x{:04X}", handle)));
        }
        Ok(vec![state.key_state])
    }

    fn wait_notification(&mut self, timeout: Option<Duration>) -> io::Result<LeWait> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if state.drop_pending {
                state.drop_pending = false;
                state.connected = false;
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            if let Some(value) = state.notifications.pop_front() {
                return Ok(LeWait::Notification {
                    handle: KEY_STATE_HANDLE,
                    value: vec![value],
                });
            }
            if state.woken {
                state.woken = false;
                return Ok(LeWait::Woken);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Ok(LeWait::TimedOut);
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
    }

    fn wake_hook(&self) -> WakeHook {
        let shared = Arc::clone(&self.shared);
        Arc::new(move || {
            shared.state.lock().woken = true;
            shared.changed.notify_all();
        })
    }

    fn describe(&self) -> String {
        "simulated key peripheral".to_string()
    }
}
