use crate::event::RawState;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Last-known raw value per sensor, keyed by wire name.
///
/// Two consumers: the relay replays this snapshot to newly connected clients,
/// and the hub reads previous switch states to populate
/// [`SwitchChange::prev_state`](crate::event::SwitchChange) and to re-derive
/// mute counts after a session refresh.
#[derive(Default)]
pub struct DeviceState {
    sensors: Mutex<HashMap<String, Value>>,
    switches: Mutex<HashMap<u16, bool>>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a state update. For switches, returns the previous state.
    pub fn record(&self, raw: &RawState) -> Option<bool> {
        self.sensors
            .lock()
            .unwrap()
            .insert(raw.wire_name(), raw.json_value());

        match raw {
            RawState::Switch { id, state } => {
                self.switches.lock().unwrap().insert(*id, *state)
            }
            RawState::Pot { .. } => None,
        }
    }

    /// The last seen state of one switch, if any event has arrived for it.
    pub fn switch_state(&self, switch_id: u16) -> Option<bool> {
        self.switches.lock().unwrap().get(&switch_id).copied()
    }

    /// All known switch states.
    pub fn switch_states(&self) -> HashMap<u16, bool> {
        self.switches.lock().unwrap().clone()
    }

    /// Snapshot of every known sensor value, for relay replay.
    pub fn snapshot(&self) -> Vec<(String, Value)> {
        let mut entries: Vec<_> = self
            .sensors
            .lock()
            .unwrap()
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect();
        // deterministic replay order
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
